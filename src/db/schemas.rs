use serde::{Deserialize, Serialize};

use super::StoreError;

/// Lifecycle state of a meeting job.
///
/// Valid transitions: scheduled → running, running → completed,
/// running → failed, running → scheduled (revival).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Scheduled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled meeting job as persisted in the `meeting_jobs` table.
/// All timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingJob {
    pub id: i64,
    pub meeting_url: String,
    pub join_at: i64,
    pub status: JobStatus,
    pub attempts: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_heartbeat: Option<i64>,
    pub recording_path: Option<String>,
    pub recording_url: Option<String>,
}

impl MeetingJob {
    pub(crate) const COLUMNS: &'static str = "id, meeting_url, join_at, status, attempts, \
         created_at, updated_at, last_heartbeat, recording_path, recording_url";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MeetingJob> {
        let status: String = row.get(3)?;
        let status = JobStatus::parse(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(MeetingJob {
            id: row.get(0)?,
            meeting_url: row.get(1)?,
            join_at: row.get(2)?,
            status,
            attempts: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            last_heartbeat: row.get(7)?,
            recording_path: row.get(8)?,
            recording_url: row.get(9)?,
        })
    }
}
