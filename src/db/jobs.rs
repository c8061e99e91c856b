//! Meeting job persistence and state transitions.

use anyhow::Result;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::schemas::{JobStatus, MeetingJob};
use super::StoreError;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Handle to the job ledger. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Open the store at the default data location.
    pub fn open_default() -> Result<Self> {
        Ok(Self::from_connection(super::init_db()?))
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_connection(super::open_db(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        super::migrate(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a job in `scheduled` state. Returns the new job id.
    pub fn insert(&self, meeting_url: &str, join_at: i64) -> Result<i64, StoreError> {
        let now = now_ms();
        let conn = self.conn();

        let result = conn.execute(
            "INSERT INTO meeting_jobs (meeting_url, join_at, status, attempts, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
            params![meeting_url, join_at, JobStatus::Scheduled.as_str(), now],
        );

        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate {
                    url: meeting_url.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Scheduled jobs whose join time has passed, oldest `join_at` first
    /// (insertion order on ties).
    pub fn get_next_due_jobs(&self, now: i64, limit: usize) -> Result<Vec<MeetingJob>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM meeting_jobs \
             WHERE status = ?1 AND join_at <= ?2 \
             ORDER BY join_at ASC, id ASC LIMIT ?3",
            MeetingJob::COLUMNS
        ))?;

        let jobs = stmt
            .query_map(
                params![JobStatus::Scheduled.as_str(), now, limit as i64],
                MeetingJob::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(jobs)
    }

    /// Claim a job: scheduled → running as a single conditional update.
    ///
    /// Fails with [`StoreError::ClaimConflict`] when another actor already
    /// claimed it or it is no longer scheduled.
    pub fn mark_running(&self, id: i64) -> Result<(), StoreError> {
        let now = now_ms();
        let changed = self.conn().execute(
            "UPDATE meeting_jobs \
             SET status = ?1, attempts = attempts + 1, last_heartbeat = ?2, updated_at = ?2 \
             WHERE id = ?3 AND status = ?4",
            params![
                JobStatus::Running.as_str(),
                now,
                id,
                JobStatus::Scheduled.as_str()
            ],
        )?;

        if changed == 0 {
            return Err(StoreError::ClaimConflict { id });
        }
        debug!("Job {} claimed", id);
        Ok(())
    }

    pub fn mark_completed(&self, id: i64) -> Result<(), StoreError> {
        self.set_terminal(id, JobStatus::Completed)
    }

    pub fn mark_failed(&self, id: i64) -> Result<(), StoreError> {
        self.set_terminal(id, JobStatus::Failed)
    }

    /// Unconditional terminal write. Repeating it is a no-op; any other
    /// transition the lifecycle does not allow is written anyway and logged.
    fn set_terminal(&self, id: i64, status: JobStatus) -> Result<(), StoreError> {
        let conn = self.conn();
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM meeting_jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let current = match current {
            Some(raw) => JobStatus::parse(&raw)?,
            None => return Err(StoreError::NotFound { id }),
        };

        if current == status {
            debug!("Job {} already {}", id, status);
            return Ok(());
        }
        if !current.can_transition_to(status) {
            let kind = if current.is_terminal() { "terminal" } else { "live" };
            warn!(
                "Job {} moving from {} state {} to {} outside its lifecycle",
                id, kind, current, status
            );
        }

        conn.execute(
            "UPDATE meeting_jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_ms(), id],
        )?;
        Ok(())
    }

    /// Run store calls on the blocking pool so a busy database never stalls
    /// a runtime worker.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&JobStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// [`JobStore::update_heartbeat`] off the runtime threads.
    pub async fn beat(&self, id: i64) {
        let store = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || store.update_heartbeat(id)).await {
            warn!("Heartbeat task for job {} failed (ignored): {}", id, e);
        }
    }

    /// Record agent liveness.
    ///
    /// Best effort: any failure is logged and dropped here so that liveness
    /// reporting can never take down the agent. A missed beat only matters if
    /// enough of them pile up to cross the staleness threshold.
    pub fn update_heartbeat(&self, id: i64) {
        let now = now_ms();
        let result = self.conn().execute(
            "UPDATE meeting_jobs SET last_heartbeat = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        );

        match result {
            Ok(0) => warn!("Heartbeat for job {} matched no row", id),
            Ok(_) => debug!("Heartbeat written for job {}", id),
            Err(e) => warn!("Heartbeat write for job {} failed (ignored): {}", id, e),
        }
    }

    /// Running jobs whose last heartbeat is older than `threshold`.
    pub fn get_stale_running(&self, threshold: Duration) -> Result<Vec<MeetingJob>, StoreError> {
        self.get_stale_running_at(now_ms(), threshold)
    }

    pub fn get_stale_running_at(
        &self,
        now: i64,
        threshold: Duration,
    ) -> Result<Vec<MeetingJob>, StoreError> {
        let cutoff = now - threshold.as_millis() as i64;
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM meeting_jobs \
             WHERE status = ?1 AND last_heartbeat IS NOT NULL AND last_heartbeat < ?2 \
             ORDER BY id ASC",
            MeetingJob::COLUMNS
        ))?;

        let jobs = stmt
            .query_map(
                params![JobStatus::Running.as_str(), cutoff],
                MeetingJob::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(jobs)
    }

    /// Return a presumed-crashed job to `scheduled`. `attempts` is kept.
    ///
    /// Only applies to running jobs; returns `false` if the job reached another
    /// state between the stale scan and this call.
    pub fn revive(&self, id: i64) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE meeting_jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                JobStatus::Scheduled.as_str(),
                now_ms(),
                id,
                JobStatus::Running.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Attach the merged artifact location (and public URL, once uploaded).
    pub fn set_recording(
        &self,
        id: i64,
        recording_path: &str,
        recording_url: Option<&str>,
    ) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE meeting_jobs SET recording_path = ?1, recording_url = ?2, updated_at = ?3 \
             WHERE id = ?4",
            params![recording_path, recording_url, now_ms(), id],
        )?;

        if changed == 0 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<MeetingJob>, StoreError> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!("SELECT {} FROM meeting_jobs WHERE id = ?1", MeetingJob::COLUMNS),
                params![id],
                MeetingJob::from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// List jobs, most recently scheduled first.
    pub fn list(&self, limit: usize) -> Result<Vec<MeetingJob>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM meeting_jobs ORDER BY join_at DESC, id DESC LIMIT ?1",
            MeetingJob::COLUMNS
        ))?;

        let jobs = stmt
            .query_map(params![limit as i64], MeetingJob::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(jobs)
    }
}
