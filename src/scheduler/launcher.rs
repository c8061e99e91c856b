use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::info;

/// How an agent process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExit {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl AgentExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for AgentExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "signal"),
        }
    }
}

/// Starts the agent for a claimed job and resolves when it has exited.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, job_id: i64, meeting_url: &str) -> Result<AgentExit>;
}

/// Runs `<program> agent <job_id> <url>` as a child process. The agent
/// inherits stdout/stderr so its logs join the scheduler's stream.
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Launch agents with the running executable.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate current executable")?;
        Ok(Self::new(program))
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(&self, job_id: i64, meeting_url: &str) -> Result<AgentExit> {
        let mut child = tokio::process::Command::new(&self.program)
            .arg("agent")
            .arg(job_id.to_string())
            .arg(meeting_url)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn agent {:?}", self.program))?;

        info!("Agent for job {} started (pid {:?})", job_id, child.id());

        let status = child.wait().await?;
        Ok(AgentExit {
            code: status.code(),
        })
    }
}
