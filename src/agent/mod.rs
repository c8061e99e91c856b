//! The per-job agent process.
//!
//! An agent owns exactly one job. It is started by the scheduler after the
//! claim, writes heartbeats from device acquisition until capture stops, and
//! is the only writer of `completed` for its job.

pub mod heartbeat;
pub mod runner;


use thiserror::Error;

use crate::audio::CaptureError;
use crate::db::StoreError;
use crate::session::SessionError;

pub use heartbeat::Heartbeat;
pub use runner::{AgentOutcome, AgentRunner, AgentSettings};

/// Process exit codes of `meetbot agent`.
pub mod exit_code {
    pub const COMPLETED: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const NO_AUDIO: i32 = 3;
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unsupported meeting URL: {0}")]
    UnsupportedUrl(String),

    #[error("interrupted before recording started: {0}")]
    Interrupted(String),

    #[error("capture was not running at shutdown")]
    CaptureNotRunning,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Exit code for the result of [`AgentRunner::run`].
pub fn exit_code_for(result: &Result<AgentOutcome, AgentError>) -> i32 {
    match result {
        Ok(AgentOutcome::Completed { .. }) => exit_code::COMPLETED,
        Ok(AgentOutcome::NoAudio) => exit_code::NO_AUDIO,
        Err(_) => exit_code::FAILED,
    }
}
