//! Artifact upload after a successful merge.
//!
//! Uploading is optional and never decides the job outcome: a failed upload
//! is logged and the job still completes with its local recording path.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable names passed to the upload command.
pub mod upload_env {
    pub const JOB_ID: &str = "MEETBOT_JOB_ID";
    pub const ARTIFACT_PATH: &str = "MEETBOT_ARTIFACT_PATH";
    pub const MEETING_URL: &str = "MEETBOT_MEETING_URL";
}

/// The finished recording of one job.
pub struct Artifact {
    pub job_id: i64,
    pub meeting_url: String,
    pub path: PathBuf,
}

#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    /// Upload `artifact`. Returns its public URL when the destination
    /// reports one.
    async fn upload(&self, artifact: &Artifact) -> Result<Option<String>>;
}

/// Runs a shell command with the artifact described in the environment.
/// The last non-empty line the command prints is taken as the public URL.
pub struct ShellCommandUploader {
    command: String,
    timeout: Duration,
}

impl ShellCommandUploader {
    pub fn new(command: String, timeout_seconds: u64) -> Self {
        Self {
            command,
            timeout: Duration::from_secs(timeout_seconds),
        }
    }

    /// Uploader for the configured command, `None` when uploads are disabled.
    pub fn from_config(config: &crate::config::UploadConfig) -> Option<Self> {
        let command = config.command.trim();
        if command.is_empty() {
            return None;
        }
        Some(Self::new(command.to_string(), config.timeout_seconds))
    }
}

#[async_trait]
impl ArtifactUploader for ShellCommandUploader {
    async fn upload(&self, artifact: &Artifact) -> Result<Option<String>> {
        info!(
            "Uploading recording for job {}: {}",
            artifact.job_id, self.command
        );

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(upload_env::JOB_ID, artifact.job_id.to_string())
            .env(upload_env::ARTIFACT_PATH, path_env(&artifact.path))
            .env(upload_env::MEETING_URL, &artifact.meeting_url)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => bail!(
                "upload command timed out after {}s",
                self.timeout.as_secs()
            ),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "upload command exited with status {}: {}",
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let url = last_line(&stdout);
        match &url {
            Some(url) => info!("Recording for job {} uploaded: {}", artifact.job_id, url),
            None => warn!(
                "Upload command for job {} succeeded without printing a URL",
                artifact.job_id
            ),
        }
        Ok(url)
    }
}

fn path_env(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn last_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
}
