//! One job, start to finish: join, record, detect the end, tear down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::audio::{AudioDevice, CaptureRecorder, DeviceHandle, MergeOutcome};
use crate::config::AgentConfig;
use crate::db::JobStore;
use crate::session::{join_session, ExitNotifier, ExitWatcher, Provider, SessionDriver};
use crate::upload::{Artifact, ArtifactUploader};

use super::heartbeat::Heartbeat;
use super::AgentError;

/// Timings of one agent run.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub heartbeat_interval: Duration,
    pub join_timeout: Duration,
    pub join_poll_interval: Duration,
    pub exit_check_interval: Duration,
    pub exit_grace_period: Duration,
}

impl From<&AgentConfig> for AgentSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            join_timeout: config.join_timeout(),
            join_poll_interval: config.join_poll_interval(),
            exit_check_interval: config.exit_check_interval(),
            exit_grace_period: config.exit_grace_period(),
        }
    }
}

/// How a run ended when nothing went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Completed {
        artifact: PathBuf,
        recording_url: Option<String>,
    },
    /// The session ended before a single segment was written.
    NoAudio,
}

pub struct AgentRunner {
    store: JobStore,
    device: Arc<dyn AudioDevice>,
    recorder: CaptureRecorder,
    driver: Arc<dyn SessionDriver>,
    uploader: Option<Arc<dyn ArtifactUploader>>,
    settings: AgentSettings,
}

impl AgentRunner {
    pub fn new(
        store: JobStore,
        device: Arc<dyn AudioDevice>,
        recorder: CaptureRecorder,
        driver: Arc<dyn SessionDriver>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            store,
            device,
            recorder,
            driver,
            uploader: None,
            settings,
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn ArtifactUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Run job `job_id` until the meeting ends or `notifier` fires.
    ///
    /// The job's terminal status is written before this returns: `completed`
    /// on success, `failed` otherwise (including [`AgentOutcome::NoAudio`]).
    /// The heartbeat runs from device acquisition until capture is stopped, so
    /// a long lobby wait is never mistaken for a crash.
    pub async fn run(
        &self,
        job_id: i64,
        url: &str,
        notifier: ExitNotifier,
    ) -> Result<AgentOutcome, AgentError> {
        info!("Agent started for job {} ({})", job_id, url);

        let Some(provider) = Provider::from_url(url) else {
            return Err(self
                .fail(job_id, AgentError::UnsupportedUrl(url.to_string()))
                .await);
        };

        let device = match self.device.acquire(job_id) {
            Ok(device) => device,
            Err(e) => return Err(self.fail(job_id, e.into()).await),
        };

        let mut heartbeat = Some(Heartbeat::spawn(
            self.store.clone(),
            job_id,
            self.settings.heartbeat_interval,
        ));
        let recorded = self
            .record(job_id, url, provider, &device, &notifier, &mut heartbeat)
            .await;

        if let Some(heartbeat) = heartbeat.take() {
            heartbeat.stop().await;
        }
        if recorded.is_err() {
            if let Err(e) = self.recorder.stop(job_id).await {
                warn!("Failed to stop capture for job {}: {}", job_id, e);
            }
        }
        self.device.release(&device);
        self.driver.close().await;

        match recorded {
            Ok(MergeOutcome::Merged {
                artifact,
                segment_count,
            }) => {
                info!(
                    "Job {} recorded {} segment(s) into {:?}",
                    job_id, segment_count, artifact
                );
                self.complete(job_id, url, artifact).await
            }
            Ok(MergeOutcome::NoSegments) => {
                warn!("Job {} ended without any captured audio", job_id);
                if let Err(e) = self.store.blocking(move |s| s.mark_failed(job_id)).await {
                    error!("Failed to mark job {} failed: {}", job_id, e);
                }
                Ok(AgentOutcome::NoAudio)
            }
            Err(e) => Err(self.fail(job_id, e).await),
        }
    }

    async fn record(
        &self,
        job_id: i64,
        url: &str,
        provider: Provider,
        device: &DeviceHandle,
        notifier: &ExitNotifier,
        heartbeat: &mut Option<Heartbeat>,
    ) -> Result<MergeOutcome, AgentError> {
        tokio::select! {
            joined = join_session(
                self.driver.as_ref(),
                provider,
                url,
                self.settings.join_timeout,
                self.settings.join_poll_interval,
            ) => joined?,
            reason = notifier.wait() => {
                let reason = reason.map(|r| r.to_string()).unwrap_or_default();
                return Err(AgentError::Interrupted(reason));
            }
        }

        self.recorder.start(job_id, device).await?;

        let watcher = ExitWatcher::new(
            provider,
            self.settings.exit_check_interval,
            self.settings.exit_grace_period,
        )
        .spawn(Arc::clone(&self.driver), notifier.clone());

        info!("Job {} recording", job_id);
        let reason = notifier.wait().await;
        info!(
            "Job {} shutting down: {}",
            job_id,
            reason.map(|r| r.to_string()).unwrap_or_default()
        );
        if let Err(e) = watcher.await {
            warn!("Exit watcher for job {} ended abnormally: {}", job_id, e);
        }

        if let Some(heartbeat) = heartbeat.take() {
            heartbeat.stop().await;
        }

        self.recorder
            .stop(job_id)
            .await?
            .ok_or(AgentError::CaptureNotRunning)
    }

    /// Write `completed` first, then upload. The job must not sit in
    /// `running` without a heartbeat for as long as an upload can take.
    async fn complete(
        &self,
        job_id: i64,
        url: &str,
        artifact: PathBuf,
    ) -> Result<AgentOutcome, AgentError> {
        let path = artifact.to_string_lossy().into_owned();

        let local = path.clone();
        if let Err(e) = self
            .store
            .blocking(move |s| s.set_recording(job_id, &local, None))
            .await
        {
            warn!("Failed to record artifact location for job {}: {}", job_id, e);
        }

        if let Err(e) = self.store.blocking(move |s| s.mark_completed(job_id)).await {
            return Err(self.fail(job_id, e.into()).await);
        }
        info!("Job {} completed", job_id);

        let recording_url = match &self.uploader {
            Some(uploader) => {
                let upload = Artifact {
                    job_id,
                    meeting_url: url.to_string(),
                    path: artifact.clone(),
                };
                match uploader.upload(&upload).await {
                    Ok(url) => url,
                    Err(e) => {
                        warn!("Upload for job {} failed, keeping local file: {}", job_id, e);
                        None
                    }
                }
            }
            None => None,
        };

        if let Some(public) = recording_url.clone() {
            if let Err(e) = self
                .store
                .blocking(move |s| s.set_recording(job_id, &path, Some(&public)))
                .await
            {
                warn!("Failed to record upload URL for job {}: {}", job_id, e);
            }
        }

        Ok(AgentOutcome::Completed {
            artifact,
            recording_url,
        })
    }

    async fn fail(&self, job_id: i64, err: AgentError) -> AgentError {
        error!("Job {} failed: {}", job_id, err);
        if let Err(e) = self.store.blocking(move |s| s.mark_failed(job_id)).await {
            error!("Failed to mark job {} failed: {}", job_id, e);
        }
        err
    }
}
