//! Segmented capture from a job's device.
//!
//! One capture process per job writes fixed-length WAV segments into
//! `<recordings>/<job_id>/`. Stopping asks the process to finish its current
//! segment (`q` on stdin), kills it if it does not exit in time, then merges
//! whatever segments exist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::device::DeviceHandle;
use super::merge::{self, MergeOutcome, SegmentMerger, SEGMENT_EXTENSION, SEGMENT_PREFIX};
use super::CaptureError;

/// Builds the capture process for a device.
pub trait CaptureCommand: Send + Sync {
    /// `segment_pattern` is a printf-style path (`chunk_%05d.wav`); numbering
    /// must begin at `start_number`.
    fn build(&self, device: &DeviceHandle, segment_pattern: &Path, start_number: u32) -> Command;
}

/// `ffmpeg -f pulse` reading the device's monitor source.
#[derive(Debug, Clone)]
pub struct FfmpegPulseCapture {
    pub segment_seconds: u64,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for FfmpegPulseCapture {
    fn default() -> Self {
        Self {
            segment_seconds: 60,
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

impl CaptureCommand for FfmpegPulseCapture {
    fn build(&self, device: &DeviceHandle, segment_pattern: &Path, start_number: u32) -> Command {
        let monitor = device.monitor_source();
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", "pulse", "-i", &monitor])
            .args(["-ac", &self.channels.to_string()])
            .args(["-ar", &self.sample_rate.to_string()])
            .args(["-c:a", "pcm_s16le"])
            .args(["-f", "segment"])
            .args(["-segment_time", &self.segment_seconds.to_string()])
            .args(["-segment_start_number", &start_number.to_string()])
            .args(["-reset_timestamps", "1"])
            .arg(segment_pattern)
            .env("PULSE_SINK", device.name())
            .env("PULSE_SOURCE", &monitor);
        cmd
    }
}

struct AudioSession {
    device: DeviceHandle,
    child: Child,
    segment_dir: PathBuf,
    started_at: Instant,
}

enum SessionState {
    Capturing(AudioSession),
    Stopping,
}

/// Per-job capture sessions. Cheap to clone; clones share the session map.
#[derive(Clone)]
pub struct CaptureRecorder {
    sessions: Arc<Mutex<HashMap<i64, SessionState>>>,
    base_dir: PathBuf,
    command: Arc<dyn CaptureCommand>,
    merger: Arc<dyn SegmentMerger>,
    stop_timeout: Duration,
}

impl CaptureRecorder {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        command: Arc<dyn CaptureCommand>,
        merger: Arc<dyn SegmentMerger>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            base_dir: base_dir.into(),
            command,
            merger,
            stop_timeout,
        }
    }

    /// Directory holding a job's segments and final artifact.
    pub fn segment_dir(&self, job_id: i64) -> PathBuf {
        self.base_dir.join(job_id.to_string())
    }

    pub async fn is_active(&self, job_id: i64) -> bool {
        self.sessions.lock().await.contains_key(&job_id)
    }

    /// Start capturing `device` for `job_id`.
    ///
    /// Returns `Ok(false)` without side effects when the job already has a
    /// session. Segments left by an earlier attempt are kept and new ones are
    /// numbered after them.
    pub async fn start(&self, job_id: i64, device: &DeviceHandle) -> Result<bool, CaptureError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&job_id) {
            warn!("Capture already active for job {}, ignoring start", job_id);
            return Ok(false);
        }

        let segment_dir = self.segment_dir(job_id);
        std::fs::create_dir_all(&segment_dir)?;

        let start_number = merge::next_segment_number(&segment_dir);
        let pattern = segment_dir.join(format!("{SEGMENT_PREFIX}%05d.{SEGMENT_EXTENSION}"));

        let mut cmd = self.command.build(device, &pattern, start_number);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(CaptureError::Spawn)?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job_id, "capture: {}", line);
                }
            });
        }

        info!(
            "Capture started for job {} on {} (pid {:?}, first segment {})",
            job_id,
            device.name(),
            child.id(),
            start_number
        );

        sessions.insert(
            job_id,
            SessionState::Capturing(AudioSession {
                device: device.clone(),
                child,
                segment_dir,
                started_at: Instant::now(),
            }),
        );
        Ok(true)
    }

    /// Stop the job's capture and merge its segments.
    ///
    /// Only the first caller does the work; later or concurrent calls get
    /// `Ok(None)`. The session is forgotten once the process is gone, even
    /// when the merge fails.
    pub async fn stop(&self, job_id: i64) -> Result<Option<MergeOutcome>, CaptureError> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&job_id) {
                None => {
                    debug!("No capture session for job {}", job_id);
                    return Ok(None);
                }
                Some(SessionState::Stopping) => {
                    debug!("Capture for job {} is already stopping", job_id);
                    return Ok(None);
                }
                Some(SessionState::Capturing(_)) => {}
            }
            match sessions.insert(job_id, SessionState::Stopping) {
                Some(SessionState::Capturing(session)) => session,
                _ => return Ok(None),
            }
        };

        let AudioSession {
            device,
            mut child,
            segment_dir,
            started_at,
        } = session;

        let stopped = stop_process(&mut child, self.stop_timeout).await;
        info!(
            "Capture stopped for job {} on {} after {}s",
            job_id,
            device.name(),
            started_at.elapsed().as_secs()
        );

        let result = match stopped {
            Ok(()) => merge::merge_segments(&segment_dir, self.merger.as_ref()).await,
            Err(e) => Err(e),
        };

        self.sessions.lock().await.remove(&job_id);
        result.map(Some)
    }
}

/// Ask the capture process to quit, force-kill it after `timeout`.
async fn stop_process(child: &mut Child, timeout: Duration) -> Result<(), CaptureError> {
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(b"q").await {
            debug!("Capture process stdin closed early: {}", e);
        }
        let _ = stdin.shutdown().await;
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("Capture process exited with {}", status);
            Ok(())
        }
        Ok(Err(e)) => Err(CaptureError::Io(e)),
        Err(_) => {
            warn!(
                "Capture process did not exit within {:?}, killing it",
                timeout
            );
            child.kill().await?;
            Ok(())
        }
    }
}
