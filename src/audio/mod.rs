//! Per-job audio capture: isolated devices, segmented recording and the
//! final merge.

pub mod capture;
pub mod device;
pub mod merge;

use std::sync::Arc;
use thiserror::Error;

pub use capture::{CaptureCommand, CaptureRecorder, FfmpegPulseCapture};
pub use device::{AudioDevice, DeviceHandle, PulseSinkDevice};
pub use merge::{FfmpegConcatMerger, MergeOutcome, SegmentMerger, WavConcatMerger};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device error: {0}")]
    Device(String),

    #[error("failed to spawn capture process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("merge failed: {0}")]
    Merge(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Pick the concat backend: ffmpeg when installed, otherwise the built-in
/// WAV writer.
pub fn default_merger() -> Arc<dyn SegmentMerger> {
    if merge::check_ffmpeg_available() {
        Arc::new(FfmpegConcatMerger)
    } else {
        tracing::warn!("FFmpeg not found, merging segments with the built-in WAV writer");
        Arc::new(WavConcatMerger)
    }
}
