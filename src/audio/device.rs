//! Per-job isolated capture devices.
//!
//! Every job gets its own PulseAudio null sink named after the job id. The
//! browser plays into that sink and the recorder reads its monitor source, so
//! concurrent jobs never hear each other. The system default sink is never
//! touched, and there is no shared state to lock: isolation comes from the name.

use std::process::Command;
use tracing::{debug, info, warn};

use super::CaptureError;

const SINK_PREFIX: &str = "meetbot_job_";

/// Opaque name of a job's capture device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    job_id: i64,
    name: String,
}

impl DeviceHandle {
    pub fn for_job(job_id: i64) -> Self {
        Self {
            job_id,
            name: format!("{SINK_PREFIX}{job_id}"),
        }
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// Sink the meeting audio is routed into.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source the recorder reads from.
    pub fn monitor_source(&self) -> String {
        format!("{}.monitor", self.name)
    }
}

/// Acquire and release job-scoped capture devices.
pub trait AudioDevice: Send + Sync {
    /// Create (or reuse) the device bound to `job_id`. Idempotent, so a
    /// duplicated agent for the same job lands on the same device.
    fn acquire(&self, job_id: i64) -> Result<DeviceHandle, CaptureError>;

    /// Remove the device. Never fails; problems are logged.
    fn release(&self, handle: &DeviceHandle);
}

/// Null-sink devices managed through `pactl`.
#[derive(Debug, Default, Clone)]
pub struct PulseSinkDevice;

impl PulseSinkDevice {
    pub fn new() -> Self {
        Self
    }

    fn pactl(args: &[&str]) -> Result<String, CaptureError> {
        let output = Command::new("pactl")
            .args(args)
            .output()
            .map_err(|e| CaptureError::Device(format!("failed to run pactl: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::Device(format!(
                "pactl {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Check if `pactl` is available on the system.
pub fn check_pactl_available() -> bool {
    Command::new("pactl")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

impl AudioDevice for PulseSinkDevice {
    fn acquire(&self, job_id: i64) -> Result<DeviceHandle, CaptureError> {
        let handle = DeviceHandle::for_job(job_id);

        let sinks = Self::pactl(&["list", "short", "sinks"])?;
        if sink_listed(&sinks, handle.name()) {
            info!("Reusing existing sink {} for job {}", handle.name(), job_id);
            return Ok(handle);
        }

        Self::pactl(&[
            "load-module",
            "module-null-sink",
            &format!("sink_name={}", handle.name()),
            &format!("sink_properties=device.description={}", handle.name()),
        ])?;

        info!("Created isolated sink {} for job {}", handle.name(), job_id);
        Ok(handle)
    }

    fn release(&self, handle: &DeviceHandle) {
        let modules = match Self::pactl(&["list", "short", "modules"]) {
            Ok(modules) => modules,
            Err(e) => {
                warn!("Could not list modules to release {}: {}", handle.name(), e);
                return;
            }
        };

        let Some(module_id) = module_for_sink(&modules, handle.name()) else {
            debug!("Sink {} already gone", handle.name());
            return;
        };

        match Self::pactl(&["unload-module", &module_id]) {
            Ok(_) => info!("Removed sink {} (module {})", handle.name(), module_id),
            Err(e) => warn!("Failed to remove sink {}: {}", handle.name(), e),
        }
    }
}

/// Whether `pactl list short sinks` output contains exactly `sink_name`.
fn sink_listed(output: &str, sink_name: &str) -> bool {
    output
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .any(|name| name == sink_name)
}

/// Module id that created `sink_name`, from `pactl list short modules` output.
fn module_for_sink(output: &str, sink_name: &str) -> Option<String> {
    let needle = format!("sink_name={sink_name}");
    output.lines().find_map(|line| {
        let mut columns = line.split('\t');
        let id = columns.next()?;
        let _module = columns.next()?;
        let args = columns.next().unwrap_or_default();
        args.split_whitespace()
            .any(|arg| arg == needle)
            .then(|| id.trim().to_string())
    })
}
