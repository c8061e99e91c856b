use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use crate::agent::{exit_code, exit_code_for, AgentRunner, AgentSettings};
use crate::app::shutdown_signal;
use crate::audio::{self, CaptureRecorder, DeviceHandle, FfmpegPulseCapture, PulseSinkDevice};
use crate::config::Config;
use crate::db::JobStore;
use crate::global;
use crate::session::{CommandSessionDriver, ExitNotifier, ExitReason};
use crate::upload::ShellCommandUploader;

use super::args::AgentCliArgs;

/// Run one job to completion. Returns the process exit code.
pub async fn handle_agent_command(args: AgentCliArgs) -> i32 {
    let runner = match build_runner(args.job_id) {
        Ok(runner) => runner,
        Err(e) => {
            error!("Agent for job {} could not start: {:#}", args.job_id, e);
            return exit_code::FAILED;
        }
    };

    let notifier = ExitNotifier::new();
    let on_signal = notifier.clone();
    tokio::spawn(async move {
        let name = shutdown_signal().await;
        on_signal.fire(ExitReason::Signal(name));
    });

    let result = runner.run(args.job_id, &args.url, notifier).await;
    let code = exit_code_for(&result);
    info!("Agent for job {} exiting with code {}", args.job_id, code);
    code
}

fn build_runner(job_id: i64) -> Result<AgentRunner> {
    let config = Config::load()?;
    let store = JobStore::open_default()?;

    let capture = FfmpegPulseCapture {
        segment_seconds: u64::from(config.audio.segment_seconds),
        sample_rate: config.audio.sample_rate,
        channels: config.audio.channels,
    };
    let recorder = CaptureRecorder::new(
        global::recordings_dir()?,
        Arc::new(capture),
        audio::default_merger(),
        config.audio.stop_timeout(),
    );

    let sink = DeviceHandle::for_job(job_id);
    let driver = CommandSessionDriver::new(
        config.agent.driver_command.clone(),
        sink.name(),
        config.agent.is_headless(),
    );

    let mut runner = AgentRunner::new(
        store,
        Arc::new(PulseSinkDevice::new()),
        recorder,
        Arc::new(driver),
        AgentSettings::from(&config.agent),
    );
    if let Some(uploader) = ShellCommandUploader::from_config(&config.upload) {
        runner = runner.with_uploader(Arc::new(uploader));
    }
    Ok(runner)
}
