use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use which::which;

use crate::audio::device::check_pactl_available;
use crate::audio::merge::check_ffmpeg_available;
use crate::config::Config;
use crate::db::JobStore;
use crate::scheduler::{CrashRecovery, ProcessLauncher, Scheduler};

/// Run the scheduler daemon until SIGINT/SIGTERM, then wait for running
/// agents to finish.
pub async fn run_service() -> Result<()> {
    info!("Starting meetbot scheduler");

    let config = Config::load()?;
    let store = JobStore::open_default()?;

    if !check_ffmpeg_available() {
        warn!("ffmpeg not found; agents will not be able to record");
    }
    if !check_pactl_available() {
        warn!("pactl not found; agents will not be able to create capture devices");
    }
    let driver = config.agent.driver_command.split_whitespace().next().unwrap_or("");
    if which(driver).is_err() {
        warn!("Session driver {:?} not found on PATH; agents will fail to join", driver);
    }

    let launcher = Arc::new(ProcessLauncher::current_exe()?);
    let scheduler = Scheduler::new(store.clone(), launcher, &config.scheduler);
    let recovery = CrashRecovery::new(
        store,
        config.scheduler.stale_threshold(),
        config.scheduler.max_attempts,
    );

    let shutdown = CancellationToken::new();

    let recovery_interval = config.scheduler.recovery_interval();
    let recovery_token = shutdown.clone();
    let recovery_task =
        tokio::spawn(async move { recovery.run(recovery_interval, recovery_token).await });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let name = shutdown_signal().await;
        info!("Received {}, shutting down", name);
        signal_token.cancel();
    });

    info!("meetbot is ready!");
    scheduler.run(shutdown).await;

    if let Err(e) = recovery_task.await {
        error!("Crash recovery task failed: {}", e);
    }
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM and names it.
#[cfg(unix)]
pub async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
