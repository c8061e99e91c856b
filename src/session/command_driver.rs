//! Session driver backed by an external helper process.
//!
//! The helper is started as `<command> <provider> <url>` and reports the
//! session by printing one JSON [`SessionSnapshot`] per line on stdout. Its
//! audio output goes to the job's sink through `PULSE_SINK`.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::{Provider, SessionDriver, SessionError, SessionSnapshot};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CommandSessionDriver {
    command: String,
    sink_name: String,
    headless: bool,
    state: Mutex<Option<Running>>,
}

struct Running {
    child: Child,
    snapshots: watch::Receiver<Option<SessionSnapshot>>,
}

impl CommandSessionDriver {
    pub fn new(command: impl Into<String>, sink_name: impl Into<String>, headless: bool) -> Self {
        Self {
            command: command.into(),
            sink_name: sink_name.into(),
            headless,
            state: Mutex::new(None),
        }
    }

    fn build_command(&self, provider: Provider, url: &str) -> Result<Command, SessionError> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| SessionError::Driver("driver command is empty".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(parts)
            .arg(provider.as_str())
            .arg(url)
            .env("PULSE_SINK", &self.sink_name)
            .env("MEETBOT_HEADLESS", if self.headless { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl SessionDriver for CommandSessionDriver {
    async fn open(&self, provider: Provider, url: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(SessionError::Driver("session already open".to_string()));
        }

        let mut child = self
            .build_command(provider, url)?
            .spawn()
            .map_err(|e| SessionError::Driver(format!("failed to start {}: {e}", self.command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Driver("driver stdout unavailable".to_string()))?;

        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<SessionSnapshot>(line) {
                    Ok(snapshot) => {
                        let _ = tx.send(Some(snapshot));
                    }
                    Err(e) => debug!("Ignoring driver output {:?}: {}", line, e),
                }
            }
            debug!("Driver output closed");
        });

        info!("Session driver started (pid {:?})", child.id());
        *state = Some(Running {
            child,
            snapshots: rx,
        });
        Ok(())
    }

    async fn probe(&self) -> Result<SessionSnapshot, SessionError> {
        let state = self.state.lock().await;
        let running = state.as_ref().ok_or(SessionError::Closed)?;

        // The sender goes away when the helper's stdout closes.
        if running.snapshots.has_changed().is_err() {
            return Err(SessionError::Closed);
        }

        let snapshot = running.snapshots.borrow().clone();
        snapshot.ok_or_else(|| SessionError::Driver("no snapshot reported yet".to_string()))
    }

    async fn close(&self) {
        let Some(mut running) = self.state.lock().await.take() else {
            return;
        };

        // Closing stdin asks the helper to leave the call.
        drop(running.child.stdin.take());
        match tokio::time::timeout(CLOSE_TIMEOUT, running.child.wait()).await {
            Ok(Ok(status)) => debug!("Session driver exited with {}", status),
            Ok(Err(e)) => warn!("Failed to wait for session driver: {}", e),
            Err(_) => {
                warn!("Session driver did not exit in {:?}, killing it", CLOSE_TIMEOUT);
                if let Err(e) = running.child.kill().await {
                    warn!("Failed to kill session driver: {}", e);
                }
            }
        }
        info!("Session closed");
    }
}
