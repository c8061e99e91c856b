use crate::global;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable names that override values from `config.toml`.
pub mod env {
    pub const MAX_PARALLEL: &str = "MEETBOT_MAX_PARALLEL";
    pub const POLL_INTERVAL_MS: &str = "MEETBOT_POLL_INTERVAL_MS";
    pub const RECOVERY_INTERVAL_MS: &str = "MEETBOT_RECOVERY_INTERVAL_MS";
    pub const STALE_THRESHOLD_MS: &str = "MEETBOT_STALE_THRESHOLD_MS";
    pub const MAX_ATTEMPTS: &str = "MEETBOT_MAX_ATTEMPTS";
    pub const HEARTBEAT_INTERVAL_MS: &str = "MEETBOT_HEARTBEAT_INTERVAL_MS";
    pub const JOIN_TIMEOUT_SECS: &str = "MEETBOT_JOIN_TIMEOUT_SECS";
    pub const HEADLESS: &str = "MEETBOT_HEADLESS";
    pub const DRIVER_COMMAND: &str = "MEETBOT_DRIVER_COMMAND";
    pub const UPLOAD_COMMAND: &str = "MEETBOT_UPLOAD_COMMAND";
    pub const DISPLAY: &str = "DISPLAY";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub agent: AgentConfig,
    pub audio: AudioConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of agent processes alive at once.
    pub max_parallel: usize,
    pub poll_interval_ms: u64,
    /// Period of the crash recovery scan. Keep it well above `poll_interval_ms`.
    pub recovery_interval_ms: u64,
    /// Heartbeat age after which a running job is presumed crashed.
    /// Keep it at least 3x `agent.heartbeat_interval_ms`.
    pub stale_threshold_ms: u64,
    /// Claims allowed before a crashed job is failed instead of revived.
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            poll_interval_ms: 5_000,
            recovery_interval_ms: 30_000,
            stale_threshold_ms: 90_000,
            max_attempts: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub heartbeat_interval_ms: u64,
    pub join_timeout_secs: u64,
    pub join_poll_interval_ms: u64,
    pub exit_check_interval_ms: u64,
    /// Warm-up after joining during which the participant count is ignored.
    pub exit_grace_period_secs: u64,
    /// `None` means auto-detect from `DISPLAY`.
    pub headless: Option<bool>,
    /// Helper that drives the meeting UI and prints session snapshots.
    pub driver_command: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            join_timeout_secs: 300,
            join_poll_interval_ms: 2_000,
            exit_check_interval_ms: 3_000,
            exit_grace_period_secs: 30,
            headless: None,
            driver_command: "meetbot-driver".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn join_poll_interval(&self) -> Duration {
        Duration::from_millis(self.join_poll_interval_ms)
    }

    pub fn exit_check_interval(&self) -> Duration {
        Duration::from_millis(self.exit_check_interval_ms)
    }

    pub fn exit_grace_period(&self) -> Duration {
        Duration::from_secs(self.exit_grace_period_secs)
    }

    /// Resolve headless mode: explicit setting wins, otherwise headless when
    /// there is no interactive display.
    pub fn is_headless(&self) -> bool {
        self.headless.unwrap_or_else(|| {
            std::env::var(env::DISPLAY)
                .map(|d| d.trim().is_empty())
                .unwrap_or(true)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub segment_seconds: u32,
    pub stop_timeout_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            segment_seconds: 60,
            stop_timeout_ms: 5_000,
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

impl AudioConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Shell command that uploads the merged artifact and prints its public URL.
    /// Env vars: MEETBOT_JOB_ID, MEETBOT_ARTIFACT_PATH. Empty disables upload.
    pub command: String,
    pub timeout_seconds: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout_seconds: 600,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            if let Err(e) = config.save_to(&config_path) {
                warn!("Failed to write default config: {}", e);
            }
            config
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Apply environment overrides. Unparseable values are ignored with a warning.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse::<T>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid value for {}: {:?}", key, raw);
                    None
                }
            }
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        if let Some(v) = parsed(lookup, env::MAX_PARALLEL) {
            self.scheduler.max_parallel = v;
        }
        if let Some(v) = parsed(lookup, env::POLL_INTERVAL_MS) {
            self.scheduler.poll_interval_ms = v;
        }
        if let Some(v) = parsed(lookup, env::RECOVERY_INTERVAL_MS) {
            self.scheduler.recovery_interval_ms = v;
        }
        if let Some(v) = parsed(lookup, env::STALE_THRESHOLD_MS) {
            self.scheduler.stale_threshold_ms = v;
        }
        if let Some(v) = parsed(lookup, env::MAX_ATTEMPTS) {
            self.scheduler.max_attempts = v;
        }
        if let Some(v) = parsed(lookup, env::HEARTBEAT_INTERVAL_MS) {
            self.agent.heartbeat_interval_ms = v;
        }
        if let Some(v) = parsed(lookup, env::JOIN_TIMEOUT_SECS) {
            self.agent.join_timeout_secs = v;
        }
        if let Some(raw) = lookup(env::HEADLESS) {
            self.agent.headless = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Some(true),
                "0" | "false" | "no" => Some(false),
                _ => {
                    warn!("Ignoring invalid value for {}: {:?}", env::HEADLESS, raw);
                    self.agent.headless
                }
            };
        }
        if let Some(cmd) = lookup(env::DRIVER_COMMAND) {
            self.agent.driver_command = cmd;
        }
        if let Some(cmd) = lookup(env::UPLOAD_COMMAND) {
            self.upload.command = cmd;
        }

        if self.scheduler.stale_threshold_ms < self.agent.heartbeat_interval_ms * 3 {
            warn!(
                "Staleness threshold ({}ms) is below 3x the heartbeat interval ({}ms); \
                 live agents may be revived",
                self.scheduler.stale_threshold_ms, self.agent.heartbeat_interval_ms
            );
        }
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }
}
