//! # Player Configuration
//!
//! Serde-deserializable configuration for the facade and each engine.
//! Every field has a default so a partial TOML table (or none at all)
//! yields a working player.

use crate::error::{PlayerError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_backend() -> String {
    "auto".to_string()
}

fn default_volume() -> u8 {
    60
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(200)
}

/// Top-level playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Backend to activate: a registered name, or `"auto"` to pick the
    /// highest-priority available one.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Volume applied when the backend starts, 0..=100.
    #[serde(default = "default_volume")]
    pub initial_volume: u8,

    /// Cadence of position ticks on the time stream.
    #[serde(default = "default_tick_interval")]
    pub tick_interval: Duration,

    #[serde(default)]
    pub in_process: InProcessConfig,

    #[serde(default)]
    pub control_socket: ControlSocketConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            initial_volume: default_volume(),
            tick_interval: default_tick_interval(),
            in_process: InProcessConfig::default(),
            control_socket: ControlSocketConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl PlayerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_volume > 100 {
            return Err(PlayerError::InvalidVolume(self.initial_volume));
        }
        if self.tick_interval.is_zero() {
            return Err(PlayerError::Construction(
                "tick_interval must be positive".to_string(),
            ));
        }
        self.in_process.validate()?;
        self.daemon.validate()?;
        Ok(())
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn with_initial_volume(mut self, volume: u8) -> Self {
        self.initial_volume = volume;
        self
    }
}

fn default_prebuffer_bytes() -> u64 {
    512
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_ring_capacity() -> usize {
    // One second of stereo output at the fixed 44.1 kHz device rate.
    44_100 * 2
}

/// Configuration of the in-process decode engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InProcessConfig {
    /// Directory for spool files. Defaults to the system temp dir.
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,

    /// Bytes that must be spooled before decoding starts. FLAC sources
    /// wait for four times this amount.
    #[serde(default = "default_prebuffer_bytes")]
    pub prebuffer_bytes: u64,

    /// Mid-stream decode failures tolerated before the session ends.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between retry attempts.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: Duration,

    /// Ring buffer capacity in samples.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
}

impl Default for InProcessConfig {
    fn default() -> Self {
        Self {
            spool_dir: None,
            prebuffer_bytes: default_prebuffer_bytes(),
            retry_attempts: default_retry_attempts(),
            retry_backoff: default_retry_backoff(),
            ring_capacity: default_ring_capacity(),
        }
    }
}

impl InProcessConfig {
    pub fn spool_dir(&self) -> PathBuf {
        self.spool_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    fn validate(&self) -> Result<()> {
        if self.prebuffer_bytes == 0 {
            return Err(PlayerError::Construction(
                "prebuffer_bytes must be positive".to_string(),
            ));
        }
        if self.ring_capacity < 1024 {
            return Err(PlayerError::Construction(
                "ring_capacity below one output block".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_control_bin() -> String {
    "mpv".to_string()
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Configuration of the external control-socket engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSocketConfig {
    /// Player binary to spawn.
    #[serde(default = "default_control_bin")]
    pub bin: String,

    /// IPC socket path. Defaults to a per-process path under the temp dir.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// How long to wait for the spawned player's socket to accept.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: Duration,
}

impl Default for ControlSocketConfig {
    fn default() -> Self {
        Self {
            bin: default_control_bin(),
            socket_path: None,
            startup_timeout: default_startup_timeout(),
        }
    }
}

impl ControlSocketConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("tunecore-ctl-{}.sock", std::process::id()))
        })
    }
}

fn default_daemon_address() -> String {
    "127.0.0.1:6600".to_string()
}

/// Configuration of the daemon-client engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// TCP address of the daemon.
    #[serde(default = "default_daemon_address")]
    pub address: String,

    /// Daemon binary, used only when `autostart` is set.
    #[serde(default)]
    pub bin: Option<PathBuf>,

    /// Daemon configuration file passed to the autostarted binary.
    #[serde(default)]
    pub config_file: Option<PathBuf>,

    /// Spawn (and on close, kill) the daemon ourselves.
    #[serde(default)]
    pub autostart: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            address: default_daemon_address(),
            bin: None,
            config_file: None,
            autostart: false,
        }
    }
}

impl DaemonConfig {
    fn validate(&self) -> Result<()> {
        if self.autostart && self.bin.is_none() {
            return Err(PlayerError::Construction(
                "daemon autostart requires a binary path".to_string(),
            ));
        }
        Ok(())
    }
}
