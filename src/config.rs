//! Application configuration
//!
//! Stored as TOML in the platform config directory. Every section has
//! defaults, so a partial or missing file still yields a usable setup.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::VideoMode;
use crate::constants::{
    DEFAULT_DETECT_INTERVAL_MS, DEFAULT_EVENT_CAPACITY, DEFAULT_IDLE_SLEEP_MS,
    DEFAULT_JOIN_TIMEOUT_MS, DEFAULT_RECORD_LOCK_TIMEOUT_MS, DEFAULT_RECORD_PREFIX,
};
use crate::depth::CalibrationState;
use crate::error::{Error, Result};
use crate::recorder::RecordFormat;

const CONFIG_FILE: &str = "config.toml";

/// Top level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub depth: CalibrationState,
    pub capture: CaptureConfig,
    pub recorder: RecorderConfig,
}

/// Device thread settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Poll period while waiting for a device to be attached
    pub detect_interval_ms: u64,
    /// Pause after an update that produced no new frame
    pub idle_sleep_ms: u64,
    /// How long `stop` waits for the device thread before detaching it
    pub join_timeout_ms: u64,
    pub video_mode: VideoMode,
    /// Queue depth per event subscriber
    pub event_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            detect_interval_ms: DEFAULT_DETECT_INTERVAL_MS,
            idle_sleep_ms: DEFAULT_IDLE_SLEEP_MS,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            video_mode: VideoMode::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl CaptureConfig {
    pub fn detect_interval(&self) -> Duration {
        Duration::from_millis(self.detect_interval_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Disk recorder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub enabled: bool,
    /// Root under which each session gets its own subdirectory
    pub directory: PathBuf,
    pub prefix: String,
    pub format: RecordFormat,
    /// RLE for TGA, stronger deflate for PNG
    pub compress: bool,
    /// Bounded wait for the recorder's frame lock before dropping
    pub lock_timeout_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("."),
            prefix: DEFAULT_RECORD_PREFIX.to_string(),
            format: RecordFormat::default(),
            compress: false,
            lock_timeout_ms: DEFAULT_RECORD_LOCK_TIMEOUT_MS,
        }
    }
}

impl RecorderConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl AppConfig {
    /// Default location of the config file, if the platform has one
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "depth-relay").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` or the default location; a missing file gives defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        tracing::info!("Loading config from {}", path.display());
        Self::load(&path)
    }

    /// Write as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let text = self.to_toml()?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject values the capture core cannot run with
    pub fn validate(&self) -> Result<()> {
        for (name, range) in [("metric", &self.depth.metric), ("raw", &self.depth.raw)] {
            if !range.is_valid() {
                return Err(Error::Config(format!(
                    "depth.{} range must satisfy 0 <= near <= far <= max and 0 <= clip <= 1",
                    name
                )));
            }
        }

        if self.capture.detect_interval_ms == 0 {
            return Err(Error::Config("capture.detect_interval_ms must be non-zero".into()));
        }
        if self.capture.event_capacity == 0 {
            return Err(Error::Config("capture.event_capacity must be non-zero".into()));
        }
        if self.recorder.enabled && self.recorder.prefix.trim().is_empty() {
            return Err(Error::Config("recorder.prefix must not be empty".into()));
        }

        Ok(())
    }
}
