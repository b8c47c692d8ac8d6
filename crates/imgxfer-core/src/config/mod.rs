//! Configuration management for imgxfer.
//!
//! This module handles loading, saving, and validating the imgxfer
//! configuration file.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/imgxfer/config.toml` |
//! | macOS | `~/Library/Application Support/org.imgxfer.imgxfer/config.toml` |
//! | Windows | `%APPDATA%\imgxfer\imgxfer\config\config.toml` |
//!
//! Credentials are never part of the file. Tokens and passwords are supplied
//! at runtime and live only in process memory.
//!
//! ## Example
//!
//! ```rust,ignore
//! use imgxfer_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Control plane: {}", config.control_plane.url);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::integrity::BackendDescriptor;
use crate::pause::PollSettings;

/// Main configuration struct for imgxfer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control-plane settings
    pub control_plane: ControlPlaneConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
    /// Phase polling settings
    pub polling: PollingConfig,
    /// Post-transfer verification settings
    pub verify: VerifyConfig,
}

/// Control-plane connection options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Base URL of the REST API (e.g. `https://engine.example.com/api`)
    pub url: String,
    /// PEM bundle with the CA that signed the engine and proxy certificates
    pub ca_file: Option<PathBuf>,
    /// Accept any certificate (lab use only)
    pub insecure: bool,
    /// User name for basic authentication
    pub username: Option<String>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: "https://localhost/api".to_string(),
            ca_file: None,
            insecure: false,
            username: None,
        }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes requested per download `Range`
    pub download_chunk_size: u64,
    /// Bytes read from the source per upload iteration
    pub upload_buffer_size: usize,
    /// Lease renewal cadence during uploads
    #[serde(with = "humantime_serde")]
    pub extend_interval: Duration,
    /// Progress report cadence during uploads
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,
    /// Time allowed for a new session to become ready
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Time allowed for the TCP connection to the proxy
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_chunk_size: crate::DEFAULT_DOWNLOAD_CHUNK_SIZE,
            upload_buffer_size: crate::DEFAULT_UPLOAD_BUFFER_SIZE,
            extend_interval: Duration::from_secs(crate::DEFAULT_EXTEND_INTERVAL_SECS),
            progress_interval: Duration::from_secs(crate::DEFAULT_PROGRESS_INTERVAL_SECS),
            ready_timeout: Duration::from_secs(crate::DEFAULT_READY_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(crate::DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Phase polling options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Interval between phase queries
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Time allowed for a pause request to take effect
    #[serde(with = "humantime_serde")]
    pub pause_timeout: Duration,
    /// Time allowed for a resume request to take effect
    #[serde(with = "humantime_serde")]
    pub resume_timeout: Duration,
    /// Time spent paused before resuming
    #[serde(with = "humantime_serde")]
    pub settle_duration: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(crate::DEFAULT_POLL_INTERVAL_SECS),
            pause_timeout: Duration::from_secs(crate::DEFAULT_PHASE_CHANGE_TIMEOUT_SECS),
            resume_timeout: Duration::from_secs(crate::DEFAULT_PHASE_CHANGE_TIMEOUT_SECS),
            settle_duration: Duration::from_secs(crate::DEFAULT_SETTLE_SECS),
        }
    }
}

/// Post-transfer verification options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Compare checksums after every transfer
    pub enabled: bool,
    /// Storage host that can read the backing image
    pub host: Option<String>,
    /// SSH user on the storage host
    pub user: String,
    /// SSH port on the storage host
    pub port: Option<u16>,
    /// SSH client program
    pub ssh_program: String,
    /// Where the image lives on the storage host
    pub backend: Option<BackendDescriptor>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: None,
            user: "root".to_string(),
            port: None,
            ssh_program: "ssh".to_string(),
            backend: None,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or validated.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config directory: {e}")))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(&path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))
    }

    /// Reject values the transfer loop cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, reason: &str| {
            Err(Error::InvalidConfig {
                key: key.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.transfer.download_chunk_size == 0 {
            return invalid("transfer.download_chunk_size", "must be greater than zero");
        }
        if self.transfer.upload_buffer_size == 0 {
            return invalid("transfer.upload_buffer_size", "must be greater than zero");
        }
        if self.polling.poll_interval.is_zero() {
            return invalid("polling.poll_interval", "must be greater than zero");
        }
        if self.verify.enabled && (self.verify.host.is_none() || self.verify.backend.is_none()) {
            return invalid("verify", "host and backend are required when enabled");
        }
        Ok(())
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            download_chunk_size: self.transfer.download_chunk_size,
            upload_buffer_size: self.transfer.upload_buffer_size,
            extend_interval: self.transfer.extend_interval,
            progress_interval: self.transfer.progress_interval,
            ready_timeout: self.transfer.ready_timeout,
            polling: self.poll_settings(),
        }
    }

    /// Phase polling settings derived from this configuration.
    #[must_use]
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: self.polling.poll_interval,
            pause_timeout: self.polling.pause_timeout,
            resume_timeout: self.polling.resume_timeout,
        }
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "imgxfer", "imgxfer")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let (digits, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
            (n, 1)
        } else if let Some(n) = s.strip_suffix('s') {
            (n, 1_000)
        } else if let Some(n) = s.strip_suffix('m') {
            (n, 60_000)
        } else if let Some(n) = s.strip_suffix('h') {
            (n, 3_600_000)
        } else {
            return Err(serde::de::Error::custom("invalid duration format"));
        };

        let count: u64 = digits.parse().map_err(serde::de::Error::custom)?;
        count
            .checked_mul(unit_ms)
            .map(Duration::from_millis)
            .ok_or_else(|| serde::de::Error::custom(format!("duration '{s}' is out of range")))
    }
}
