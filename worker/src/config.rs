//! Configuration management for the echoscribe worker.
//!
//! Handles loading, saving, and providing defaults for the worker
//! configuration. The defaults match the tuning the transcription pipeline
//! was calibrated with; tests override individual knobs through the structs.

use anyhow::{Context, Result};
use echoscribe_proto::EngineChoice;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration struct for the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub local: LocalConfig,
    pub revai: RevAiConfig,
    pub limits: LimitsConfig,
    pub logging: LoggingConfig,
}

/// Engine selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine used when a job does not request one explicitly.
    pub default: EngineChoice,
}

/// Local (in-process) inference configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Pins the first model candidate to try. `None` uses the built-in
    /// candidate order.
    pub model: Option<String>,
    /// Length of one inference window in seconds.
    pub window_secs: u32,
    /// Advance distance between consecutive windows in seconds
    /// (window - stride = overlap).
    pub stride_secs: u32,
    /// Emit a partial-decode preview every Nth decode.
    pub partial_every: u32,
    /// Wall-clock budget for loading one model candidate.
    pub load_timeout_secs: u64,
    /// Wall-clock budget for the whole inference pass.
    pub inference_timeout_secs: u64,
}

/// Remote (Rev AI) engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevAiConfig {
    pub base_url: String,
    /// API key; a per-job key in the request takes precedence.
    pub api_key: Option<String>,
    /// Poll interval while a remote job is in progress.
    pub poll_interval_ms: u64,
    /// Poll attempt ceiling; exceeding it is a fatal timeout.
    pub max_poll_attempts: u32,
    /// Rough processing-time multiplier (seconds of processing per second of
    /// audio) used only for the human-readable time-remaining estimate.
    pub processing_rate: f32,
}

/// Input validation bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub min_duration_secs: f32,
    pub max_duration_secs: f32,
    /// Root-mean-square amplitude below which the input counts as silent.
    pub rms_speech_threshold: f32,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub level: LogLevel,
}

/// Log verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to a tracing filter directive string for the worker crate.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "echoscribe_worker=error",
            LogLevel::Warn => "echoscribe_worker=warn",
            LogLevel::Info => "echoscribe_worker=info",
            LogLevel::Debug => "echoscribe_worker=debug",
            LogLevel::Trace => "echoscribe_worker=trace",
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            model: None,
            window_secs: 30,
            stride_secs: 5,
            partial_every: 10,
            load_timeout_secs: 30,
            inference_timeout_secs: 120,
        }
    }
}

impl Default for RevAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.rev.ai/speechtotext/v1".to_string(),
            api_key: None,
            poll_interval_ms: 2_000,
            max_poll_attempts: 150,
            processing_rate: 2.0,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_duration_secs: 0.1,
            max_duration_secs: 600.0,
            rms_speech_threshold: 0.005,
        }
    }
}

impl Config {
    /// Returns the default config directory path.
    /// `~/.config/echoscribe/` (or `$XDG_CONFIG_HOME/echoscribe/`)
    pub fn config_dir() -> Result<PathBuf> {
        crate::dirs::config_dir()
    }

    /// Returns the default config file path.
    /// `~/.config/echoscribe/config.toml`
    pub fn config_path() -> Result<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Returns the default models directory path.
    /// `~/.local/share/echoscribe/models/`
    pub fn models_dir() -> Result<PathBuf> {
        crate::dirs::data_dir().map(|p| p.join("models"))
    }

    /// Load configuration from the default path.
    /// Returns defaults if the file doesn't exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file as TOML")
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
