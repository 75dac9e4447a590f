//! Configuration for redbox
//!
//! All sections are optional in `redbox.toml`; missing values take the
//! defaults below.
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "pretty"
//!
//! [classifier]
//! packs = ["builtin:hydration"]
//!
//! [[classifier.rules]]
//! id = "custom.volatile_api:clock"
//! tag = "volatile_api"
//! anchors = ["Clock.now("]
//! scope = "source"
//!
//! [overlay]
//! max_signals_per_pass = 64
//! detail_max_chars = 200
//!
//! [runtime]
//! channel_capacity = 256
//! wait_timeout_ms = 10000
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::classifier::{BUILTIN_PACK, CauseClassifier, RuleDef};
use crate::error::ConfigError;
use crate::logging::{LogConfig, LogLevel};

/// Default cap on buffered signals per render pass.
pub const DEFAULT_MAX_SIGNALS_PER_PASS: usize = 64;

/// Default capacity of collaborator and overlay event channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for harness wait helpers.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 10_000;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format: {s}. Expected one of: pretty, json"
            )),
        }
    }
}

/// Classifier rule sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Named rule packs, merged in order.
    pub packs: Vec<String>,
    /// Extra rules; override pack rules with the same id.
    pub rules: Vec<RuleDef>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            packs: vec![BUILTIN_PACK.to_string()],
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Signals buffered per pass before further ones are dropped.
    pub max_signals_per_pass: usize,
    /// Truncation width for rendered detail lines.
    pub detail_max_chars: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            max_signals_per_pass: DEFAULT_MAX_SIGNALS_PER_PASS,
            detail_max_chars: crate::composer::DEFAULT_DETAIL_MAX_CHARS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub channel_capacity: usize,
    pub wait_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LogConfig,
    pub classifier: ClassifierConfig,
    pub overlay: OverlayConfig,
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Load and validate a config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ReadFailed(path.display().to_string(), e.to_string())
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if LogLevel::from_str(&self.logging.level).is_err() {
            problems.push(format!("logging.level '{}' is not a log level", self.logging.level));
        }
        if self.overlay.max_signals_per_pass == 0 {
            problems.push("overlay.max_signals_per_pass must be > 0".to_string());
        }
        if self.overlay.detail_max_chars < 8 {
            problems.push("overlay.detail_max_chars must be >= 8".to_string());
        }
        if self.runtime.channel_capacity == 0 {
            problems.push("runtime.channel_capacity must be > 0".to_string());
        }
        if self.runtime.wait_timeout_ms == 0 {
            problems.push("runtime.wait_timeout_ms must be > 0".to_string());
        }

        if !problems.is_empty() {
            return Err(ConfigError::ValidationError(problems.join("; ")).into());
        }

        // Pack names, rule shapes, and regexes are checked by compiling.
        CauseClassifier::from_config(&self.classifier)?;
        Ok(())
    }
}
