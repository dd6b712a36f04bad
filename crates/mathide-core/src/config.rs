//! Engine configuration
//!
//! Defaults, TOML loading and environment overrides. Every field has a
//! default, so a TOML file only needs the keys it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`EngineConfig::model`]
pub const ENV_MODEL: &str = "MATH_IDE_MODEL";
/// Environment variable overriding [`EngineConfig::preview_mode`]
pub const ENV_PREVIEW_MODE: &str = "MATH_IDE_PREVIEW_MODE";
/// Environment variable disabling transcript logging when truthy
pub const ENV_DISABLE_MODEL_LOGGING: &str = "MATH_IDE_DISABLE_MODEL_LOGGING";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config text is not valid TOML for this schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue {
        /// Offending key
        key: &'static str,
        /// What was wrong
        reason: String,
    },
}

/// Bounded retry policy for transient completion failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt `attempt` (0-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Attempt ceiling, never below one
    #[inline]
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Sampling temperature per operation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Temperatures {
    /// Candidate generation
    pub generation: f32,
    /// Applying a candidate
    pub apply: f32,
    /// Completion check
    pub check: f32,
    /// Progress analysis
    pub progress: f32,
    /// Verification of a user step
    pub verify: f32,
    /// Branching analysis
    pub branching: f32,
}

impl Default for Temperatures {
    fn default() -> Self {
        Self {
            generation: 0.7,
            apply: 0.3,
            check: 0.2,
            progress: 0.3,
            verify: 0.1,
            branching: 0.3,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model identifier sent with every request
    pub model: String,
    /// Per-operation temperatures
    pub temperatures: Temperatures,
    /// Maximum candidates offered per step
    pub max_candidates: usize,
    /// Stamp each offered candidate with a preview result
    pub preview_mode: bool,
    /// Log requests and raw responses under `mathide::transcript`
    pub transcript_logging: bool,
    /// Retry policy for transient failures
    pub retry: RetryPolicy,
    /// Sessions idle this long are evicted
    pub session_idle_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "o4-mini".to_string(),
            temperatures: Temperatures::default(),
            max_candidates: 5,
            preview_mode: false,
            transcript_logging: true,
            retry: RetryPolicy::default(),
            session_idle_timeout_secs: 3600,
        }
    }
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With model identifier
    #[inline]
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// With candidate limit
    #[inline]
    #[must_use]
    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates = max;
        self
    }

    /// With preview mode
    #[inline]
    #[must_use]
    pub fn with_preview_mode(mut self, enabled: bool) -> Self {
        self.preview_mode = enabled;
        self
    }

    /// With transcript logging
    #[inline]
    #[must_use]
    pub fn with_transcript_logging(mut self, enabled: bool) -> Self {
        self.transcript_logging = enabled;
        self
    }

    /// With retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// With idle timeout
    #[inline]
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout_secs = timeout.as_secs();
        self
    }

    /// Idle timeout as a duration
    #[inline]
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    /// Parse TOML text
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed input, [`ConfigError::InvalidValue`]
    /// when a value is out of range.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`EngineConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply overrides from the process environment
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    #[must_use]
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup(ENV_MODEL).filter(|m| !m.trim().is_empty()) {
            self.model = model.trim().to_string();
        }
        if let Some(preview) = lookup(ENV_PREVIEW_MODE) {
            self.preview_mode = is_truthy(&preview);
        }
        if let Some(disable) = lookup(ENV_DISABLE_MODEL_LOGGING) {
            self.transcript_logging = !is_truthy(&disable);
        }
        self
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] for the first out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "model",
                reason: "must not be empty".to_string(),
            });
        }
        if self.max_candidates == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_candidates",
                reason: "must be at least 1".to_string(),
            });
        }
        let t = &self.temperatures;
        for (key, value) in [
            ("temperatures.generation", t.generation),
            ("temperatures.apply", t.apply),
            ("temperatures.check", t.check),
            ("temperatures.progress", t.progress),
            ("temperatures.verify", t.verify),
            ("temperatures.branching", t.branching),
        ] {
            if !(0.0..=2.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key,
                    reason: format!("{value} is outside 0.0..=2.0"),
                });
            }
        }
        Ok(())
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
