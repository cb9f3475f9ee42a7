//! Pipeline configuration.
//!
//! One explicit struct threaded into the coordinator and every worker. Loaded
//! from TOML (all fields optional, defaults below), then `RHETOR_*` environment
//! overrides, then [`PipelineConfig::validate`].
//!
//! ```toml
//! config_version = "v1"
//! max_queue_depth = 1000
//!
//! [stages.transcribe]
//! max_attempts = 3
//! max_running = 2
//! timeout_ms = 1800000
//!
//! [retry]
//! base_delay_ms = 2000
//! multiplier = 2.0
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::StageKind;
use crate::engine::EngineConfig;
use crate::idempotency::IdempotencyConfig;

pub const ENV_CONFIG_VERSION: &str = "RHETOR_CONFIG_VERSION";
pub const ENV_MAX_QUEUE_DEPTH: &str = "RHETOR_MAX_QUEUE_DEPTH";
pub const ENV_MAX_ATTEMPTS: &str = "RHETOR_MAX_ATTEMPTS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(String),

    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    /// Attempts per stage task before the job fails.
    pub max_attempts: u32,
    /// Tasks of this stage running at once, across all jobs.
    pub max_running: usize,
    /// Bound on one engine call.
    pub timeout_ms: u64,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_running: 4,
            timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub ingest: StageSettings,
    pub transcribe: StageSettings,
    pub analyze: StageSettings,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            ingest: StageSettings::default(),
            transcribe: StageSettings {
                max_running: 2,
                timeout_ms: 1_800_000,
                ..StageSettings::default()
            },
            analyze: StageSettings {
                timeout_ms: 300_000,
                ..StageSettings::default()
            },
        }
    }
}

impl StagesConfig {
    pub fn get(&self, stage: StageKind) -> &StageSettings {
        match stage {
            StageKind::Ingest => &self.ingest,
            StageKind::Transcribe => &self.transcribe,
            StageKind::Analyze => &self.analyze,
        }
    }

    fn get_mut(&mut self, stage: StageKind) -> &mut StageSettings {
        match stage {
            StageKind::Ingest => &mut self.ingest,
            StageKind::Transcribe => &mut self.transcribe,
            StageKind::Analyze => &mut self.analyze,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Part of every idempotency key; bump it to invalidate cached stage results.
    pub config_version: String,
    /// Pending + retrying tasks above which `submit` is rejected.
    pub max_queue_depth: usize,
    /// Terminal jobs older than this are archived.
    pub retention_secs: u64,
    pub housekeeping_interval_ms: u64,
    pub stages: StagesConfig,
    pub retry: RetryConfig,
    pub idempotency: IdempotencyConfig,
    pub engine: EngineConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            config_version: "v1".to_string(),
            max_queue_depth: 1_000,
            retention_secs: 7 * 24 * 60 * 60,
            housekeeping_interval_ms: 60_000,
            stages: StagesConfig::default(),
            retry: RetryConfig::default(),
            idempotency: IdempotencyConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Applies `RHETOR_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Same as [`PipelineConfig::apply_env_overrides`] with an explicit lookup.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(version) = lookup(ENV_CONFIG_VERSION) {
            self.config_version = version;
        }
        if let Some(depth) = lookup(ENV_MAX_QUEUE_DEPTH) {
            self.max_queue_depth = depth.trim().parse().map_err(|_| {
                ConfigError::Parse(format!("{ENV_MAX_QUEUE_DEPTH}={depth} is not a number"))
            })?;
        }
        if let Some(attempts) = lookup(ENV_MAX_ATTEMPTS) {
            let attempts: u32 = attempts.trim().parse().map_err(|_| {
                ConfigError::Parse(format!("{ENV_MAX_ATTEMPTS}={attempts} is not a number"))
            })?;
            for stage in StageKind::ALL {
                self.stages.get_mut(stage).max_attempts = attempts;
            }
        }
        Ok(())
    }

    /// Collects every problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.config_version.trim().is_empty() {
            errors.push("config_version must not be empty".to_string());
        }
        if self.max_queue_depth == 0 {
            errors.push("max_queue_depth must be at least 1".to_string());
        }
        if self.housekeeping_interval_ms == 0 {
            errors.push("housekeeping_interval_ms must be at least 1".to_string());
        }

        for stage in StageKind::ALL {
            let settings = self.stages.get(stage);
            if settings.max_attempts == 0 {
                errors.push(format!("stages.{stage}.max_attempts must be at least 1"));
            }
            if settings.max_running == 0 {
                errors.push(format!("stages.{stage}.max_running must be at least 1"));
            }
            if settings.timeout_ms == 0 {
                errors.push(format!("stages.{stage}.timeout_ms must be at least 1"));
            }
            if settings.timeout_ms >= self.idempotency.lease_timeout_ms {
                errors.push(format!(
                    "idempotency.lease_timeout_ms ({}) must exceed stages.{stage}.timeout_ms ({})",
                    self.idempotency.lease_timeout_ms, settings.timeout_ms
                ));
            }
        }

        if self.retry.multiplier < 1.0 {
            errors.push("retry.multiplier must be >= 1.0".to_string());
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            errors.push("retry.jitter must be in [0, 1)".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("retry.max_delay_ms must be >= retry.base_delay_ms".to_string());
        }
        if self.idempotency.wait_timeout_ms == 0 {
            errors.push("idempotency.wait_timeout_ms must be at least 1".to_string());
        }

        self.engine.validate(&mut errors);
        if let Err(err) = self.engine.compile() {
            errors.push(err.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}
