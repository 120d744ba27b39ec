//! Configuration using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. built-in defaults,
//! 2. a TOML file (default `config/daq_scan.toml`; a missing file is ignored),
//! 3. environment variables prefixed with `DAQ_SCAN_`, nesting with `__`.
//!
//! ```text
//! DAQ_SCAN_APPLICATION__LOG_LEVEL=debug
//! DAQ_SCAN_ENGINE__EVENT_CAPACITY=4096
//! DAQ_SCAN_ENGINE__NAMING_RULE=known_labels
//! ```

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::channel::NamingRule;
use crate::error::{AppResult, DaqError};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_scan.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_SCAN_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Scan engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colored.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Which [`NamingRule`] the channel registry uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingRuleKind {
    /// Split at the second underscore.
    #[default]
    SecondUnderscore,
    /// Match against `known_labels` (plus every registered label).
    KnownLabels,
}

/// Scan engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Events buffered per subscriber before it starts lagging
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// How channel names are split into equipment label and variable
    #[serde(default)]
    pub naming_rule: NamingRuleKind,
    /// Equipment labels for [`NamingRuleKind::KnownLabels`]
    #[serde(default)]
    pub known_labels: Vec<String>,
    /// Treat composition tokens that name no setter as a plan error
    #[serde(default)]
    pub reject_unknown_channels: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            naming_rule: NamingRuleKind::default(),
            known_labels: Vec::new(),
            reject_unknown_channels: false,
        }
    }
}

impl EngineConfig {
    /// The configured naming rule.
    pub fn naming_rule(&self) -> NamingRule {
        match self.naming_rule {
            NamingRuleKind::SecondUnderscore => NamingRule::SecondUnderscore,
            NamingRuleKind::KnownLabels => NamingRule::KnownLabels(self.known_labels.clone()),
        }
    }
}

fn default_name() -> String {
    "daq_scan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

impl ScanConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific TOML file and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot check.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.engine.event_capacity == 0 {
            return Err(DaqError::Configuration(
                "Invalid event_capacity 0. Must be at least 1".to_string(),
            ));
        }

        if let Some(blank) = self.engine.known_labels.iter().find(|l| l.trim().is_empty()) {
            return Err(DaqError::Configuration(format!(
                "Invalid known label '{blank}'"
            )));
        }

        Ok(())
    }
}
