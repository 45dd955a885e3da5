//! Engine configuration loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use abt_core::errors::{AbtError, ErrorInfo};
use serde::{Deserialize, Serialize};

/// Top-level engine configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub statistics: StatisticsConfig,
    #[serde(default)]
    pub assignment: AssignmentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Hypothesis test settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsConfig {
    /// Two-sided significance level for the two-proportion z-test.
    #[serde(default = "StatisticsConfig::default_significance_level")]
    pub significance_level: f64,
}

impl StatisticsConfig {
    const fn default_significance_level() -> f64 {
        0.05
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            significance_level: Self::default_significance_level(),
        }
    }
}

/// How new visitors are split between variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStrategyKind {
    /// Hash of experiment, visitor and seed.
    #[default]
    Hashed,
    /// Seeded pseudo-random coin flip.
    Random,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssignmentConfig {
    #[serde(default)]
    pub strategy: AssignmentStrategyKind,
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, AbtError> {
        let config: EngineConfig = toml::from_str(text).map_err(|err| {
            AbtError::Config(
                ErrorInfo::new("config-parse", "failed to parse engine config")
                    .with_hint(err.to_string()),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, AbtError> {
        let text = fs::read_to_string(path).map_err(|err| {
            AbtError::Config(
                ErrorInfo::new("config-read", "failed to read engine config")
                    .with_context("path", path.display())
                    .with_hint(err.to_string()),
            )
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), AbtError> {
        let alpha = self.statistics.significance_level;
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(AbtError::Config(
                ErrorInfo::new(
                    "config-significance",
                    "significance level must lie strictly between 0 and 1",
                )
                .with_context("significance_level", alpha),
            ));
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.is_none() {
            return Err(AbtError::Config(
                ErrorInfo::new("config-storage", "sqlite backend requires a path")
                    .with_hint("set storage.path"),
            ));
        }
        Ok(())
    }
}
