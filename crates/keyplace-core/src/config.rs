//! placement.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Cache handed to the migration executor when keys start moving.
    pub cache_name: String,
    pub initial_delay_secs: u64,
    pub round_interval_secs: u64,
    /// Fraction of the stats capacity a sample must reach before it is sent.
    pub sample_threshold: f64,
    /// Replicas requested from the ownership resolver; the first is primary.
    pub replica_count: usize,
    /// Target false-positive rate of the relocation index's negative filter.
    pub false_positive_rate: f64,
    /// Rounds ahead of the current reply round that may be parked.
    pub max_future_rounds: u64,
    pub round_timeout_secs: u64,
    pub consistency_check: bool,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            cache_name: "default".to_string(),
            initial_delay_secs: 900,
            round_interval_secs: 1000,
            sample_threshold: 0.8,
            replica_count: 1,
            false_positive_rate: 0.01,
            max_future_rounds: 2,
            round_timeout_secs: 3000,
            consistency_check: true,
        }
    }
}

impl PlacementConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: PlacementConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if !(self.sample_threshold > 0.0 && self.sample_threshold <= 1.0) {
            return Err(CoreError::InvalidConfig(format!(
                "sample_threshold must be in (0, 1], got {}",
                self.sample_threshold
            )));
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(CoreError::InvalidConfig(format!(
                "false_positive_rate must be in (0, 1), got {}",
                self.false_positive_rate
            )));
        }
        if self.round_interval_secs == 0 {
            return Err(CoreError::InvalidConfig("round_interval_secs must be non-zero".to_string()));
        }
        if self.replica_count == 0 {
            return Err(CoreError::InvalidConfig("replica_count must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_secs(self.round_interval_secs)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }

    /// Whether a sample of `size` keys clears the confidence threshold.
    pub fn sample_is_sufficient(&self, size: usize, capacity: usize) -> bool {
        size as f64 >= capacity as f64 * self.sample_threshold
    }
}
