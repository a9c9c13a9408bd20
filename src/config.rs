//! Configuration for the topology engine and its ingest loop.
//!
//! Every field has a default, so a partial JSON document (or none at all) is enough.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::netproxy::InterfaceSwapPolicy;

/// Subnets whose membership has not changed for this long are evicted (5 minutes).
pub const DEFAULT_STALE_THRESHOLD_MS: u64 = 300_000;

/// A tracked netproxy without fresh evidence for this long is dropped (10 minutes).
pub const DEFAULT_NETPROXY_ABSENCE_TIMEOUT_MS: u64 = 600_000;

/// Upper bound on entries examined by a single maintenance pass.
pub const DEFAULT_MAX_EVICTION_SCAN: usize = 4096;

/// Observations buffered between the capture side and the apply task.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8192;

pub const DEFAULT_MAINTENANCE_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub stale_threshold_ms: u64,
    pub netproxy_absence_timeout_ms: u64,
    pub max_eviction_scan: usize,
    /// Reject addresses that fall outside the subnet they are reported under.
    pub strict_subnet_membership: bool,
    /// Also record destination addresses that fall inside the observed subnet.
    pub record_destinations: bool,
    pub interface_swap_policy: InterfaceSwapPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: DEFAULT_STALE_THRESHOLD_MS,
            netproxy_absence_timeout_ms: DEFAULT_NETPROXY_ABSENCE_TIMEOUT_MS,
            max_eviction_scan: DEFAULT_MAX_EVICTION_SCAN,
            strict_subnet_membership: true,
            record_destinations: false,
            interface_swap_policy: InterfaceSwapPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_eviction_scan == 0 {
            return Err(ConfigError::Invalid("max_eviction_scan must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Which clock supplies `now` to the periodic maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceClock {
    /// The newest `observed_at` accepted so far. Replayed captures age at their own pace.
    #[default]
    Event,
    /// Milliseconds since the Unix epoch on this host.
    Wall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub queue_capacity: usize,
    pub maintenance_interval_ms: u64,
    pub maintenance_clock: MaintenanceClock,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            maintenance_interval_ms: DEFAULT_MAINTENANCE_INTERVAL_MS,
            maintenance_clock: MaintenanceClock::default(),
        }
    }
}

impl IngestConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be greater than 0".into()));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "maintenance_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub ingest: IngestConfig,
}

impl Settings {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.ingest.validate()
    }
}
