//! File-based configuration
//!
//! A single YAML or JSON document configures the simulation, the host and the
//! performance controller. Every section is optional:
//!
//! ```yaml
//! simulation:
//!   theta: 0.7
//!   iteration_cap: 500
//! host:
//!   execution: background
//! performance:
//!   target_fps: 120
//! ```
//!
//! The `performance` section drives the Barnes-Hut theta of a host that follows
//! its controller, so there `simulation.theta` only applies to requests made
//! before the host starts following.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{LayoutError, Result};
use crate::host::ExecutionStrategy;
use crate::performance::ControllerConfig;
use crate::simulation::SimulationParameters;

/// Requested execution strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Inline,
    Background,
    /// Background when more than one CPU is available
    #[default]
    Auto,
}

impl ExecutionMode {
    /// Pick a concrete strategy; `Auto` checks the machine once
    pub fn resolve(self) -> ExecutionStrategy {
        match self {
            ExecutionMode::Inline => ExecutionStrategy::Inline,
            ExecutionMode::Background => ExecutionStrategy::Background,
            ExecutionMode::Auto => {
                let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
                if cpus > 1 {
                    ExecutionStrategy::Background
                } else {
                    ExecutionStrategy::Inline
                }
            }
        }
    }
}

/// Simulation host settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub execution: ExecutionMode,
    /// How long `initialize` may go unacknowledged
    pub init_timeout_ms: u64,
    /// Iterations between streamed position batches
    pub batch_interval: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionMode::Auto,
            init_timeout_ms: 5_000,
            batch_interval: 10,
        }
    }
}

impl HostConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.init_timeout_ms == 0 {
            return Err(LayoutError::InvalidParameter(
                "init_timeout_ms must be positive".to_string(),
            ));
        }
        if self.batch_interval == 0 {
            return Err(LayoutError::InvalidParameter(
                "batch_interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub simulation: SimulationParameters,
    pub host: HostConfig,
    pub performance: ControllerConfig,
}

impl LayoutConfig {
    /// Load from a `.yaml`, `.yml` or `.json` file; missing fields take defaults
    pub fn from_path(path: &Path) -> Result<Self> {
        let config: Self = read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.simulation.validate()?;
        self.host.validate()?;
        self.performance.validate()
    }
}

/// Deserialize a YAML or JSON file, chosen by extension
pub(crate) fn read_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| LayoutError::UnsupportedFormat(path.display().to_string()))?;

    match extension.as_str() {
        "yaml" | "yml" => {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_yaml::from_str(&content)?)
        }
        "json" => {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        }
        other => Err(LayoutError::UnsupportedFormat(format!(
            "{other} (expected yaml, yml or json)"
        ))),
    }
}
