// packages/engine/src/utils/config.rs
//! Layered engine configuration
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. Built-in defaults (`EngineConfig::default()`)
//! 2. Optional file named by `DSPACE_CONFIG` (TOML, YAML or JSON by extension)
//! 3. Environment variables `DSPACE__<SECTION>__<KEY>`,
//!    e.g. `DSPACE__CLUSTER__PROCESS_COUNT=4`

use crate::comm::compressor::CompressionLevel;
use crate::partition::geometry::{IntPoint, IntRect};
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_ENV: &str = "DSPACE_CONFIG";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cluster: ClusterConfig,
    pub partition: PartitionConfig,
    pub transport: TransportConfig,
    pub balance: BalanceConfig,
    pub observability: ObservabilityConfig,
    pub demo: DemoConfig,
}

/// Process group and bootstrap settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Total number of processes in the run
    pub process_count: usize,

    /// Rank of this process
    pub process_id: usize,

    /// Address of the name-service coordinator (hosted by rank 0)
    pub coordinator_address: String,

    /// Host to bind the mesh and object-server listeners on
    pub bind_host: String,

    /// Seconds to keep retrying the coordinator connection at startup
    pub connect_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            process_count: 1,
            process_id: 0,
            coordinator_address: "127.0.0.1:7400".to_string(),
            bind_host: "127.0.0.1".to_string(),
            connect_timeout_secs: 30,
        }
    }
}

/// Decomposition strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStrategy {
    /// Equal rectangles, fixed for the run
    Uniform,

    /// Hierarchical 2^D-ary tree, rebalanced at runtime
    Tree,
}

/// Spatial decomposition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Inclusive lower corner of the world
    pub world_lo: Vec<i64>,

    /// Exclusive upper corner of the world
    pub world_hi: Vec<i64>,

    /// Area of interest (halo depth)
    pub aoi: i64,

    pub strategy: PartitionStrategy,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            world_lo: vec![0, 0],
            world_hi: vec![200, 200],
            aoi: 5,
            strategy: PartitionStrategy::Tree,
        }
    }
}

impl PartitionConfig {
    /// World bounds for a `D`-dimensional run
    pub fn world<const D: usize>(&self) -> Result<IntRect<D>> {
        if self.world_lo.len() != D || self.world_hi.len() != D {
            return Err(EngineError::Config(format!(
                "world bounds must have {} coordinates, got {} and {}",
                D,
                self.world_lo.len(),
                self.world_hi.len()
            )));
        }
        let mut lo = [0i64; D];
        let mut hi = [0i64; D];
        lo.copy_from_slice(&self.world_lo);
        hi.copy_from_slice(&self.world_hi);
        let rect = IntRect::new(IntPoint(lo), IntPoint(hi));
        if rect.is_empty() {
            return Err(EngineError::Config(format!("world bounds {} are empty", rect)));
        }
        Ok(rect)
    }
}

/// Exchange frame settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Frame compression level
    pub compression: CompressionLevel,

    /// Frames smaller than this many bytes are sent raw
    pub compression_threshold: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            compression: CompressionLevel::Fast,
            compression_threshold: 4096,
        }
    }
}

/// Load balancing policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub enabled: bool,

    /// Steps between two evaluations
    pub interval: u64,

    /// Moving-average window, in steps
    pub window: usize,

    /// max/mean cost ratio that triggers a change
    pub threshold: f64,

    /// Ratio the imbalance must drop under before the next trigger
    pub hysteresis: f64,

    /// Evaluations skipped after a committed change
    pub cooldown: u32,

    /// A leaf costing more than `split_factor × mean` may be split
    pub split_factor: f64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 100,
            window: 20,
            threshold: 1.25,
            hysteresis: 1.1,
            cooldown: 1,
            split_factor: 2.0,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,

    /// Prometheus scrape address; metrics are disabled when unset
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Text,
            metrics_address: None,
        }
    }
}

/// Random-walk demo parameters used by the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Agents created per process
    pub agents: usize,

    pub steps: u64,

    pub seed: u64,

    /// Bucket edge of the continuous field
    pub discretization: f64,

    /// Maximum displacement per step on each axis
    pub jump: f64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            agents: 1000,
            steps: 500,
            seed: 42,
            discretization: 4.0,
            jump: 1.5,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, `DSPACE_CONFIG` and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(path.as_deref().map(Path::new))
    }

    /// Load configuration with an explicit optional file
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config: EngineConfig = builder
            .add_source(Environment::with_prefix("DSPACE").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.cluster.process_count == 0 {
            return Err(EngineError::Config("process_count must be at least 1".into()));
        }
        if self.cluster.process_id >= self.cluster.process_count {
            return Err(EngineError::Config(format!(
                "process_id {} out of range for {} processes",
                self.cluster.process_id, self.cluster.process_count
            )));
        }
        if self.partition.aoi < 1 {
            return Err(EngineError::Config("aoi must be at least 1".into()));
        }
        if self.partition.world_lo.len() != self.partition.world_hi.len() {
            return Err(EngineError::Config("world_lo and world_hi differ in dimension".into()));
        }
        if self.balance.interval == 0 || self.balance.window == 0 {
            return Err(EngineError::Config("balance interval and window must be positive".into()));
        }
        if self.balance.hysteresis > self.balance.threshold {
            return Err(EngineError::Config("balance hysteresis must not exceed threshold".into()));
        }
        if self.demo.discretization <= 0.0 {
            return Err(EngineError::Config("discretization must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.partition.strategy, PartitionStrategy::Tree);
        assert_eq!(config.balance.interval, 100);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[cluster]
process_count = 4
process_id = 2

[partition]
world_lo = [0]
world_hi = [100]
aoi = 5
strategy = "uniform"

[transport]
compression = "best"
"#
        )
        .unwrap();

        let config = EngineConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.cluster.process_count, 4);
        assert_eq!(config.cluster.process_id, 2);
        assert_eq!(config.partition.strategy, PartitionStrategy::Uniform);
        assert_eq!(config.transport.compression, CompressionLevel::Best);
        // Untouched sections keep their defaults
        assert_eq!(config.balance.window, 20);

        let world = config.partition.world::<1>().unwrap();
        assert_eq!(world.lo, IntPoint([0]));
        assert_eq!(world.hi, IntPoint([100]));
    }

    #[test]
    fn test_world_dimension_mismatch() {
        let config = PartitionConfig::default();
        assert!(matches!(config.world::<3>(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_invalid_process_id() {
        let mut config = EngineConfig::default();
        config.cluster.process_count = 2;
        config.cluster.process_id = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_aoi_rejected() {
        let mut config = EngineConfig::default();
        config.partition.aoi = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
        config.partition.aoi = 1;
        assert!(config.validate().is_ok());
    }
}
