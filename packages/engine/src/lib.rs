// packages/engine/src/lib.rs
//! Distributed Spatial Simulation Engine Library
//!
//! This library splits a simulation domain across cooperating processes
//! and keeps agents, fields and names consistent as agents move and the
//! decomposition changes.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **partition**: Uniform and tree decompositions, ownership lookup, commit protocol
//! - **comm**: Communication substrate (local channels, TCP mesh) and collectives
//! - **field**: Halo-margined grid and continuous storage with neighbor sync
//! - **transport**: Migration envelopes, codec and the batched transporter
//! - **balance**: Cost averaging and repartitioning decisions
//! - **registry**: Distributed name service surviving migration
//! - **runtime**: Schedule and the per-step engine driver
//! - **observability**: Tracing and metrics setup
//! - **utils**: Configuration, errors and ids

// Public module exports
pub mod balance;
pub mod comm;
pub mod field;
pub mod observability;
pub mod partition;
pub mod registry;
pub mod runtime;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use comm::{Communicator, LocalCluster, TcpMesh};
pub use partition::{IntPoint, IntRect, Partition, PartitionChange, RealPoint};
pub use registry::{RegistryHandle, RemoteObject};
pub use runtime::{DistributedEngine, Schedule, Scheduler};
pub use transport::{Envelope, Payload, ScheduleMeta, Transporter};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};
pub use utils::ids::{EntityId, FieldId, ProcessId};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine build information
pub struct BuildInfo {
    pub version: &'static str,
    pub package: &'static str,
    pub target_profile: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            package: env!("CARGO_PKG_NAME"),
            target_profile: if cfg!(debug_assertions) { "debug" } else { "release" },
        }
    }
}
