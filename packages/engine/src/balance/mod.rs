// packages/engine/src/balance/mod.rs
//! Load balancing
//!
//! Each process smooths its per-step cost with a moving average. Every
//! `interval` steps all processes gather those averages and, from the
//! same inputs, reach the same decision about the partition tree:
//!
//! - **move origins**: pull split points toward expensive leaves
//! - **restructure**: merge a cheap sibling group and split the hottest
//!   leaf with the freed processes
//!
//! The balancer only decides. Committing the change, and migrating the
//! entities it evicts, is the engine's job.

pub mod balancer;
pub mod cost;

// Re-export commonly used types
pub use balancer::{BalanceOutcome, LoadBalancer};
pub use cost::MovingAverage;
