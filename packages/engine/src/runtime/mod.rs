// packages/engine/src/runtime/mod.rs
//! Simulation runtime
//!
//! This module drives one process of a distributed simulation:
//!
//! - **Schedule**: discrete-event agent schedule with migratable entries
//! - **Hooks**: commit hooks that keep the transporter and fields
//!   consistent with the partition
//! - **Engine**: per-step collective protocol tying partition, transport,
//!   fields, registry and balancing together
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── DistributedEngine ────────────────────────┐
//! │                                                                   │
//! │  Schedule ◀── arrivals ── Transporter ◀──▶ neighbors (exchange)   │
//! │     │                         ▲                                   │
//! │     ▼ due agents              │ migrate                           │
//! │  scenario logic ──────────────┘                                   │
//! │     │                                                             │
//! │     ▼                                                             │
//! │  HaloFields ◀──▶ neighbors (halo sync)                            │
//! │                                                                   │
//! │  Partition ◀── LoadBalancer (commit: pre hooks, apply, post hooks)│
//! │  RegistryHandle ── coordinator                                    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod hooks;
pub mod schedule;

// Re-export commonly used types
pub use engine::{DistributedEngine, ExportFactory, StepReport};
pub use hooks::{EvictedBuffer, FieldHook, HookPhase, SharedField, TransporterHook};
pub use schedule::{Schedule, Scheduler};
