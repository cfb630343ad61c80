// packages/engine/src/utils/mod.rs
//! Common utilities shared by every engine component
//!
//! - **errors**: the engine error taxonomy and fatal-error policy
//! - **config**: layered configuration (defaults, file, environment)
//! - **ids**: process, field and entity identifiers

pub mod config;
pub mod errors;
pub mod ids;

// Re-export commonly used types
pub use config::EngineConfig;
pub use errors::{EngineError, Result};
pub use ids::{EntityId, EntityIdAllocator, FieldId, ProcessId};
