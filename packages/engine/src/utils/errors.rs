// packages/engine/src/utils/errors.rs
//! Engine error taxonomy
//!
//! Errors fall in two classes:
//!
//! - **Recoverable**: the call is rejected and the caller decides what to do
//!   (`OutOfDomain`, `InvalidDestination`, `NotBound`, `NotLocal`,
//!   `InvalidChange`, `Config`).
//! - **Fatal**: the collective state shared by all processes is already
//!   inconsistent (`ProtocolViolation`, `CollectiveFailure`, `Codec`).
//!   The whole distributed run must stop; there is no checkpoint to roll
//!   back to.

use thiserror::Error;
use tracing::error;

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Point lies outside the global domain (or outside local storage)
    #[error("point out of domain: {0}")]
    OutOfDomain(String),

    /// Migration target is not a current neighbor
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// Received data contradicts the exchange protocol
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The communication substrate failed during a collective call
    #[error("collective operation failed: {0}")]
    CollectiveFailure(String),

    /// Registry lookup of an unpublished name
    #[error("name not bound: {0}")]
    NotBound(String),

    /// Write to a coordinate this process does not own
    #[error("coordinate not local: {0}")]
    NotLocal(String),

    /// Rejected structural partition change
    #[error("invalid partition change: {0}")]
    InvalidChange(String),

    /// Envelope or field encoding failure
    #[error("codec error: {0}")]
    Codec(String),

    /// zstd failure on an exchange frame
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    /// Registry or coordinator failure
    #[error("registry error: {0}")]
    Registry(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the error leaves the distributed state inconsistent
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ProtocolViolation(_)
                | EngineError::CollectiveFailure(_)
                | EngineError::Codec(_)
                | EngineError::CompressionFailed(_)
        )
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

impl From<serde_cbor::Error> for EngineError {
    fn from(e: serde_cbor::Error) -> Self {
        EngineError::Codec(e.to_string())
    }
}

/// Pass recoverable errors through; log and exit on fatal ones.
///
/// A partially applied collective cannot be repaired locally, so the process
/// stops instead of letting its peers continue against divergent state.
pub fn abort_on_fatal<T>(result: Result<T>) -> Result<T> {
    match result {
        Err(e) if e.is_fatal() => {
            error!("Fatal engine error, aborting process: {}", e);
            std::process::exit(70);
        }
        other => other,
    }
}
