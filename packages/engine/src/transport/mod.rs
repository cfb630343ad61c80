// packages/engine/src/transport/mod.rs
//! Entity migration
//!
//! - **Envelope**: payload plus placement and scheduling metadata
//! - **Codec**: CBOR envelopes in length-prefixed per-neighbor batches
//! - **Transporter**: per-neighbor buffers flushed by one collective exchange

pub mod codec;
pub mod envelope;
pub mod transporter;

// Re-export commonly used types
pub use codec::{decode_batch, decode_envelope, encode_batch, encode_envelope};
pub use envelope::{Envelope, Payload, ScheduleMeta};
pub use transporter::{Transporter, TransporterStats};
