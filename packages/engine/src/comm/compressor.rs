// packages/engine/src/comm/compressor.rs
//! zstd compression for exchange frames
//!
//! Every frame starts with a one-byte flag so the receiver can tell raw and
//! compressed payloads apart without sharing the sender's settings:
//!
//! ```text
//! [0x00][raw payload]        below threshold, or compression disabled
//! [0x01][zstd frame]         compressed
//! ```

use crate::utils::errors::{EngineError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::trace;

const FLAG_RAW: u8 = 0;
const FLAG_ZSTD: u8 = 1;

/// Compression levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// Never compress
    None,

    /// Fast compression (level 1)
    Fast,

    /// Balanced (level 3)
    Balanced,

    /// Best compression (level 19)
    Best,
}

impl CompressionLevel {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            CompressionLevel::None => None,
            CompressionLevel::Fast => Some(1),
            CompressionLevel::Balanced => Some(3),
            CompressionLevel::Best => Some(19),
        }
    }
}

/// Frame compressor shared by all exchanges of a communicator
#[derive(Debug, Clone)]
pub struct FrameCompressor {
    level: CompressionLevel,

    /// Payloads shorter than this are sent raw
    threshold: usize,
}

impl FrameCompressor {
    pub fn new(level: CompressionLevel, threshold: usize) -> Self {
        Self { level, threshold }
    }

    /// Compressor that only adds the flag byte
    pub fn disabled() -> Self {
        Self::new(CompressionLevel::None, usize::MAX)
    }

    /// Wrap a payload into a flagged frame
    pub fn encode(&self, data: &[u8]) -> Result<Bytes> {
        let level = match self.level.as_i32() {
            Some(level) if data.len() >= self.threshold => level,
            _ => {
                let mut frame = BytesMut::with_capacity(data.len() + 1);
                frame.put_u8(FLAG_RAW);
                frame.put_slice(data);
                return Ok(frame.freeze());
            }
        };

        let compressed = zstd::encode_all(data, level)
            .map_err(|e| EngineError::CompressionFailed(format!("Compression error: {}", e)))?;
        trace!("Compressed frame {} -> {} bytes at level {}", data.len(), compressed.len(), level);

        let mut frame = BytesMut::with_capacity(compressed.len() + 1);
        frame.put_u8(FLAG_ZSTD);
        frame.put_slice(&compressed);
        Ok(frame.freeze())
    }

    /// Unwrap a flagged frame
    pub fn decode(&self, frame: &Bytes) -> Result<Bytes> {
        match frame.first() {
            Some(&FLAG_RAW) => Ok(frame.slice(1..)),
            Some(&FLAG_ZSTD) => {
                let data = zstd::decode_all(&frame[1..])
                    .map_err(|e| EngineError::CompressionFailed(format!("Decompression error: {}", e)))?;
                Ok(Bytes::from(data))
            }
            Some(flag) => Err(EngineError::ProtocolViolation(format!("unknown frame flag {:#04x}", flag))),
            None => Err(EngineError::ProtocolViolation("empty exchange frame".into())),
        }
    }
}

impl Default for FrameCompressor {
    fn default() -> Self {
        Self::new(CompressionLevel::Fast, 4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_levels() {
        assert_eq!(CompressionLevel::None.as_i32(), None);
        assert_eq!(CompressionLevel::Fast.as_i32(), Some(1));
        assert_eq!(CompressionLevel::Balanced.as_i32(), Some(3));
        assert_eq!(CompressionLevel::Best.as_i32(), Some(19));
    }

    #[test]
    fn test_small_frames_stay_raw() {
        let compressor = FrameCompressor::new(CompressionLevel::Balanced, 1024);
        let frame = compressor.encode(b"short").unwrap();
        assert_eq!(frame[0], FLAG_RAW);
        assert_eq!(&compressor.decode(&frame).unwrap()[..], b"short");
    }

    #[test]
    fn test_large_frames_compressed() {
        let compressor = FrameCompressor::new(CompressionLevel::Balanced, 1024);
        let data = b"envelope envelope envelope ".repeat(200);
        let frame = compressor.encode(&data).unwrap();
        assert_eq!(frame[0], FLAG_ZSTD);
        assert!(frame.len() < data.len());

        // Receivers decode regardless of their own settings
        let decoded = FrameCompressor::disabled().decode(&frame).unwrap();
        assert_eq!(&decoded[..], &data[..]);
    }

    #[test]
    fn test_bad_flag_rejected() {
        let compressor = FrameCompressor::default();
        assert!(matches!(
            compressor.decode(&Bytes::from_static(&[7, 1, 2])),
            Err(EngineError::ProtocolViolation(_))
        ));
        assert!(compressor.decode(&Bytes::new()).is_err());
    }
}
