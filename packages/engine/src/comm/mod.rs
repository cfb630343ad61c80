// packages/engine/src/comm/mod.rs
//! Message-passing substrate
//!
//! The engine only needs four primitives from its substrate:
//!
//! - **Point-to-point** `send` / `recv`, tagged by message class
//! - **Neighbor exchange**: variable-length all-to-all restricted to the
//!   neighbor set, sizes first, then payloads
//! - **Broadcast** from a root
//! - **Barrier** over all processes
//!
//! Implementations provide `send`/`recv`; the collectives are built on top
//! of them. Every collective must be entered by all participating processes
//! in the same order, once per step.
//!
//! ```text
//! neighbor_exchange (process A, neighbors B and C)
//!   A ──len──▶ B, C        phase 1: frame sizes
//!   A ◀──len── B, C
//!   A ──data─▶ B, C        phase 2: payloads, checked against phase 1
//!   A ◀──data─ B, C
//! ```

pub mod compressor;
pub mod local;
pub mod mailbox;
pub mod tcp;

// Re-export commonly used types
pub use compressor::{CompressionLevel, FrameCompressor};
pub use local::{LocalCluster, LocalComm};
pub use mailbox::{Mailbox, Message};
pub use tcp::{PeerInfo, TcpMesh};

use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::ProcessId;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Message class, so a stray message never satisfies the wrong receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    ExchangeSize = 1,
    ExchangeData = 2,
    Broadcast = 3,
    Gather = 4,
    Barrier = 5,
    Release = 6,
}

impl Tag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Tag::ExchangeSize),
            2 => Some(Tag::ExchangeData),
            3 => Some(Tag::Broadcast),
            4 => Some(Tag::Gather),
            5 => Some(Tag::Barrier),
            6 => Some(Tag::Release),
            _ => None,
        }
    }
}

/// Pack several buffers into one: `u32 count`, then `u32 len + bytes` each
pub fn pack_frames<B: AsRef<[u8]>>(frames: &[B]) -> Bytes {
    let total: usize = frames.iter().map(|f| f.as_ref().len() + 4).sum();
    let mut out = BytesMut::with_capacity(total + 4);
    out.put_u32(frames.len() as u32);
    for frame in frames {
        out.put_u32(frame.as_ref().len() as u32);
        out.put_slice(frame.as_ref());
    }
    out.freeze()
}

/// Inverse of [`pack_frames`]
pub fn unpack_frames(mut data: Bytes) -> Result<Vec<Bytes>> {
    let truncated = || EngineError::Codec("truncated frame batch".to_string());
    if data.remaining() < 4 {
        return Err(truncated());
    }
    let count = data.get_u32() as usize;
    let mut frames = Vec::with_capacity(count.min(data.remaining() / 4));
    for _ in 0..count {
        if data.remaining() < 4 {
            return Err(truncated());
        }
        let len = data.get_u32() as usize;
        if data.remaining() < len {
            return Err(truncated());
        }
        frames.push(data.split_to(len));
    }
    if data.has_remaining() {
        return Err(EngineError::Codec(format!("{} trailing bytes after frame batch", data.remaining())));
    }
    Ok(frames)
}

/// Communication substrate used by every collective step
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Rank of this process
    fn rank(&self) -> ProcessId;

    /// Number of processes
    fn size(&self) -> usize;

    /// Compressor applied to neighbor-exchange frames
    fn compressor(&self) -> &FrameCompressor;

    async fn send(&self, to: ProcessId, tag: Tag, payload: Bytes) -> Result<()>;

    async fn recv(&self, from: ProcessId, tag: Tag) -> Result<Bytes>;

    /// Exchange one buffer with each neighbor.
    ///
    /// `outgoing[i]` goes to `neighbors[i]`; the result holds what
    /// `neighbors[i]` sent to this process, in the same order.
    async fn neighbor_exchange(&self, neighbors: &[ProcessId], outgoing: Vec<Bytes>) -> Result<Vec<Bytes>> {
        if neighbors.len() != outgoing.len() {
            return Err(EngineError::CollectiveFailure(format!(
                "{} buffers for {} neighbors",
                outgoing.len(),
                neighbors.len()
            )));
        }
        if neighbors.contains(&self.rank()) {
            return Err(EngineError::CollectiveFailure("process listed as its own neighbor".into()));
        }

        let frames = outgoing
            .iter()
            .map(|buffer| self.compressor().encode(buffer))
            .collect::<Result<Vec<_>>>()?;

        for (&to, frame) in neighbors.iter().zip(&frames) {
            self.send(to, Tag::ExchangeSize, Bytes::copy_from_slice(&(frame.len() as u64).to_be_bytes()))
                .await?;
        }
        let mut sizes = Vec::with_capacity(neighbors.len());
        for &from in neighbors {
            let raw = self.recv(from, Tag::ExchangeSize).await?;
            let bytes: [u8; 8] = raw[..].try_into().map_err(|_| {
                EngineError::CollectiveFailure(format!("malformed size message of {} bytes from {}", raw.len(), from))
            })?;
            sizes.push(u64::from_be_bytes(bytes) as usize);
        }

        for (&to, frame) in neighbors.iter().zip(frames) {
            self.send(to, Tag::ExchangeData, frame).await?;
        }
        let mut incoming = Vec::with_capacity(neighbors.len());
        for (&from, expected) in neighbors.iter().zip(sizes) {
            let frame = self.recv(from, Tag::ExchangeData).await?;
            if frame.len() != expected {
                return Err(EngineError::CollectiveFailure(format!(
                    "process {} announced {} bytes but sent {}",
                    from,
                    expected,
                    frame.len()
                )));
            }
            incoming.push(self.compressor().decode(&frame)?);
        }
        trace!("Process {} exchanged with {:?}", self.rank(), neighbors);
        Ok(incoming)
    }

    /// Distribute `payload` from `root` to every process
    async fn broadcast(&self, root: ProcessId, payload: Option<Bytes>) -> Result<Bytes> {
        if self.rank() == root {
            let payload = payload
                .ok_or_else(|| EngineError::CollectiveFailure("broadcast root has no payload".into()))?;
            for to in (0..self.size()).filter(|p| *p != root) {
                self.send(to, Tag::Broadcast, payload.clone()).await?;
            }
            Ok(payload)
        } else {
            self.recv(root, Tag::Broadcast).await
        }
    }

    /// Block until every process has entered the barrier
    async fn barrier(&self) -> Result<()> {
        if self.size() <= 1 {
            return Ok(());
        }
        if self.rank() == 0 {
            for from in 1..self.size() {
                self.recv(from, Tag::Barrier).await?;
            }
            for to in 1..self.size() {
                self.send(to, Tag::Release, Bytes::new()).await?;
            }
        } else {
            self.send(0, Tag::Barrier, Bytes::new()).await?;
            self.recv(0, Tag::Release).await?;
        }
        Ok(())
    }

    /// Every process's buffer, indexed by rank, on every process
    async fn all_gather(&self, payload: Bytes) -> Result<Vec<Bytes>> {
        let packed = if self.rank() == 0 {
            let mut all = Vec::with_capacity(self.size());
            all.push(payload);
            for from in 1..self.size() {
                all.push(self.recv(from, Tag::Gather).await?);
            }
            Some(pack_frames(&all))
        } else {
            self.send(0, Tag::Gather, payload).await?;
            None
        };
        let packed = self.broadcast(0, packed).await?;
        let all = unpack_frames(packed).map_err(|e| EngineError::CollectiveFailure(e.to_string()))?;
        if all.len() != self.size() {
            return Err(EngineError::CollectiveFailure(format!(
                "gathered {} buffers from {} processes",
                all.len(),
                self.size()
            )));
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_batch() {
        let packed = pack_frames(&[b"ab".to_vec(), Vec::new(), b"xyz".to_vec()]);
        let frames = unpack_frames(packed.clone()).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[2][..], b"xyz");
        assert!(frames[1].is_empty());

        assert!(unpack_frames(packed.slice(..packed.len() - 1)).is_err());
        assert!(unpack_frames(Bytes::from_static(&[0, 0])).is_err());
    }

    #[test]
    fn test_tag_roundtrip() {
        for tag in [Tag::ExchangeSize, Tag::ExchangeData, Tag::Broadcast, Tag::Gather, Tag::Barrier, Tag::Release] {
            assert_eq!(Tag::from_u8(tag as u8), Some(tag));
        }
        assert_eq!(Tag::from_u8(0), None);
    }
}
