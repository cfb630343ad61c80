// packages/engine/src/comm/local.rs
//! In-process cluster over tokio channels
//!
//! `LocalCluster::new(n)` returns one communicator per simulated process.
//! Each runs in its own task; there is no shared state between them other
//! than the channels, so the protocol behaves as it would across machines.

use crate::comm::mailbox::{Mailbox, Message};
use crate::comm::{Communicator, FrameCompressor, Tag};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::ProcessId;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

/// Factory for in-process communicators
pub struct LocalCluster;

impl LocalCluster {
    /// `size` connected communicators, rank `i` at index `i`
    pub fn new(size: usize) -> Vec<LocalComm> {
        Self::with_compressor(size, FrameCompressor::disabled())
    }

    pub fn with_compressor(size: usize, compressor: FrameCompressor) -> Vec<LocalComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded_channel::<Message>()).unzip();
        let senders = Arc::new(senders);

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, rx)| LocalComm {
                rank,
                senders: senders.clone(),
                mailbox: Mailbox::new(rx),
                compressor: compressor.clone(),
                bytes_sent: AtomicU64::new(0),
            })
            .collect()
    }
}

/// One process's endpoint in a [`LocalCluster`]
pub struct LocalComm {
    rank: ProcessId,

    senders: Arc<Vec<UnboundedSender<Message>>>,

    mailbox: Mailbox,

    compressor: FrameCompressor,

    bytes_sent: AtomicU64,
}

impl LocalComm {
    /// Total payload bytes sent by this endpoint
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Communicator for LocalComm {
    fn rank(&self) -> ProcessId {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn compressor(&self) -> &FrameCompressor {
        &self.compressor
    }

    async fn send(&self, to: ProcessId, tag: Tag, payload: Bytes) -> Result<()> {
        let sender = self
            .senders
            .get(to)
            .ok_or_else(|| EngineError::CollectiveFailure(format!("no process {} in local cluster", to)))?;
        self.bytes_sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
        sender
            .send(Message { from: self.rank, tag, payload })
            .map_err(|_| EngineError::CollectiveFailure(format!("process {} has shut down", to)))
    }

    async fn recv(&self, from: ProcessId, tag: Tag) -> Result<Bytes> {
        self.mailbox.recv(from, tag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::CompressionLevel;

    #[tokio::test]
    async fn test_neighbor_exchange_ring() {
        let comms = LocalCluster::new(3);
        let mut handles = Vec::new();
        for comm in comms {
            handles.push(tokio::spawn(async move {
                let rank = comm.rank();
                let neighbors: Vec<_> = (0..3).filter(|p| *p != rank).collect();
                let outgoing = neighbors
                    .iter()
                    .map(|to| Bytes::from(format!("{}->{}", rank, to)))
                    .collect();
                let incoming = comm.neighbor_exchange(&neighbors, outgoing).await.unwrap();
                (rank, neighbors, incoming)
            }));
        }
        for handle in handles {
            let (rank, neighbors, incoming) = handle.await.unwrap();
            for (from, payload) in neighbors.iter().zip(incoming) {
                assert_eq!(payload, Bytes::from(format!("{}->{}", from, rank)));
            }
        }
    }

    #[tokio::test]
    async fn test_collectives() {
        let comms = LocalCluster::with_compressor(4, FrameCompressor::new(CompressionLevel::Fast, 0));
        let mut handles = Vec::new();
        for comm in comms {
            handles.push(tokio::spawn(async move {
                comm.barrier().await.unwrap();
                let root_value = (comm.rank() == 2).then(|| Bytes::from_static(b"seed"));
                let value = comm.broadcast(2, root_value).await.unwrap();
                let gathered = comm.all_gather(Bytes::from(vec![comm.rank() as u8])).await.unwrap();
                comm.barrier().await.unwrap();
                (value, gathered)
            }));
        }
        for handle in handles {
            let (value, gathered) = handle.await.unwrap();
            assert_eq!(&value[..], b"seed");
            let ranks: Vec<u8> = gathered.iter().map(|b| b[0]).collect();
            assert_eq!(ranks, vec![0, 1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_mismatched_buffers_rejected() {
        let comms = LocalCluster::new(2);
        let result = comms[0].neighbor_exchange(&[1], Vec::new()).await;
        assert!(matches!(result, Err(EngineError::CollectiveFailure(_))));
    }
}
