// packages/engine/src/comm/tcp.rs
//! Full TCP mesh between processes
//!
//! One connection per process pair: each process dials every higher rank
//! and accepts one connection from every lower rank. The dialing side
//! opens with a hello frame carrying its rank. After that every frame is
//! length-delimited and laid out as:
//!
//! ```text
//! [tag: u8][payload ...]
//! ```
//!
//! A reader task per connection feeds the process's [`Mailbox`].

use crate::comm::mailbox::{Mailbox, Message};
use crate::comm::{Communicator, FrameCompressor, Tag};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::ProcessId;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

/// Addresses a process announced at bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub pid: ProcessId,

    /// Mesh listener address
    pub mesh_address: String,

    /// Object-server address for remote invocations
    pub object_address: String,
}

/// Connect, retrying until `timeout` elapses
pub async fn connect_with_retry(address: &str, timeout: Duration) -> Result<TcpStream> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if tokio::time::Instant::now() < deadline => {
                debug!("Connect to {} failed ({}), retrying", address, e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => return Err(EngineError::Io(e)),
        }
    }
}

type Writer = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;
type Reader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;

/// TCP communicator
pub struct TcpMesh {
    rank: ProcessId,

    size: usize,

    writers: HashMap<ProcessId, Mutex<Writer>>,

    /// Self-sends skip the network
    loopback: UnboundedSender<Message>,

    mailbox: Mailbox,

    compressor: FrameCompressor,

    readers: Vec<JoinHandle<()>>,
}

impl TcpMesh {
    /// Build the mesh from the bootstrap peer table.
    ///
    /// `listener` must already be bound to the address this process
    /// announced, so peers dialing early wait in its backlog.
    pub async fn connect(
        rank: ProcessId,
        listener: TcpListener,
        peers: &[PeerInfo],
        compressor: FrameCompressor,
        timeout: Duration,
    ) -> Result<Self> {
        let size = peers.len();
        let (tx, rx) = unbounded_channel();
        let mut writers = HashMap::new();
        let mut readers = Vec::new();

        for peer in peers.iter().filter(|p| p.pid > rank) {
            let stream = connect_with_retry(&peer.mesh_address, timeout).await?;
            let (read, write) = stream.into_split();
            let mut writer = FramedWrite::new(write, LengthDelimitedCodec::new());
            writer
                .send(Bytes::copy_from_slice(&(rank as u32).to_be_bytes()))
                .await
                .map_err(|e| EngineError::CollectiveFailure(format!("hello to {} failed: {}", peer.pid, e)))?;
            readers.push(Self::spawn_reader(peer.pid, FramedRead::new(read, LengthDelimitedCodec::new()), tx.clone()));
            writers.insert(peer.pid, Mutex::new(writer));
        }

        for _ in 0..rank {
            let (stream, address) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let (read, write) = stream.into_split();
            let mut reader = FramedRead::new(read, LengthDelimitedCodec::new());
            let hello = reader
                .next()
                .await
                .ok_or_else(|| EngineError::CollectiveFailure(format!("{} closed before hello", address)))?
                .map_err(|e| EngineError::CollectiveFailure(format!("hello from {} failed: {}", address, e)))?;
            if hello.len() != 4 {
                return Err(EngineError::ProtocolViolation(format!("malformed hello from {}", address)));
            }
            let pid = u32::from_be_bytes([hello[0], hello[1], hello[2], hello[3]]) as ProcessId;
            if pid >= rank || writers.contains_key(&pid) {
                return Err(EngineError::ProtocolViolation(format!("unexpected hello from process {}", pid)));
            }
            readers.push(Self::spawn_reader(pid, reader, tx.clone()));
            writers.insert(pid, Mutex::new(FramedWrite::new(write, LengthDelimitedCodec::new())));
        }

        info!("Process {} connected to {} mesh peers", rank, writers.len());
        Ok(Self {
            rank,
            size,
            writers,
            loopback: tx,
            mailbox: Mailbox::new(rx),
            compressor,
            readers,
        })
    }

    fn spawn_reader(from: ProcessId, mut reader: Reader, tx: UnboundedSender<Message>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let mut frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Mesh connection to {} failed: {}", from, e);
                        return;
                    }
                };
                if !frame.has_remaining() {
                    warn!("Empty mesh frame from {}", from);
                    continue;
                }
                let Some(tag) = Tag::from_u8(frame.get_u8()) else {
                    error!("Unknown message tag from {}", from);
                    return;
                };
                if tx.send(Message { from, tag, payload: frame.freeze() }).is_err() {
                    return;
                }
            }
            debug!("Mesh connection to {} closed", from);
        })
    }
}

#[async_trait]
impl Communicator for TcpMesh {
    fn rank(&self) -> ProcessId {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn compressor(&self) -> &FrameCompressor {
        &self.compressor
    }

    async fn send(&self, to: ProcessId, tag: Tag, payload: Bytes) -> Result<()> {
        if to == self.rank {
            return self
                .loopback
                .send(Message { from: to, tag, payload })
                .map_err(|_| EngineError::CollectiveFailure("loopback closed".into()));
        }
        let writer = self
            .writers
            .get(&to)
            .ok_or_else(|| EngineError::CollectiveFailure(format!("no connection to process {}", to)))?;

        let mut frame = BytesMut::with_capacity(payload.len() + 1);
        frame.put_u8(tag as u8);
        frame.put_slice(&payload);
        writer
            .lock()
            .await
            .send(frame.freeze())
            .await
            .map_err(|e| EngineError::CollectiveFailure(format!("send to {} failed: {}", to, e)))
    }

    async fn recv(&self, from: ProcessId, tag: Tag) -> Result<Bytes> {
        self.mailbox.recv(from, tag).await
    }
}

impl Drop for TcpMesh {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_three_process_mesh() {
        let mut listeners = Vec::new();
        let mut peers = Vec::new();
        for pid in 0..3 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            peers.push(PeerInfo {
                pid,
                mesh_address: listener.local_addr().unwrap().to_string(),
                object_address: String::new(),
            });
            listeners.push(listener);
        }

        let mut handles = Vec::new();
        for (pid, listener) in listeners.into_iter().enumerate() {
            let peers = peers.clone();
            handles.push(tokio::spawn(async move {
                let mesh = TcpMesh::connect(pid, listener, &peers, FrameCompressor::default(), Duration::from_secs(5))
                    .await
                    .unwrap();
                let neighbors: Vec<_> = (0..3).filter(|p| *p != pid).collect();
                let outgoing = neighbors.iter().map(|to| Bytes::from(vec![pid as u8, *to as u8])).collect();
                let incoming = mesh.neighbor_exchange(&neighbors, outgoing).await.unwrap();
                mesh.barrier().await.unwrap();
                (pid, neighbors, incoming)
            }));
        }

        for handle in handles {
            let (pid, neighbors, incoming) = handle.await.unwrap();
            for (from, payload) in neighbors.iter().zip(incoming) {
                assert_eq!(&payload[..], &[*from as u8, pid as u8]);
            }
        }
    }
}
