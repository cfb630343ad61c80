// packages/engine/src/registry/coordinator.rs
//! Coordinator service
//!
//! A single process (rank 0 by convention) runs [`CoordinatorServer`]. It
//! serves two purposes:
//!
//! 1. **Bootstrap rendezvous**: every process announces its mesh and
//!    object-server addresses, and each announcement is answered with the
//!    full peer table once all processes have checked in.
//! 2. **Directory**: the authoritative name -> binding table.
//!
//! Requests and responses are JSON documents in length-delimited frames.

use crate::comm::tcp::{connect_with_retry, PeerInfo};
use crate::registry::memory::BindingTable;
use crate::registry::object_server::invoke_remote;
use crate::registry::{Binding, Directory, InvokeReply};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::ProcessId;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum CoordinatorRequest {
    Announce(PeerInfo),
    Bind(Binding),
    Rebind(Binding),
    Unbind { name: String, owner: ProcessId },
    Lookup { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum CoordinatorResponse {
    Peers(Vec<PeerInfo>),
    Accepted(bool),
    Found(Option<Binding>),
    Error(String),
}

struct CoordinatorState {
    process_count: usize,

    table: BindingTable,

    peers: SyncMutex<BTreeMap<ProcessId, PeerInfo>>,

    /// Number of processes announced so far
    announced: watch::Sender<usize>,
}

impl CoordinatorState {
    async fn handle(&self, request: CoordinatorRequest) -> CoordinatorResponse {
        match request {
            CoordinatorRequest::Announce(peer) => self.announce(peer).await,
            CoordinatorRequest::Bind(binding) => CoordinatorResponse::Accepted(self.table.bind(binding)),
            CoordinatorRequest::Rebind(binding) => CoordinatorResponse::Accepted(self.table.rebind(binding)),
            CoordinatorRequest::Unbind { name, owner } => CoordinatorResponse::Accepted(self.table.unbind(&name, owner)),
            CoordinatorRequest::Lookup { name } => CoordinatorResponse::Found(self.table.lookup(&name)),
        }
    }

    async fn announce(&self, peer: PeerInfo) -> CoordinatorResponse {
        if peer.pid >= self.process_count {
            return CoordinatorResponse::Error(format!(
                "process {} outside a cluster of {}",
                peer.pid, self.process_count
            ));
        }
        {
            let mut peers = self.peers.lock();
            if peers.contains_key(&peer.pid) {
                return CoordinatorResponse::Error(format!("process {} announced twice", peer.pid));
            }
            info!("Process {} announced (mesh {})", peer.pid, peer.mesh_address);
            peers.insert(peer.pid, peer);
            let count = peers.len();
            self.announced.send_replace(count);
        }

        let mut announced = self.announced.subscribe();
        if announced.wait_for(|n| *n >= self.process_count).await.is_err() {
            return CoordinatorResponse::Error("coordinator shutting down".to_string());
        }
        CoordinatorResponse::Peers(self.peers.lock().values().cloned().collect())
    }
}

/// Coordinator server
pub struct CoordinatorServer {
    listener: TcpListener,

    state: Arc<CoordinatorState>,
}

impl CoordinatorServer {
    pub async fn bind(address: &str, process_count: usize) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let (announced, _) = watch::channel(0);
        info!("Coordinator listening on {} for {} processes", listener.local_addr()?, process_count);
        Ok(Self {
            listener,
            state: Arc::new(CoordinatorState {
                process_count,
                table: BindingTable::new(),
                peers: SyncMutex::new(BTreeMap::new()),
                announced,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, address)) => {
                        let state = self.state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, state).await {
                                warn!("Coordinator connection {} ended: {}", address, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Coordinator accept failed: {}", e);
                        return;
                    }
                }
            }
        })
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<CoordinatorState>) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let response = match serde_json::from_slice::<CoordinatorRequest>(&frame) {
            Ok(request) => state.handle(request).await,
            Err(e) => CoordinatorResponse::Error(format!("malformed request: {}", e)),
        };
        let bytes = serde_json::to_vec(&response)
            .map_err(|e| EngineError::Codec(format!("coordinator response: {}", e)))?;
        framed.send(Bytes::from(bytes)).await?;
    }
    Ok(())
}

/// Client side of the coordinator, usable as a [`Directory`]
pub struct CoordinatorClient {
    address: String,

    connection: Mutex<Framed<TcpStream, LengthDelimitedCodec>>,
}

impl CoordinatorClient {
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let stream = connect_with_retry(address, timeout).await?;
        debug!("Connected to coordinator at {}", address);
        Ok(Self {
            address: address.to_string(),
            connection: Mutex::new(Framed::new(stream, LengthDelimitedCodec::new())),
        })
    }

    async fn call(&self, request: CoordinatorRequest) -> Result<CoordinatorResponse> {
        let bytes = serde_json::to_vec(&request)
            .map_err(|e| EngineError::Codec(format!("coordinator request: {}", e)))?;
        let mut connection = self.connection.lock().await;
        connection
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| EngineError::Registry(format!("send to {} failed: {}", self.address, e)))?;
        let frame = connection
            .next()
            .await
            .ok_or_else(|| EngineError::Registry(format!("coordinator {} closed the connection", self.address)))?
            .map_err(|e| EngineError::Registry(format!("read from {} failed: {}", self.address, e)))?;
        let response: CoordinatorResponse = serde_json::from_slice(&frame)
            .map_err(|e| EngineError::Codec(format!("coordinator response: {}", e)))?;
        match response {
            CoordinatorResponse::Error(message) => Err(EngineError::Registry(message)),
            other => Ok(other),
        }
    }

    /// Announce this process and wait for the complete peer table
    pub async fn announce(&self, peer: PeerInfo) -> Result<Vec<PeerInfo>> {
        match self.call(CoordinatorRequest::Announce(peer)).await? {
            CoordinatorResponse::Peers(peers) => Ok(peers),
            other => Err(unexpected(other)),
        }
    }

    async fn accepted(&self, request: CoordinatorRequest) -> Result<bool> {
        match self.call(request).await? {
            CoordinatorResponse::Accepted(accepted) => Ok(accepted),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: CoordinatorResponse) -> EngineError {
    EngineError::ProtocolViolation(format!("unexpected coordinator response {:?}", response))
}

#[async_trait]
impl Directory for CoordinatorClient {
    async fn bind(&self, binding: Binding) -> Result<bool> {
        self.accepted(CoordinatorRequest::Bind(binding)).await
    }

    async fn rebind(&self, binding: Binding) -> Result<bool> {
        self.accepted(CoordinatorRequest::Rebind(binding)).await
    }

    async fn unbind(&self, name: &str, owner: ProcessId) -> Result<bool> {
        self.accepted(CoordinatorRequest::Unbind {
            name: name.to_string(),
            owner,
        })
        .await
    }

    async fn lookup(&self, name: &str) -> Result<Option<Binding>> {
        match self.call(CoordinatorRequest::Lookup { name: name.to_string() }).await? {
            CoordinatorResponse::Found(binding) => Ok(binding),
            other => Err(unexpected(other)),
        }
    }

    async fn invoke(&self, binding: &Binding, method: &str, args: Bytes) -> Result<InvokeReply> {
        invoke_remote(&binding.endpoint, &binding.name, binding.entity, method, args).await
    }
}
