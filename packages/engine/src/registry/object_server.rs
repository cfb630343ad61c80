// packages/engine/src/registry/object_server.rs
//! Per-process invocation endpoint
//!
//! Serves the process's export table over TCP. Each request names the
//! binding it was resolved from; if the entity is no longer exported here
//! the reply is `Moved` and the caller re-resolves.

use crate::registry::{serve_invoke, ExportTable, InvokeReply};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::EntityId;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{error, trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectRequest {
    name: String,
    entity: EntityId,
    method: String,
    args: Vec<u8>,
}

/// Invocation server for one process
pub struct ObjectServer {
    listener: TcpListener,

    exports: Arc<ExportTable>,
}

impl ObjectServer {
    pub async fn bind(address: &str, exports: Arc<ExportTable>) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, exports })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, address)) => {
                        let exports = self.exports.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, exports).await {
                                warn!("Object connection {} ended: {}", address, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Object server accept failed: {}", e);
                        return;
                    }
                }
            }
        })
    }
}

async fn serve_connection(stream: TcpStream, exports: Arc<ExportTable>) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let reply = match serde_json::from_slice::<ObjectRequest>(&frame) {
            Ok(request) => {
                trace!("Invoking {} on {}", request.method, request.name);
                serve_invoke(&exports, &request.name, request.entity, &request.method, Bytes::from(request.args)).await
            }
            Err(e) => InvokeReply::Failed(format!("malformed invocation: {}", e)),
        };
        let bytes = serde_json::to_vec(&reply).map_err(|e| EngineError::Codec(format!("invoke reply: {}", e)))?;
        framed.send(Bytes::from(bytes)).await?;
    }
    Ok(())
}

/// Send one invocation to `endpoint` and wait for the reply
pub async fn invoke_remote(endpoint: &str, name: &str, entity: EntityId, method: &str, args: Bytes) -> Result<InvokeReply> {
    let stream = TcpStream::connect(endpoint)
        .await
        .map_err(|e| EngineError::Registry(format!("connect to {} failed: {}", endpoint, e)))?;
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let request = ObjectRequest {
        name: name.to_string(),
        entity,
        method: method.to_string(),
        args: args.to_vec(),
    };
    let bytes = serde_json::to_vec(&request).map_err(|e| EngineError::Codec(format!("invocation: {}", e)))?;
    framed.send(Bytes::from(bytes)).await?;

    let frame = framed
        .next()
        .await
        .ok_or_else(|| EngineError::Registry(format!("{} closed before replying", endpoint)))??;
    serde_json::from_slice(&frame).map_err(|e| EngineError::Codec(format!("invoke reply: {}", e)))
}
