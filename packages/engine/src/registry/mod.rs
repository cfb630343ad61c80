// packages/engine/src/registry/mod.rs
//! Distributed name service
//!
//! Lets any process publish a locally owned entity under a string name and
//! any other process resolve that name to a callable remote reference,
//! even after the entity migrates.
//!
//! # Architecture
//!
//! ```text
//!   process A                coordinator                process B
//! ┌────────────┐          ┌──────────────┐          ┌────────────┐
//! │ Registry   │─publish─▶│ name -> host │◀─resolve─│ Registry   │
//! │ exports    │          └──────────────┘          │ RemoteRef  │
//! │ ObjectSrv  │◀──────────────invoke───────────────│            │
//! └────────────┘                                    └────────────┘
//! ```
//!
//! When a published entity migrates, the old host drops its local export
//! (invocations there answer `Moved`) and the new host re-exports the
//! entity and rebinds the name in one coordinator transaction. A
//! [`RemoteRef`] that hits `Moved` re-resolves and retries.
//!
//! - **memory**: in-process directory for local clusters and tests
//! - **coordinator**: TCP coordinator server and client, plus the startup
//!   peer rendezvous
//! - **object_server**: per-process endpoint answering remote invocations

pub mod coordinator;
pub mod memory;
pub mod object_server;

// Re-export commonly used types
pub use coordinator::{CoordinatorClient, CoordinatorServer};
pub use memory::{BindingTable, InMemoryDirectory};
pub use object_server::ObjectServer;

use crate::observability::metrics as names;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{EntityId, ProcessId};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Entity -> published name, shared with the transporter
pub type PublicationIndex = Arc<DashMap<EntityId, String>>;

/// Objects this process serves, by name
pub type ExportTable = DashMap<String, Export>;

/// An object callable from other processes
#[async_trait]
pub trait RemoteObject: Send + Sync {
    async fn invoke(&self, method: &str, args: Bytes) -> Result<Bytes>;
}

/// A locally served object
#[derive(Clone)]
pub struct Export {
    pub entity: EntityId,
    pub object: Arc<dyn RemoteObject>,
}

/// Coordinator record for one name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,

    /// Process currently hosting the entity
    pub owner: ProcessId,

    pub entity: EntityId,

    /// Where the owner serves invocations
    pub endpoint: String,
}

/// Answer to a remote invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InvokeReply {
    Value(Vec<u8>),

    /// The host no longer serves this entity
    Moved,

    Failed(String),
}

/// Name-to-location directory held by the coordinator
#[async_trait]
pub trait Directory: Send + Sync {
    /// Bind a free name; `false` if it is taken
    async fn bind(&self, binding: Binding) -> Result<bool>;

    /// Move a name to a new host; `false` if it is bound to another entity
    async fn rebind(&self, binding: Binding) -> Result<bool>;

    /// Remove a name held by `owner`
    async fn unbind(&self, name: &str, owner: ProcessId) -> Result<bool>;

    async fn lookup(&self, name: &str) -> Result<Option<Binding>>;

    /// Deliver an invocation to the binding's endpoint
    async fn invoke(&self, binding: &Binding, method: &str, args: Bytes) -> Result<InvokeReply>;
}

/// Run an invocation against a local export table
pub async fn serve_invoke(exports: &ExportTable, name: &str, entity: EntityId, method: &str, args: Bytes) -> InvokeReply {
    let object = exports
        .get(name)
        .filter(|export| export.entity == entity)
        .map(|export| export.object.clone());
    match object {
        Some(object) => match object.invoke(method, args).await {
            Ok(value) => InvokeReply::Value(value.to_vec()),
            Err(e) => InvokeReply::Failed(e.to_string()),
        },
        None => InvokeReply::Moved,
    }
}

/// Retry limits for references that chase a migrating entity
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay: Duration::from_millis(25),
        }
    }
}

struct RegistryInner {
    pid: ProcessId,

    /// Address other processes use to reach our exports
    endpoint: String,

    directory: Arc<dyn Directory>,

    exports: Arc<ExportTable>,

    publications: PublicationIndex,

    retry: RetryPolicy,
}

/// Per-process registry context, passed explicitly to whoever needs it
#[derive(Clone)]
pub struct RegistryHandle {
    inner: Arc<RegistryInner>,
}

impl RegistryHandle {
    pub fn new(pid: ProcessId, endpoint: String, directory: Arc<dyn Directory>, exports: Arc<ExportTable>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                pid,
                endpoint,
                directory,
                exports,
                publications: Arc::new(DashMap::new()),
                retry: RetryPolicy::default(),
            }),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.inner.pid
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn exports(&self) -> Arc<ExportTable> {
        self.inner.exports.clone()
    }

    /// Index of local publications, consulted by the transporter
    pub fn publication_index(&self) -> PublicationIndex {
        self.inner.publications.clone()
    }

    pub fn publication_of(&self, entity: EntityId) -> Option<String> {
        self.inner.publications.get(&entity).map(|name| name.value().clone())
    }

    /// Names exported by this process
    pub fn published(&self) -> usize {
        self.inner.exports.len()
    }

    fn binding(&self, name: &str, entity: EntityId) -> Binding {
        Binding {
            name: name.to_string(),
            owner: self.inner.pid,
            entity,
            endpoint: self.inner.endpoint.clone(),
        }
    }

    fn export(&self, name: &str, entity: EntityId, object: Arc<dyn RemoteObject>) {
        self.inner.exports.insert(name.to_string(), Export { entity, object });
        self.inner.publications.insert(entity, name.to_string());
    }

    fn withdraw(&self, name: &str) {
        if let Some((_, export)) = self.inner.exports.remove(name) {
            self.inner.publications.remove_if(&export.entity, |_, published| published == name);
        }
    }

    /// Publish a local entity.
    ///
    /// `false` if the name is already bound or the entity already holds
    /// another name: an entity carries at most one name when it migrates.
    pub async fn publish(&self, name: &str, entity: EntityId, object: Arc<dyn RemoteObject>) -> Result<bool> {
        if self.inner.exports.contains_key(name) {
            return Ok(false);
        }
        if let Some(held) = self.publication_of(entity) {
            debug!("Publish of {} on {} refused, entity {} holds {}", name, self.inner.pid, entity, held);
            return Ok(false);
        }
        // Export first so an immediate resolve-and-invoke finds the object
        self.export(name, entity, object);
        if !self.inner.directory.bind(self.binding(name, entity)).await? {
            self.withdraw(name);
            debug!("Publish of {} on {} refused, name taken", name, self.inner.pid);
            return Ok(false);
        }
        info!("Process {} published {} for entity {}", self.inner.pid, name, entity);
        Ok(true)
    }

    /// Remove a publication held by this process
    pub async fn unpublish(&self, name: &str) -> Result<bool> {
        if !self.inner.exports.contains_key(name) {
            return Ok(false);
        }
        let removed = self.inner.directory.unbind(name, self.inner.pid).await?;
        self.withdraw(name);
        Ok(removed)
    }

    /// Resolve a name to a callable reference
    pub async fn resolve(&self, name: &str) -> Result<RemoteRef> {
        let binding = self
            .inner
            .directory
            .lookup(name)
            .await?
            .ok_or_else(|| EngineError::NotBound(name.to_string()))?;
        Ok(RemoteRef {
            binding,
            directory: self.inner.directory.clone(),
            retry: self.inner.retry,
        })
    }

    /// Drop local exports of entities that migrated away.
    ///
    /// The coordinator keeps pointing here until the new host rebinds;
    /// invocations in between answer `Moved` and are retried.
    pub fn release_migrated(&self, names: &[String]) {
        for name in names {
            self.withdraw(name);
            debug!("Process {} released migrated publication {}", self.inner.pid, name);
        }
    }

    /// Re-export an arrived entity and move its name here
    pub async fn republish(&self, name: &str, entity: EntityId, object: Arc<dyn RemoteObject>) -> Result<bool> {
        self.export(name, entity, object);
        if !self.inner.directory.rebind(self.binding(name, entity)).await? {
            self.withdraw(name);
            warn!("Process {} could not rebind {}: bound to another entity", self.inner.pid, name);
            return Ok(false);
        }
        debug!("Process {} republished {} for entity {}", self.inner.pid, name, entity);
        Ok(true)
    }
}

/// Callable reference to a published entity
#[derive(Clone)]
pub struct RemoteRef {
    binding: Binding,

    directory: Arc<dyn Directory>,

    retry: RetryPolicy,
}

impl RemoteRef {
    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    /// Process currently believed to host the entity
    pub fn owner(&self) -> ProcessId {
        self.binding.owner
    }

    /// Invoke `method` on the entity, following it if it moved
    pub async fn invoke(&mut self, method: &str, args: Bytes) -> Result<Bytes> {
        for _ in 0..self.retry.attempts {
            match self.directory.invoke(&self.binding, method, args.clone()).await? {
                InvokeReply::Value(value) => return Ok(Bytes::from(value)),
                InvokeReply::Failed(message) => {
                    return Err(EngineError::Registry(format!(
                        "{} on {} failed: {}",
                        method, self.binding.name, message
                    )))
                }
                InvokeReply::Moved => {
                    counter!(names::REGISTRY_RETRIES).increment(1);
                    tokio::time::sleep(self.retry.delay).await;
                    self.binding = self
                        .directory
                        .lookup(&self.binding.name)
                        .await?
                        .ok_or_else(|| EngineError::NotBound(self.binding.name.clone()))?;
                }
            }
        }
        Err(EngineError::Registry(format!(
            "{} still moving after {} attempts",
            self.binding.name, self.retry.attempts
        )))
    }
}
