// packages/engine/src/registry/memory.rs
//! In-process directory
//!
//! Holds the binding table in memory and routes invocations straight to the
//! export table of the hosting process. Used by local clusters where every
//! process lives in one address space.

use crate::registry::{serve_invoke, Binding, Directory, ExportTable, InvokeReply, RegistryHandle};
use crate::utils::errors::Result;
use crate::utils::ids::ProcessId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Authoritative name -> binding map with the directory's update rules
#[derive(Debug, Default)]
pub struct BindingTable {
    bindings: Mutex<HashMap<String, Binding>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, binding: Binding) -> bool {
        let mut bindings = self.bindings.lock();
        if bindings.contains_key(&binding.name) {
            return false;
        }
        bindings.insert(binding.name.clone(), binding);
        true
    }

    /// Rebind succeeds for a free name or one held by the same entity
    pub fn rebind(&self, binding: Binding) -> bool {
        let mut bindings = self.bindings.lock();
        if let Some(existing) = bindings.get(&binding.name) {
            if existing.entity != binding.entity {
                return false;
            }
        }
        debug!("Rebinding {} to process {}", binding.name, binding.owner);
        bindings.insert(binding.name.clone(), binding);
        true
    }

    pub fn unbind(&self, name: &str, owner: ProcessId) -> bool {
        let mut bindings = self.bindings.lock();
        match bindings.get(name) {
            Some(existing) if existing.owner == owner => {
                bindings.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Binding> {
        self.bindings.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Directory shared by every process of a local cluster
#[derive(Default)]
pub struct InMemoryDirectory {
    table: BindingTable,

    hosts: DashMap<ProcessId, Arc<ExportTable>>,
}

impl InMemoryDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry handle for process `pid`
    pub fn handle(self: &Arc<Self>, pid: ProcessId) -> RegistryHandle {
        let exports = Arc::new(ExportTable::new());
        self.hosts.insert(pid, exports.clone());
        RegistryHandle::new(pid, format!("local://{}", pid), self.clone(), exports)
    }

    pub fn bindings(&self) -> usize {
        self.table.len()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn bind(&self, binding: Binding) -> Result<bool> {
        Ok(self.table.bind(binding))
    }

    async fn rebind(&self, binding: Binding) -> Result<bool> {
        Ok(self.table.rebind(binding))
    }

    async fn unbind(&self, name: &str, owner: ProcessId) -> Result<bool> {
        Ok(self.table.unbind(name, owner))
    }

    async fn lookup(&self, name: &str) -> Result<Option<Binding>> {
        Ok(self.table.lookup(name))
    }

    async fn invoke(&self, binding: &Binding, method: &str, args: Bytes) -> Result<InvokeReply> {
        let host = self.hosts.get(&binding.owner).map(|host| host.value().clone());
        match host {
            Some(exports) => Ok(serve_invoke(&exports, &binding.name, binding.entity, method, args).await),
            None => Ok(InvokeReply::Failed(format!("no process {}", binding.owner))),
        }
    }
}
