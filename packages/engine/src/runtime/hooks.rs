// packages/engine/src/runtime/hooks.rs
//! Commit hooks wiring engine components into the partition protocol
//!
//! ```text
//! pre-commit   TransporterHook   exchange in-flight envelopes
//! ── layout changes ──
//! post-commit  TransporterHook   adopt new neighbors, re-route buffers
//! post-commit  FieldHook (each)  reshape, collect evictions, sync halo
//! ```
//!
//! The post-commit sync runs before evicted payloads reach their new
//! owners, so grid cells that changed hands show default values in
//! neighbor halos. `DistributedEngine::rebalance` delivers the evictions
//! and syncs again.

use crate::comm::Communicator;
use crate::field::EngineField;
use crate::partition::{CommitHook, Partition, RealPoint};
use crate::transport::{Payload, Transporter};
use crate::utils::errors::Result;
use crate::utils::ids::FieldId;
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Payloads pushed out of their field by a reshape, awaiting migration
pub type EvictedBuffer<P, const D: usize> = Arc<SyncMutex<Vec<(FieldId, P, RealPoint<D>)>>>;

/// Field shared between the engine and its commit hook
pub type SharedField<P, const D: usize> = Arc<Mutex<dyn EngineField<P, D>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

/// Drains the transporter before a commit and reloads it after
pub struct TransporterHook<P, const D: usize> {
    transporter: Arc<Mutex<Transporter<P, D>>>,

    comm: Arc<dyn Communicator>,

    phase: HookPhase,
}

impl<P: Payload, const D: usize> TransporterHook<P, D> {
    pub fn new(transporter: Arc<Mutex<Transporter<P, D>>>, comm: Arc<dyn Communicator>, phase: HookPhase) -> Self {
        Self {
            transporter,
            comm,
            phase,
        }
    }
}

#[async_trait]
impl<P: Payload, const D: usize> CommitHook<D> for TransporterHook<P, D> {
    async fn on_commit(&self, partition: &Partition<D>) -> Result<()> {
        let mut transporter = self.transporter.lock().await;
        match self.phase {
            HookPhase::Pre => {
                // Received envelopes stay queued for the engine to integrate
                let received = transporter.exchange(self.comm.as_ref()).await?;
                debug!("Pre-commit drain on {} received {}", partition.pid(), received);
                Ok(())
            }
            HookPhase::Post => transporter.reload(partition),
        }
    }
}

/// Reshapes one field after a commit and resynchronizes its halo
pub struct FieldHook<P, const D: usize> {
    id: FieldId,

    field: SharedField<P, D>,

    comm: Arc<dyn Communicator>,

    evicted: EvictedBuffer<P, D>,
}

impl<P: Payload, const D: usize> FieldHook<P, D> {
    pub fn new(id: FieldId, field: SharedField<P, D>, comm: Arc<dyn Communicator>, evicted: EvictedBuffer<P, D>) -> Self {
        Self {
            id,
            field,
            comm,
            evicted,
        }
    }
}

#[async_trait]
impl<P: Payload, const D: usize> CommitHook<D> for FieldHook<P, D> {
    async fn on_commit(&self, partition: &Partition<D>) -> Result<()> {
        let mut field = self.field.lock().await;
        let evicted = field.reload_evicting(partition)?;
        if !evicted.is_empty() {
            debug!("Field {} on {} evicted {} items", self.id, partition.pid(), evicted.len());
            self.evicted
                .lock()
                .extend(evicted.into_iter().map(|(payload, at)| (self.id, payload, at)));
        }
        field.sync_halo(self.comm.as_ref()).await
    }
}
