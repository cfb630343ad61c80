// packages/engine/src/runtime/engine.rs
//! Per-process engine driver
//!
//! Owns one process's partition, schedule, transporter, fields and
//! registry handle, and runs the collective part of every step:
//!
//! ```text
//! sync_step()
//!   ├─ transporter exchange              (neighbors)
//!   ├─ release publications that left
//!   ├─ integrate arrivals: field, schedule, republish; forward strays
//!   ├─ barrier                           (global)
//!   ├─ halo sync of every field          (neighbors)
//!   └─ every `interval` steps: balance, maybe rebalance
//! ```
//!
//! Every process must call [`DistributedEngine::sync_step`] once per step,
//! in the same order relative to its other collective calls.

use crate::balance::{BalanceOutcome, LoadBalancer};
use crate::comm::Communicator;
use crate::field::EngineField;
use crate::observability::metrics as names;
use crate::partition::{Partition, PartitionChange, RealPoint};
use crate::registry::{RegistryHandle, RemoteObject};
use crate::runtime::hooks::{EvictedBuffer, FieldHook, HookPhase, SharedField, TransporterHook};
use crate::runtime::schedule::Schedule;
use crate::transport::{Envelope, Payload, ScheduleMeta, Transporter};
use crate::utils::config::BalanceConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{EntityId, EntityIdAllocator, FieldId, ProcessId};
use metrics::{counter, gauge};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// Builds the object exported for an arriving published entity
pub type ExportFactory<P> = Arc<dyn Fn(EntityId, &P) -> Arc<dyn RemoteObject> + Send + Sync>;

/// Summary of one synchronization step
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport<const D: usize> {
    pub step: u64,

    /// Envelopes integrated locally
    pub integrated: usize,

    /// Envelopes passed on toward their owner
    pub forwarded: usize,

    /// Set on balancing steps
    pub balance: Option<BalanceOutcome<D>>,
}

/// One process of a distributed simulation
pub struct DistributedEngine<P: Payload, const D: usize> {
    comm: Arc<dyn Communicator>,

    partition: Partition<D>,

    schedule: Schedule,

    transporter: Arc<Mutex<Transporter<P, D>>>,

    fields: Vec<SharedField<P, D>>,

    registry: RegistryHandle,

    exporter: Option<ExportFactory<P>>,

    balancer: LoadBalancer,

    ids: EntityIdAllocator,

    /// Agents living outside any field
    detached: HashMap<EntityId, P>,

    evicted: EvictedBuffer<P, D>,

    /// Cost reported since the last step
    pending_cost: f64,

    steps: u64,
}

impl<P: Payload, const D: usize> DistributedEngine<P, D> {
    pub fn new(
        comm: Arc<dyn Communicator>,
        mut partition: Partition<D>,
        registry: RegistryHandle,
        balance: BalanceConfig,
    ) -> Result<Self> {
        if comm.rank() != partition.pid() || comm.size() != partition.process_count() {
            return Err(EngineError::Config(format!(
                "communicator rank {}/{} does not match partition {}/{}",
                comm.rank(),
                comm.size(),
                partition.pid(),
                partition.process_count()
            )));
        }

        let transporter = Arc::new(Mutex::new(Transporter::new(&partition, registry.publication_index())));
        partition.register_pre_commit(Arc::new(TransporterHook::new(
            transporter.clone(),
            comm.clone(),
            HookPhase::Pre,
        )));
        partition.register_post_commit(Arc::new(TransporterHook::new(
            transporter.clone(),
            comm.clone(),
            HookPhase::Post,
        )));

        info!("Engine {} starting on {}", partition.pid(), partition.bounds());
        Ok(Self {
            ids: EntityIdAllocator::new(partition.pid()),
            comm,
            partition,
            schedule: Schedule::new(),
            transporter,
            fields: Vec::new(),
            registry,
            exporter: None,
            balancer: LoadBalancer::new(balance),
            detached: HashMap::new(),
            evicted: Arc::new(SyncMutex::new(Vec::new())),
            pending_cost: 0.0,
            steps: 0,
        })
    }

    /// Export factory used to republish arriving entities
    pub fn with_exporter(mut self, exporter: ExportFactory<P>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn pid(&self) -> ProcessId {
        self.partition.pid()
    }

    pub fn partition(&self) -> &Partition<D> {
        &self.partition
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn schedule_mut(&mut self) -> &mut Schedule {
        &mut self.schedule
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub fn transporter(&self) -> Arc<Mutex<Transporter<P, D>>> {
        self.transporter.clone()
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Fresh id, unique across the cluster
    pub fn next_id(&mut self) -> EntityId {
        self.ids.allocate()
    }

    /// Attach a field; it is reshaped and resynchronized on every commit
    pub fn register_field<F>(&mut self, field: Arc<Mutex<F>>) -> FieldId
    where
        F: EngineField<P, D> + 'static,
    {
        let id = self.fields.len() as FieldId;
        let shared: SharedField<P, D> = field;
        self.partition.register_post_commit(Arc::new(FieldHook::new(
            id,
            shared.clone(),
            self.comm.clone(),
            self.evicted.clone(),
        )));
        self.fields.push(shared);
        debug!("Engine {} registered field {}", self.pid(), id);
        id
    }

    pub fn field(&self, id: FieldId) -> Result<SharedField<P, D>> {
        self.fields
            .get(id as usize)
            .cloned()
            .ok_or_else(|| EngineError::NotLocal(format!("no field {}", id)))
    }

    pub fn detached(&self, id: EntityId) -> Option<&P> {
        self.detached.get(&id)
    }

    pub fn detached_mut(&mut self, id: EntityId) -> Option<&mut P> {
        self.detached.get_mut(&id)
    }

    /// Insert a locally owned entity and schedule it
    pub async fn add_entity(
        &mut self,
        field: Option<FieldId>,
        payload: P,
        location: Option<RealPoint<D>>,
        schedule: ScheduleMeta,
    ) -> Result<()> {
        if let Some(location) = &location {
            if !self.partition.owns_real(location) {
                return Err(EngineError::NotLocal(format!(
                    "{} is outside {}",
                    location,
                    self.partition.bounds()
                )));
            }
        }
        self.place(field, payload, location, schedule).await
    }

    async fn place(
        &mut self,
        field: Option<FieldId>,
        payload: P,
        location: Option<RealPoint<D>>,
        schedule: ScheduleMeta,
    ) -> Result<()> {
        let id = payload.entity_id();
        if schedule.is_agent() && id.is_none() {
            return Err(EngineError::ProtocolViolation(format!(
                "agent payload {:?} has no entity id",
                payload
            )));
        }
        match field {
            Some(field) => self.field(field)?.lock().await.accept(payload, location)?,
            None => {
                let id = id.ok_or_else(|| {
                    EngineError::ProtocolViolation("payload without a field or an entity id".into())
                })?;
                self.detached.insert(id, payload);
            }
        }
        if let Some(id) = id {
            self.schedule.schedule_meta(id, schedule)?;
        }
        Ok(())
    }

    /// Move an entity of `field` to `to`, migrating it if `to` is not local.
    ///
    /// A migrating entity leaves the field and the schedule now and travels
    /// one hop toward the owner of `to` on the next step.
    pub async fn migrate(&mut self, field: FieldId, id: EntityId, to: RealPoint<D>) -> Result<()> {
        let owner = self.partition.locate(&to)?;
        let shared = self.field(field)?;
        let mut storage = shared.lock().await;

        if owner == self.pid() {
            if !storage.relocate(id, to)? {
                return Err(EngineError::NotLocal(format!("field {} does not hold entities", field)));
            }
            return Ok(());
        }

        // Route first so a refused hop leaves the entity where it was
        let hop = self.route(&to).await?;
        let (payload, _) = storage
            .take(id)
            .ok_or_else(|| EngineError::NotLocal(format!("entity {} is not owned here", id)))?;
        drop(storage);

        let meta = self.schedule.unschedule(id).unwrap_or(ScheduleMeta::Static);
        trace_migration(self.pid(), id, owner, hop);
        self.transporter
            .lock()
            .await
            .queue_transport(payload, hop, Some(to), Some(field), meta)
    }

    /// Next hop toward `to` that the transporter will accept
    async fn route(&self, to: &RealPoint<D>) -> Result<ProcessId> {
        let hop = self.partition.next_hop(to)?;
        self.transporter.lock().await.check_destination(hop)?;
        Ok(hop)
    }

    /// Queue an arbitrary payload for a neighbor.
    ///
    /// The caller removes the payload from wherever it lived.
    pub async fn transport_object(
        &mut self,
        payload: P,
        destination: ProcessId,
        location: Option<RealPoint<D>>,
        field: Option<FieldId>,
        schedule: ScheduleMeta,
    ) -> Result<()> {
        self.transporter
            .lock()
            .await
            .queue_transport(payload, destination, location, field, schedule)
    }

    /// Move a detached agent to a neighbor, taking its schedule along
    pub async fn transport_detached(&mut self, id: EntityId, destination: ProcessId) -> Result<()> {
        if !self.partition.is_neighbor(destination) {
            return Err(EngineError::InvalidDestination(format!(
                "process {} is not a neighbor of {}",
                destination,
                self.pid()
            )));
        }
        let payload = self
            .detached
            .remove(&id)
            .ok_or_else(|| EngineError::NotLocal(format!("no detached entity {}", id)))?;
        let meta = self.schedule.unschedule(id).unwrap_or(ScheduleMeta::Static);
        self.transport_object(payload, destination, None, None, meta).await
    }

    /// Add to the cost of the current step
    pub fn record_cost(&mut self, cost: f64) {
        self.pending_cost += cost;
    }

    /// Entities owned by this process, over all fields and detached
    pub async fn local_entities(&self) -> usize {
        let mut count = self.detached.len();
        for field in &self.fields {
            count += field.lock().await.owned_ids().len();
        }
        count
    }

    /// The collective part of a step
    pub async fn sync_step(&mut self) -> Result<StepReport<D>> {
        self.steps += 1;

        let (received, integrated, forwarded) = self.deliver().await?;
        debug!(
            "Engine {} step {}: received {}, integrated {}, forwarded {}",
            self.pid(),
            self.steps,
            received,
            integrated,
            forwarded
        );

        self.comm.barrier().await?;
        self.sync_halos().await?;

        self.balancer.record(std::mem::take(&mut self.pending_cost));
        gauge!(names::STEP_COST).set(self.balancer.local_cost());
        gauge!(names::LOCAL_ENTITIES).set(self.local_entities().await as f64);

        let balance = if self.balancer.due() {
            let outcome = self.balancer.balance(&self.partition, self.comm.as_ref()).await?;
            if let BalanceOutcome::Changed { change, .. } = &outcome {
                self.rebalance(change.clone()).await?;
            }
            Some(outcome)
        } else {
            None
        };

        Ok(StepReport {
            step: self.steps,
            integrated,
            forwarded,
            balance,
        })
    }

    /// One exchange round with the neighbors, then integrate what arrived
    async fn deliver(&mut self) -> Result<(usize, usize, usize)> {
        let received = self.transporter.lock().await.exchange(self.comm.as_ref()).await?;
        let migrated = self.transporter.lock().await.take_migrated_names();
        self.registry.release_migrated(&migrated);

        let (integrated, forwarded) = self.integrate().await?;
        Ok((received, integrated, forwarded))
    }

    async fn sync_halos(&self) -> Result<()> {
        for field in &self.fields {
            field.lock().await.sync_halo(self.comm.as_ref()).await?;
        }
        Ok(())
    }

    /// Place received envelopes this process owns, forward the rest
    async fn integrate(&mut self) -> Result<(usize, usize)> {
        let envelopes = self.transporter.lock().await.drain_received();
        let mut integrated = 0;
        let mut forwarded = 0;

        for envelope in envelopes {
            if let Some(location) = &envelope.location {
                if !self.partition.owns_real(location) {
                    let hop = self.partition.next_hop(location)?;
                    self.transporter.lock().await.forward(envelope, hop)?;
                    counter!(names::ENVELOPES_FORWARDED).increment(1);
                    forwarded += 1;
                    continue;
                }
            }
            self.arrive(envelope).await?;
            integrated += 1;
        }
        Ok((integrated, forwarded))
    }

    async fn arrive(&mut self, envelope: Envelope<P, D>) -> Result<()> {
        let Envelope {
            location,
            field,
            schedule,
            exported_name,
            payload,
            ..
        } = envelope;
        let id = payload.entity_id();

        let object = match (&exported_name, id, &self.exporter) {
            (Some(_), Some(id), Some(exporter)) => Some((exporter.as_ref())(id, &payload)),
            _ => None,
        };
        self.place(field, payload, location, schedule).await?;

        if let (Some(name), Some(id)) = (exported_name, id) {
            match object {
                Some(object) => {
                    self.registry.republish(&name, id, object).await?;
                }
                None => warn!("Engine {} cannot republish {}: no export factory", self.pid(), name),
            }
        }
        Ok(())
    }

    /// Commit a partition change and hand evicted payloads to the transporter.
    ///
    /// Collective: every process must commit the same change at the same
    /// step. Evictions are delivered one hop and every halo is synced
    /// again before returning. Returns the number of payloads queued for
    /// migration.
    pub async fn rebalance(&mut self, change: PartitionChange<D>) -> Result<usize> {
        self.partition.commit(change).await?;
        counter!(names::REBALANCES).increment(1);

        // Envelopes drained by the pre-commit exchange
        self.integrate().await?;

        let mut evicted = std::mem::take(&mut *self.evicted.lock()).into_iter();
        let mut queued = 0;
        while let Some((field, payload, location)) = evicted.next() {
            if self.partition.owns_real(&location) {
                self.field(field)?.lock().await.accept(payload, Some(location))?;
                continue;
            }
            let hop = match self.route(&location).await {
                Ok(hop) => hop,
                Err(e) => {
                    // Unrouted payloads stay buffered
                    let mut buffer = self.evicted.lock();
                    buffer.push((field, payload, location));
                    buffer.extend(evicted);
                    return Err(e);
                }
            };
            let meta = payload
                .entity_id()
                .and_then(|id| self.schedule.unschedule(id))
                .unwrap_or(ScheduleMeta::Static);
            self.transporter
                .lock()
                .await
                .queue_transport(payload, hop, Some(location), Some(field), meta)?;
            queued += 1;
        }

        // Hand evictions to their new owners so the halo sync below sees
        // real values in cells that changed hands. Multi-hop payloads land
        // on the next sync_step.
        let (_, integrated, _) = self.deliver().await?;
        self.sync_halos().await?;
        debug!("Engine {} integrated {} payloads after the commit", self.pid(), integrated);

        info!(
            "Engine {} rebalanced to {} (epoch {}), {} payloads to migrate",
            self.pid(),
            self.partition.bounds(),
            self.partition.epoch(),
            queued
        );
        Ok(queued)
    }
}

fn trace_migration(pid: ProcessId, id: EntityId, owner: ProcessId, hop: ProcessId) {
    if owner == hop {
        trace!("Entity {} migrates {} -> {}", id, pid, owner);
    } else {
        trace!("Entity {} migrates {} -> {} via {}", id, pid, owner, hop);
    }
}
