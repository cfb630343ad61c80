// packages/engine/src/field/mod.rs
//! Halo field storage
//!
//! A field stores data for its partition's core plus a margin of depth AOI
//! (the halo). The halo is a read-only cache of the neighbors' boundary
//! data, refreshed by [`HaloField::sync`]:
//!
//! ```text
//!        neighbor B core
//!   ┌──────────┬────────┐
//!   │  A core  │▒▒▒▒▒▒▒▒│   ▒ = A's recv rect from B  (A halo ∩ B core)
//!   │      ░░░░│        │   ░ = A's send rect to B    (A core ∩ B halo)
//!   └──────────┴────────┘
//! ```
//!
//! - **grid**: dense storage, one value per lattice point
//! - **continuous**: bucketed storage with k-NN and radius queries

pub mod continuous;
pub mod grid;

// Re-export commonly used types
pub use continuous::{ContinuousStorage, Placed};
pub use grid::GridStorage;

use crate::comm::Communicator;
use crate::partition::geometry::{IntRect, RealPoint};
use crate::partition::Partition;
use crate::transport::envelope::Payload;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{EntityId, ProcessId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

/// Backing store that can be shaped to a partition and exchange rectangles
pub trait HaloStorage<const D: usize>: Send + Sync {
    /// What a reshape hands back for data leaving the core
    type Evicted: Send;

    /// Rebuild for new bounds, returning former core data outside `core`
    fn reshape(&mut self, core: IntRect<D>, halo: IntRect<D>) -> Vec<Self::Evicted>;

    /// Serialize the data inside `rect`
    fn pack(&self, rect: &IntRect<D>) -> Result<Vec<u8>>;

    /// Replace the data inside `rect` with a neighbor's packed data
    fn unpack(&mut self, rect: &IntRect<D>, data: &[u8]) -> Result<()>;
}

/// Rectangles exchanged with one neighbor
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborPlan<const D: usize> {
    pub pid: ProcessId,

    /// Part of our core inside the neighbor's halo
    pub send: Option<IntRect<D>>,

    /// Part of our halo inside the neighbor's core
    pub recv: Option<IntRect<D>>,
}

/// Field statistics
#[derive(Debug, Clone, Default)]
pub struct FieldStats {
    pub syncs: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reloads: u64,
}

/// Storage bound to a partition's core and halo
pub struct HaloField<S, const D: usize> {
    storage: S,

    pid: ProcessId,

    core: IntRect<D>,

    halo: IntRect<D>,

    plan: Vec<NeighborPlan<D>>,

    /// Partition epoch the plan was built for
    epoch: u64,

    stats: FieldStats,
}

impl<T, const D: usize> HaloField<GridStorage<T, D>, D>
where
    T: Clone + Default + Serialize + DeserializeOwned + Send + Sync,
{
    /// Dense grid field over the partition's halo
    pub fn grid(partition: &Partition<D>) -> Result<Self> {
        Self::new(GridStorage::new(), partition)
    }
}

impl<T, const D: usize> HaloField<ContinuousStorage<T, D>, D>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Continuous field with cells of edge `discretization`
    pub fn continuous(partition: &Partition<D>, discretization: f64) -> Result<Self> {
        Self::new(ContinuousStorage::new(discretization)?, partition)
    }
}

impl<S: HaloStorage<D>, const D: usize> HaloField<S, D> {
    pub fn new(mut storage: S, partition: &Partition<D>) -> Result<Self> {
        storage.reshape(partition.bounds(), partition.halo_bounds());
        Ok(Self {
            storage,
            pid: partition.pid(),
            core: partition.bounds(),
            halo: partition.halo_bounds(),
            plan: Self::plan_for(partition)?,
            epoch: partition.epoch(),
            stats: FieldStats::default(),
        })
    }

    fn plan_for(partition: &Partition<D>) -> Result<Vec<NeighborPlan<D>>> {
        let core = partition.bounds();
        let halo = partition.halo_bounds();
        partition
            .neighbors()
            .iter()
            .map(|&pid| {
                let theirs = partition.bounds_of(pid)?;
                Ok(NeighborPlan {
                    pid,
                    send: core.intersection(&theirs.expand(partition.aoi())),
                    recv: halo.intersection(&theirs),
                })
            })
            .collect()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn core(&self) -> IntRect<D> {
        self.core
    }

    pub fn halo(&self) -> IntRect<D> {
        self.halo
    }

    pub fn plan(&self) -> &[NeighborPlan<D>] {
        &self.plan
    }

    pub fn stats(&self) -> FieldStats {
        self.stats.clone()
    }

    /// Re-shape to the partition's current bounds.
    ///
    /// Returns the data that left the core; the caller is responsible for
    /// handing it to its new owner.
    pub fn reload(&mut self, partition: &Partition<D>) -> Result<Vec<S::Evicted>> {
        self.plan = Self::plan_for(partition)?;
        self.core = partition.bounds();
        self.halo = partition.halo_bounds();
        self.epoch = partition.epoch();
        self.stats.reloads += 1;
        let evicted = self.storage.reshape(self.core, self.halo);
        debug!(
            "Field on process {} reloaded at epoch {} with {} neighbors, {} evicted",
            self.pid,
            self.epoch,
            self.plan.len(),
            evicted.len()
        );
        Ok(evicted)
    }

    /// Refresh the halo from every neighbor in one exchange round
    pub async fn sync(&mut self, comm: &dyn Communicator) -> Result<()> {
        if comm.rank() != self.pid {
            return Err(EngineError::CollectiveFailure(format!(
                "field of process {} synced through communicator {}",
                self.pid,
                comm.rank()
            )));
        }

        let neighbors: Vec<ProcessId> = self.plan.iter().map(|n| n.pid).collect();
        let mut outgoing = Vec::with_capacity(self.plan.len());
        for neighbor in &self.plan {
            let data = match &neighbor.send {
                Some(rect) => Bytes::from(self.storage.pack(rect)?),
                None => Bytes::new(),
            };
            self.stats.bytes_sent += data.len() as u64;
            outgoing.push(data);
        }

        let incoming = comm.neighbor_exchange(&neighbors, outgoing).await?;

        for (neighbor, data) in self.plan.iter().zip(incoming) {
            self.stats.bytes_received += data.len() as u64;
            match &neighbor.recv {
                Some(rect) => self.storage.unpack(rect, &data)?,
                None if data.is_empty() => {}
                None => {
                    return Err(EngineError::ProtocolViolation(format!(
                        "process {} sent halo data with no overlap",
                        neighbor.pid
                    )))
                }
            }
        }
        self.stats.syncs += 1;
        trace!("Field on process {} synced with {:?}", self.pid, neighbors);
        Ok(())
    }
}

/// Conversion between a field's element type and the scenario payload
pub trait FieldElement<P>: Sized {
    fn into_payload(self) -> P;

    /// Give the payload back when it holds another kind of element
    fn from_payload(payload: P) -> std::result::Result<Self, P>;
}

impl<P> FieldElement<P> for P {
    fn into_payload(self) -> P {
        self
    }

    fn from_payload(payload: P) -> std::result::Result<Self, P> {
        Ok(payload)
    }
}

/// Type-erased field as seen by the engine's migration and commit logic
#[async_trait]
pub trait EngineField<P: Payload, const D: usize>: Send + Sync {
    /// Insert a migrated payload owned by this process
    fn accept(&mut self, payload: P, location: Option<RealPoint<D>>) -> Result<()>;

    /// Remove an entity for migration
    fn take(&mut self, id: EntityId) -> Option<(P, RealPoint<D>)>;

    /// Move a stored entity within the core; `false` if the field has no entities
    fn relocate(&mut self, id: EntityId, to: RealPoint<D>) -> Result<bool>;

    fn position(&self, id: EntityId) -> Option<RealPoint<D>>;

    /// Ids of entities owned by this process
    fn owned_ids(&self) -> Vec<EntityId>;

    /// Reload against the partition, returning evicted payloads with locations
    fn reload_evicting(&mut self, partition: &Partition<D>) -> Result<Vec<(P, RealPoint<D>)>>;

    async fn sync_halo(&mut self, comm: &dyn Communicator) -> Result<()>;
}

fn mismatch<P: Payload>(payload: &P, field: &str) -> EngineError {
    EngineError::ProtocolViolation(format!(
        "payload for entity {:?} does not match the {} field element type",
        payload.entity_id(),
        field
    ))
}

#[async_trait]
impl<P, T, const D: usize> EngineField<P, D> for HaloField<GridStorage<T, D>, D>
where
    P: Payload,
    T: FieldElement<P> + Clone + Default + Serialize + DeserializeOwned + Send + Sync,
{
    fn accept(&mut self, payload: P, location: Option<RealPoint<D>>) -> Result<()> {
        let location = location
            .ok_or_else(|| EngineError::ProtocolViolation("grid payload without a location".into()))?;
        let value = T::from_payload(payload).map_err(|p| mismatch(&p, "grid"))?;
        self.storage.set(&location.floor(), value)
    }

    fn take(&mut self, _id: EntityId) -> Option<(P, RealPoint<D>)> {
        None
    }

    fn relocate(&mut self, _id: EntityId, _to: RealPoint<D>) -> Result<bool> {
        Ok(false)
    }

    fn position(&self, _id: EntityId) -> Option<RealPoint<D>> {
        None
    }

    fn owned_ids(&self) -> Vec<EntityId> {
        Vec::new()
    }

    fn reload_evicting(&mut self, partition: &Partition<D>) -> Result<Vec<(P, RealPoint<D>)>> {
        Ok(self
            .reload(partition)?
            .into_iter()
            .map(|(point, value)| (value.into_payload(), point.to_real()))
            .collect())
    }

    async fn sync_halo(&mut self, comm: &dyn Communicator) -> Result<()> {
        self.sync(comm).await
    }
}

#[async_trait]
impl<P, T, const D: usize> EngineField<P, D> for HaloField<ContinuousStorage<T, D>, D>
where
    P: Payload,
    T: FieldElement<P> + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    fn accept(&mut self, payload: P, location: Option<RealPoint<D>>) -> Result<()> {
        let location = location
            .ok_or_else(|| EngineError::ProtocolViolation("continuous payload without a location".into()))?;
        let id = payload
            .entity_id()
            .ok_or_else(|| EngineError::ProtocolViolation("continuous payload without an entity id".into()))?;
        let value = T::from_payload(payload).map_err(|p| mismatch(&p, "continuous"))?;
        self.storage.insert(id, location, value)
    }

    fn take(&mut self, id: EntityId) -> Option<(P, RealPoint<D>)> {
        if !self.core.contains_real(&self.storage.position(id)?) {
            return None;
        }
        let (position, value) = self.storage.remove(id)?;
        Some((value.into_payload(), position))
    }

    fn relocate(&mut self, id: EntityId, to: RealPoint<D>) -> Result<bool> {
        self.storage.relocate(id, to)?;
        Ok(true)
    }

    fn position(&self, id: EntityId) -> Option<RealPoint<D>> {
        self.storage.position(id)
    }

    fn owned_ids(&self) -> Vec<EntityId> {
        self.storage.core_ids()
    }

    fn reload_evicting(&mut self, partition: &Partition<D>) -> Result<Vec<(P, RealPoint<D>)>> {
        Ok(self
            .reload(partition)?
            .into_iter()
            .map(|(_, position, value)| (value.into_payload(), position))
            .collect())
    }

    async fn sync_halo(&mut self, comm: &dyn Communicator) -> Result<()> {
        self.sync(comm).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;
    use crate::partition::geometry::IntPoint;

    fn partitions() -> Vec<Partition<1>> {
        let world = IntRect::new(IntPoint([0]), IntPoint([100]));
        (0..2).map(|pid| Partition::uniform(world, 2, pid, 5).unwrap()).collect()
    }

    #[test]
    fn test_plan_pairs_send_and_recv() {
        let parts = partitions();
        let f0: HaloField<GridStorage<f64, 1>, 1> = HaloField::grid(&parts[0]).unwrap();
        let f1: HaloField<GridStorage<f64, 1>, 1> = HaloField::grid(&parts[1]).unwrap();

        assert_eq!(f0.plan()[0].send, Some(IntRect::new(IntPoint([45]), IntPoint([50]))));
        assert_eq!(f0.plan()[0].recv, Some(IntRect::new(IntPoint([50]), IntPoint([55]))));
        assert_eq!(f0.plan()[0].send, f1.plan()[0].recv);
        assert_eq!(f0.plan()[0].recv, f1.plan()[0].send);
    }

    #[tokio::test]
    async fn test_grid_halo_sync() {
        let parts = partitions();
        let comms = LocalCluster::new(2);
        let mut handles = Vec::new();
        for (partition, comm) in parts.into_iter().zip(comms) {
            handles.push(tokio::spawn(async move {
                let mut field: HaloField<GridStorage<f64, 1>, 1> = HaloField::grid(&partition).unwrap();
                for p in partition.bounds().points() {
                    field.storage_mut().set(&p, p.0[0] as f64 * 2.0).unwrap();
                }
                field.sync(&comm).await.unwrap();
                (partition.pid(), field)
            }));
        }
        for handle in handles {
            let (pid, field) = handle.await.unwrap();
            let halo = if pid == 0 { 50..55 } else { 45..50 };
            for x in halo {
                assert_eq!(*field.storage().get(&IntPoint([x])).unwrap(), x as f64 * 2.0);
            }
            assert_eq!(field.stats().syncs, 1);
        }
    }
}
