// packages/engine/src/field/continuous.rs
//! Bucketed storage for continuous space
//!
//! Space is cut into cubic cells of edge `discretization`. Each cell holds
//! the ids of the entities inside it; side maps give each entity's exact
//! position and value.
//!
//! ```text
//! cells:      (3,1) -> {e7, e9}      (3,2) -> {e2}
//! positions:  e7 -> (12.5, 4.1)      e9 -> (13.9, 7.7)
//! values:     e7 -> Agent{..}        ...
//! ```
//!
//! Neighborhood queries only look at local core and halo data.

use crate::field::HaloStorage;
use crate::partition::geometry::{IntPoint, IntRect, RealPoint};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::EntityId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// An entity removed from storage: id, position, value
pub type Placed<T, const D: usize> = (EntityId, RealPoint<D>, T);

/// Bucketed continuous storage
#[derive(Debug, Clone)]
pub struct ContinuousStorage<T, const D: usize> {
    discretization: f64,

    core: IntRect<D>,

    halo: IntRect<D>,

    cells: HashMap<IntPoint<D>, BTreeSet<EntityId>>,

    positions: HashMap<EntityId, RealPoint<D>>,

    values: HashMap<EntityId, T>,
}

impl<T, const D: usize> ContinuousStorage<T, D>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Empty storage with cells of edge `discretization`
    pub fn new(discretization: f64) -> Result<Self> {
        if !(discretization.is_finite() && discretization > 0.0) {
            return Err(EngineError::Config(format!("invalid discretization {}", discretization)));
        }
        let origin = IntPoint::splat(0);
        Ok(Self {
            discretization,
            core: IntRect::new(origin, origin),
            halo: IntRect::new(origin, origin),
            cells: HashMap::new(),
            positions: HashMap::new(),
            values: HashMap::new(),
        })
    }

    pub fn discretization(&self) -> f64 {
        self.discretization
    }

    pub fn core(&self) -> IntRect<D> {
        self.core
    }

    pub fn halo(&self) -> IntRect<D> {
        self.halo
    }

    fn cell_of(&self, p: &RealPoint<D>) -> IntPoint<D> {
        IntPoint(p.0.map(|c| (c / self.discretization).floor() as i64))
    }

    /// Cells overlapping the real box `[lo, hi]`
    fn cells_between(&self, lo: &RealPoint<D>, hi: &RealPoint<D>) -> IntRect<D> {
        IntRect::new(self.cell_of(lo), self.cell_of(hi).offset(1))
    }

    /// Cells that can hold anything: those covering the halo
    fn extent(&self) -> IntRect<D> {
        self.cells_between(&self.halo.lo.to_real(), &self.halo.hi.to_real())
    }

    /// Cells overlapping `[lo, hi]` that lie inside the extent
    fn cells_within(&self, lo: &RealPoint<D>, hi: &RealPoint<D>) -> Option<IntRect<D>> {
        self.cells_between(lo, hi).intersection(&self.extent())
    }

    /// Insert or move an entity owned by this process
    pub fn insert(&mut self, id: EntityId, position: RealPoint<D>, value: T) -> Result<()> {
        self.check_core(&position)?;
        self.place(id, position, value);
        Ok(())
    }

    fn check_core(&self, position: &RealPoint<D>) -> Result<()> {
        if self.core.contains_real(position) {
            Ok(())
        } else if self.halo.contains_real(position) {
            Err(EngineError::NotLocal(format!("{} is in the halo, owned by a neighbor", position)))
        } else {
            Err(EngineError::OutOfDomain(format!("{} outside local storage {}", position, self.halo)))
        }
    }

    fn place(&mut self, id: EntityId, position: RealPoint<D>, value: T) {
        self.unlink(id);
        self.cells.entry(self.cell_of(&position)).or_default().insert(id);
        self.positions.insert(id, position);
        self.values.insert(id, value);
    }

    fn unlink(&mut self, id: EntityId) -> Option<RealPoint<D>> {
        let old = self.positions.remove(&id)?;
        let cell = self.cell_of(&old);
        if let Some(members) = self.cells.get_mut(&cell) {
            members.remove(&id);
            if members.is_empty() {
                self.cells.remove(&cell);
            }
        }
        Some(old)
    }

    /// Move a stored entity to a new core position
    pub fn relocate(&mut self, id: EntityId, position: RealPoint<D>) -> Result<()> {
        self.check_core(&position)?;
        let value = self
            .values
            .remove(&id)
            .ok_or_else(|| EngineError::NotLocal(format!("entity {} is not stored here", id)))?;
        self.place(id, position, value);
        Ok(())
    }

    pub fn remove(&mut self, id: EntityId) -> Option<(RealPoint<D>, T)> {
        let position = self.unlink(id)?;
        let value = self.values.remove(&id)?;
        Some((position, value))
    }

    pub fn get(&self, id: EntityId) -> Option<&T> {
        self.values.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut T> {
        self.values.get_mut(&id)
    }

    pub fn position(&self, id: EntityId) -> Option<RealPoint<D>> {
        self.positions.get(&id).copied()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.values.contains_key(&id)
    }

    /// Entities stored, core and halo
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Ids of entities owned by this process, sorted
    pub fn core_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<_> = self
            .positions
            .iter()
            .filter(|(_, p)| self.core.contains_real(p))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Entities at exactly `position`
    pub fn objects_at(&self, position: &RealPoint<D>) -> Vec<EntityId> {
        self.cells
            .get(&self.cell_of(position))
            .map(|members| {
                members
                    .iter()
                    .filter(|id| self.positions.get(id) == Some(position))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entities inside an integer rectangle, sorted
    pub fn objects_in(&self, rect: &IntRect<D>) -> Vec<EntityId> {
        if rect.is_empty() {
            return Vec::new();
        }
        let Some(cells) = self.cells_within(&rect.lo.to_real(), &rect.hi.to_real()) else {
            return Vec::new();
        };
        let mut ids: Vec<_> = cells
            .points()
            .filter_map(|cell| self.cells.get(&cell))
            .flatten()
            .filter(|id| self.positions.get(id).map(|p| rect.contains_real(p)).unwrap_or(false))
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Entities within `radius` of `center`, nearest first (ties by id)
    pub fn radius(&self, center: &RealPoint<D>, radius: f64) -> Vec<EntityId> {
        if !(radius >= 0.0) || !center.is_finite() {
            return Vec::new();
        }
        let lo = RealPoint(center.0.map(|c| c - radius));
        let hi = RealPoint(center.0.map(|c| c + radius));
        let Some(cells) = self.cells_within(&lo, &hi) else {
            return Vec::new();
        };
        let mut found: Vec<(f64, EntityId)> = cells
            .points()
            .filter_map(|cell| self.cells.get(&cell))
            .flatten()
            .filter_map(|id| {
                let distance = self.positions.get(id)?.distance(center);
                (distance <= radius).then_some((distance, *id))
            })
            .collect();
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        found.into_iter().map(|(_, id)| id).collect()
    }

    /// The `k` entities nearest to `center` (ties by id).
    ///
    /// Scans rings of cells outward from the center cell. After ring `r`
    /// every unseen entity is at least `r * discretization` away, which
    /// bounds the search once `k` candidates are that close.
    pub fn knn(&self, center: &RealPoint<D>, k: usize) -> Vec<EntityId> {
        if k == 0 || self.values.is_empty() || !center.is_finite() {
            return Vec::new();
        }
        let origin = self.cell_of(center);
        let extent = self.extent();
        if !extent.contains(&origin) {
            // Center outside the halo: scan every entity
            let mut found: Vec<(f64, EntityId)> =
                self.positions.iter().map(|(id, p)| (p.distance(center), *id)).collect();
            found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            return found.into_iter().take(k).map(|(_, id)| id).collect();
        }
        let max_ring = (0..D)
            .map(|d| (origin.0[d] - extent.lo.0[d]).max(extent.hi.0[d] - origin.0[d]))
            .max()
            .unwrap_or(0);

        let mut found: Vec<(f64, EntityId)> = Vec::new();
        for ring in 0..=max_ring {
            let band = IntRect::new(origin.offset(-ring), origin.offset(ring + 1));
            let Some(band) = band.intersection(&extent) else { continue };
            for cell in band.points().filter(|c| c.chebyshev(&origin) == ring) {
                if let Some(members) = self.cells.get(&cell) {
                    for id in members {
                        if let Some(p) = self.positions.get(id) {
                            found.push((p.distance(center), *id));
                        }
                    }
                }
            }
            if found.len() >= k {
                found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                if found[k - 1].0 <= ring as f64 * self.discretization {
                    break;
                }
            }
        }
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        found.into_iter().take(k).map(|(_, id)| id).collect()
    }
}

impl<T, const D: usize> HaloStorage<D> for ContinuousStorage<T, D>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    type Evicted = Placed<T, D>;

    fn reshape(&mut self, core: IntRect<D>, halo: IntRect<D>) -> Vec<Self::Evicted> {
        let old_core = self.core;
        let mut ids: Vec<_> = self.positions.keys().copied().collect();
        ids.sort_unstable();

        let mut evicted = Vec::new();
        let mut ghosts = 0usize;
        for id in ids {
            let Some(position) = self.position(id) else { continue };
            let owned = old_core.contains_real(&position);
            if owned && core.contains_real(&position) {
                continue;
            }
            if let Some((position, value)) = self.remove(id) {
                if owned {
                    evicted.push((id, position, value));
                } else {
                    ghosts += 1;
                }
            }
        }

        self.core = core;
        self.halo = halo;
        debug!(
            "Continuous storage reshaped to core {}, kept {}, evicted {}, dropped {} ghosts",
            core,
            self.len(),
            evicted.len(),
            ghosts
        );
        evicted
    }

    fn pack(&self, rect: &IntRect<D>) -> Result<Vec<u8>> {
        let entries: Vec<(EntityId, RealPoint<D>, &T)> = self
            .objects_in(rect)
            .into_iter()
            .filter_map(|id| Some((id, *self.positions.get(&id)?, self.values.get(&id)?)))
            .collect();
        Ok(serde_cbor::to_vec(&entries)?)
    }

    fn unpack(&mut self, rect: &IntRect<D>, data: &[u8]) -> Result<()> {
        let entries: Vec<Placed<T, D>> = serde_cbor::from_slice(data)
            .map_err(|e| EngineError::ProtocolViolation(format!("continuous halo does not decode: {}", e)))?;

        for id in self.objects_in(rect) {
            self.remove(id);
        }
        for (id, position, value) in entries {
            if !rect.contains_real(&position) || self.core.contains_real(&position) {
                return Err(EngineError::ProtocolViolation(format!(
                    "ghost {} at {} outside halo rect {}",
                    id, position, rect
                )));
            }
            self.place(id, position, value);
        }
        Ok(())
    }
}
