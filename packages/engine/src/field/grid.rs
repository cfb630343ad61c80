// packages/engine/src/field/grid.rs
//! Dense grid storage
//!
//! One value per lattice point of the halo rectangle, laid out row-major.
//! The margin is allocated up front; only the core is writable by local
//! code, the margin is filled by halo synchronization.

use crate::field::HaloStorage;
use crate::partition::geometry::{IntPoint, IntRect};
use crate::utils::errors::{EngineError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Dense storage over a halo rectangle
#[derive(Debug, Clone)]
pub struct GridStorage<T, const D: usize> {
    core: IntRect<D>,

    halo: IntRect<D>,

    /// Row-major over `halo`
    values: Vec<T>,
}

impl<T, const D: usize> GridStorage<T, D>
where
    T: Clone + Default + Serialize + DeserializeOwned + Send + Sync,
{
    /// Empty storage; shaped by the first `reshape`
    pub fn new() -> Self {
        let origin = IntPoint::splat(0);
        Self {
            core: IntRect::new(origin, origin),
            halo: IntRect::new(origin, origin),
            values: Vec::new(),
        }
    }

    pub fn core(&self) -> IntRect<D> {
        self.core
    }

    pub fn halo(&self) -> IntRect<D> {
        self.halo
    }

    fn index(&self, p: &IntPoint<D>) -> Result<usize> {
        self.halo
            .offset_of(p)
            .ok_or_else(|| EngineError::OutOfDomain(format!("{} outside local grid {}", p, self.halo)))
    }

    /// Value at any point of the core or halo
    pub fn get(&self, p: &IntPoint<D>) -> Result<&T> {
        let index = self.index(p)?;
        Ok(&self.values[index])
    }

    fn check_core(&self, p: &IntPoint<D>) -> Result<usize> {
        if !self.core.contains(p) {
            if self.halo.contains(p) {
                return Err(EngineError::NotLocal(format!("{} is in the halo, owned by a neighbor", p)));
            }
            return Err(EngineError::OutOfDomain(format!("{} outside local grid {}", p, self.halo)));
        }
        self.index(p)
    }

    /// Write a core value
    pub fn set(&mut self, p: &IntPoint<D>, value: T) -> Result<()> {
        let index = self.check_core(p)?;
        self.values[index] = value;
        Ok(())
    }

    pub fn get_mut(&mut self, p: &IntPoint<D>) -> Result<&mut T> {
        let index = self.check_core(p)?;
        Ok(&mut self.values[index])
    }

    /// Core points with their values, row-major
    pub fn iter_core(&self) -> impl Iterator<Item = (IntPoint<D>, &T)> + '_ {
        self.core.points().filter_map(move |p| self.halo.offset_of(&p).map(|i| (p, &self.values[i])))
    }

    /// Reset every core value
    pub fn fill_core(&mut self, value: T) {
        let core = self.core;
        for p in core.points() {
            if let Some(i) = self.halo.offset_of(&p) {
                self.values[i] = value.clone();
            }
        }
    }
}

impl<T, const D: usize> Default for GridStorage<T, D>
where
    T: Clone + Default + Serialize + DeserializeOwned + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const D: usize> HaloStorage<D> for GridStorage<T, D>
where
    T: Clone + Default + Serialize + DeserializeOwned + Send + Sync,
{
    type Evicted = (IntPoint<D>, T);

    fn reshape(&mut self, core: IntRect<D>, halo: IntRect<D>) -> Vec<Self::Evicted> {
        let old_core = self.core;
        let old_halo = self.halo;
        let old = std::mem::take(&mut self.values);

        let evicted: Vec<_> = old_core
            .points()
            .filter(|p| !core.contains(p))
            .filter_map(|p| old_halo.offset_of(&p).map(|i| (p, old[i].clone())))
            .collect();

        self.values = vec![T::default(); halo.volume() as usize];
        if let Some(overlap) = old_halo.intersection(&halo) {
            for p in overlap.points() {
                if let (Some(from), Some(to)) = (old_halo.offset_of(&p), halo.offset_of(&p)) {
                    self.values[to] = old[from].clone();
                }
            }
        }

        self.core = core;
        self.halo = halo;
        debug!("Grid reshaped to core {} halo {}, evicted {} cells", core, halo, evicted.len());
        evicted
    }

    fn pack(&self, rect: &IntRect<D>) -> Result<Vec<u8>> {
        let values = rect
            .points()
            .map(|p| self.get(&p).map(|v| v.clone()))
            .collect::<Result<Vec<T>>>()?;
        Ok(serde_cbor::to_vec(&values)?)
    }

    fn unpack(&mut self, rect: &IntRect<D>, data: &[u8]) -> Result<()> {
        let values: Vec<T> = serde_cbor::from_slice(data)
            .map_err(|e| EngineError::ProtocolViolation(format!("grid halo does not decode: {}", e)))?;
        if values.len() as u64 != rect.volume() {
            return Err(EngineError::ProtocolViolation(format!(
                "grid halo for {} carries {} values",
                rect,
                values.len()
            )));
        }
        for (p, value) in rect.points().zip(values) {
            let index = self
                .halo
                .offset_of(&p)
                .ok_or_else(|| EngineError::ProtocolViolation(format!("halo point {} outside {}", p, self.halo)))?;
            self.values[index] = value;
        }
        Ok(())
    }
}
