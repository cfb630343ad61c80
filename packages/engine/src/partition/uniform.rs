// packages/engine/src/partition/uniform.rs
//! Fixed uniform decomposition
//!
//! The process count is factorised into a `D`-dimensional grid of
//! near-equal factors, the largest factor landing on the widest axis.
//! Process ids run row-major over the cells (last axis fastest). The last
//! cell on each axis absorbs the remainder of the division.

use crate::partition::geometry::{IntPoint, IntRect};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::ProcessId;

/// Uniform grid of partitions
#[derive(Debug, Clone, PartialEq)]
pub struct UniformGrid<const D: usize> {
    world: IntRect<D>,

    /// Cells per axis
    dims: [usize; D],
}

impl<const D: usize> UniformGrid<D> {
    pub fn new(world: IntRect<D>, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(EngineError::Config("process count must be positive".into()));
        }
        let dims = Self::factorize(&world, count);
        for d in 0..D {
            if (world.width(d) as usize) < dims[d] {
                return Err(EngineError::Config(format!(
                    "axis {} of {} is too narrow for {} partitions",
                    d, world, dims[d]
                )));
            }
        }
        Ok(Self { world, dims })
    }

    fn factorize(world: &IntRect<D>, count: usize) -> [usize; D] {
        let mut primes = Vec::new();
        let mut n = count;
        let mut f = 2;
        while f * f <= n {
            while n % f == 0 {
                primes.push(f);
                n /= f;
            }
            f += 1;
        }
        if n > 1 {
            primes.push(n);
        }
        primes.sort_unstable_by(|a, b| b.cmp(a));

        let mut factors = [1usize; D];
        for p in primes {
            if let Some(slot) = factors.iter_mut().min_by_key(|v| **v) {
                *slot *= p;
            }
        }
        factors.sort_unstable_by(|a, b| b.cmp(a));

        let mut axes: Vec<usize> = (0..D).collect();
        axes.sort_by(|a, b| world.width(*b).cmp(&world.width(*a)).then(a.cmp(b)));

        let mut dims = [1usize; D];
        for (axis, factor) in axes.into_iter().zip(factors) {
            dims[axis] = factor;
        }
        dims
    }

    pub fn dims(&self) -> [usize; D] {
        self.dims
    }

    pub fn process_count(&self) -> usize {
        self.dims.iter().product()
    }

    fn step(&self, axis: usize) -> i64 {
        self.world.width(axis) / self.dims[axis] as i64
    }

    /// Bounds of the partition owned by `pid`
    pub fn bounds_of(&self, pid: ProcessId) -> Option<IntRect<D>> {
        if pid >= self.process_count() {
            return None;
        }
        let mut rest = pid;
        let mut cell = [0usize; D];
        for d in (0..D).rev() {
            cell[d] = rest % self.dims[d];
            rest /= self.dims[d];
        }

        let mut lo = self.world.lo;
        let mut hi = self.world.hi;
        for d in 0..D {
            let step = self.step(d);
            lo.0[d] = self.world.lo.0[d] + cell[d] as i64 * step;
            if cell[d] + 1 < self.dims[d] {
                hi.0[d] = lo.0[d] + step;
            }
        }
        Some(IntRect::new(lo, hi))
    }

    /// Owner of a point inside the world
    pub fn owner(&self, p: &IntPoint<D>) -> Option<ProcessId> {
        if !self.world.contains(p) {
            return None;
        }
        let mut pid = 0usize;
        for d in 0..D {
            let index = ((p.0[d] - self.world.lo.0[d]) / self.step(d)) as usize;
            pid = pid * self.dims[d] + index.min(self.dims[d] - 1);
        }
        Some(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_one_dimensional_halves() {
        let grid = UniformGrid::new(IntRect::new(IntPoint([0]), IntPoint([100])), 2).unwrap();
        assert_eq!(grid.bounds_of(0), Some(IntRect::new(IntPoint([0]), IntPoint([50]))));
        assert_eq!(grid.bounds_of(1), Some(IntRect::new(IntPoint([50]), IntPoint([100]))));
        assert_eq!(grid.owner(&IntPoint([49])), Some(0));
        assert_eq!(grid.owner(&IntPoint([50])), Some(1));
        assert_eq!(grid.owner(&IntPoint([100])), None);
    }

    #[test]
    fn test_factorization_prefers_wide_axis() {
        let world = IntRect::new(IntPoint([0, 0]), IntPoint([300, 100]));
        let grid = UniformGrid::new(world, 6).unwrap();
        assert_eq!(grid.dims(), [3, 2]);

        let grid = UniformGrid::new(world, 7).unwrap();
        assert_eq!(grid.dims(), [7, 1]);
    }

    #[test]
    fn test_remainder_absorbed_by_last_cell() {
        let grid = UniformGrid::new(IntRect::new(IntPoint([0]), IntPoint([10])), 3).unwrap();
        assert_eq!(grid.bounds_of(2), Some(IntRect::new(IntPoint([6]), IntPoint([10]))));
        assert_eq!(grid.owner(&IntPoint([9])), Some(2));
    }

    #[test]
    fn test_too_narrow() {
        assert!(UniformGrid::new(IntRect::new(IntPoint([0]), IntPoint([3])), 4).is_err());
    }

    proptest! {
        #[test]
        fn test_every_cell_has_one_owner(
            lo in (-20i64..20, -20i64..20),
            size in (1i64..40, 1i64..40),
            count in 1usize..12,
        ) {
            let world = IntRect::new(IntPoint([lo.0, lo.1]), IntPoint([lo.0 + size.0, lo.1 + size.1]));
            let grid = match UniformGrid::new(world, count) {
                Ok(grid) => grid,
                Err(_) => return Ok(()),
            };
            let parts: Vec<_> = (0..count).map(|pid| grid.bounds_of(pid).unwrap()).collect();
            let total: u64 = parts.iter().map(|r| r.volume()).sum();
            prop_assert_eq!(total, world.volume());

            for p in world.points() {
                let owner = grid.owner(&p).unwrap();
                prop_assert!(parts[owner].contains(&p));
                prop_assert_eq!(parts.iter().filter(|r| r.contains(&p)).count(), 1);
            }
        }
    }
}
