// packages/engine/src/utils/ids.rs
//! Identifiers carried across process boundaries

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rank of a process in the run
pub type ProcessId = usize;

/// Index of a field registered with the engine
pub type FieldId = u32;

/// Stable entity identifier, assigned at creation and kept through migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0 >> EntityIdAllocator::RANK_SHIFT, self.0 & EntityIdAllocator::SEQ_MASK)
    }
}

/// Deterministic per-process id allocator: `(rank << 40) | seq`
#[derive(Debug, Clone)]
pub struct EntityIdAllocator {
    rank: u64,
    next: u64,
}

impl EntityIdAllocator {
    const RANK_SHIFT: u32 = 40;
    const SEQ_MASK: u64 = (1 << Self::RANK_SHIFT) - 1;

    pub fn new(rank: ProcessId) -> Self {
        Self { rank: rank as u64, next: 0 }
    }

    /// Allocate the next id
    pub fn allocate(&mut self) -> EntityId {
        let id = (self.rank << Self::RANK_SHIFT) | (self.next & Self::SEQ_MASK);
        self.next += 1;
        EntityId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_unique_across_ranks() {
        let mut a = EntityIdAllocator::new(0);
        let mut b = EntityIdAllocator::new(1);
        let first_a = a.allocate();
        let first_b = b.allocate();
        assert_ne!(first_a, first_b);
        assert_eq!(a.allocate(), EntityId(1));
        assert_eq!(first_b.to_string(), "1:0");
        assert_eq!(a.allocate(), EntityId(2));
    }
}
