// packages/engine/src/partition/mod.rs
//! Spatial decomposition and neighbor topology
//!
//! Every process holds the full, globally agreed layout, so any point can be
//! mapped to its owning process without communication. The layout only
//! changes through [`Partition::commit`], which brackets the change with the
//! registered pre- and post-commit hooks:
//!
//! ```text
//! commit(change)
//!   ├─ validate change on a copy of the layout
//!   ├─ pre-commit hooks   (transporter drains in-flight envelopes)
//!   ├─ apply layout, recompute neighbors, bump epoch
//!   └─ post-commit hooks  (transporter re-routes, fields reshape and sync)
//! ```
//!
//! Two layouts are supported:
//!
//! - **Uniform**: equal rectangles, fixed for the run
//! - **Tree**: hierarchical 2^D-ary decomposition, reshaped by the load balancer

pub mod geometry;
pub mod tree;
pub mod uniform;

// Re-export commonly used types
pub use geometry::{IntPoint, IntRect, RealPoint};
pub use tree::{NodeId, PartitionTree, TreeNode};
pub use uniform::UniformGrid;

use crate::utils::config::{ClusterConfig, PartitionConfig, PartitionStrategy};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::ProcessId;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Callback run around a structural partition change
#[async_trait]
pub trait CommitHook<const D: usize>: Send + Sync {
    async fn on_commit(&self, partition: &Partition<D>) -> Result<()>;
}

/// A structural change to a tree layout
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionChange<const D: usize> {
    /// Move the split point of an internal node
    MoveOrigin { node: NodeId, origin: IntPoint<D> },

    /// Merge a group of sibling leaves and split an overloaded leaf
    Restructure { merge: NodeId, split: NodeId },

    /// Several changes applied as one commit
    Batch(Vec<PartitionChange<D>>),
}

/// Decomposition layout
#[derive(Debug, Clone, PartialEq)]
pub enum Layout<const D: usize> {
    Uniform(UniformGrid<D>),
    Tree(PartitionTree<D>),
}

impl<const D: usize> Layout<D> {
    fn bounds_of(&self, pid: ProcessId) -> Option<IntRect<D>> {
        match self {
            Layout::Uniform(grid) => grid.bounds_of(pid),
            Layout::Tree(tree) => tree.leaf_of_process(pid).map(|n| n.shape),
        }
    }

    fn owner(&self, p: &IntPoint<D>) -> Option<ProcessId> {
        match self {
            Layout::Uniform(grid) => grid.owner(p),
            Layout::Tree(tree) => tree.leaf_containing(p).and_then(|id| tree.node(id)).and_then(|n| n.process),
        }
    }

    fn apply(&mut self, change: &PartitionChange<D>) -> Result<()> {
        let tree = match self {
            Layout::Tree(tree) => tree,
            Layout::Uniform(_) => {
                return Err(EngineError::InvalidChange("uniform partitions are fixed for the run".into()));
            }
        };
        match change {
            PartitionChange::MoveOrigin { node, origin } => tree.move_origin(*node, *origin),
            PartitionChange::Restructure { merge, split } => tree.restructure(*merge, *split),
            PartitionChange::Batch(changes) => {
                for change in changes {
                    self.apply(change)?;
                }
                Ok(())
            }
        }
    }
}

/// This process's view of the decomposition
pub struct Partition<const D: usize> {
    pid: ProcessId,

    count: usize,

    world: IntRect<D>,

    aoi: i64,

    layout: Layout<D>,

    /// Sorted neighbor ids, recomputed on every commit
    neighbors: Vec<ProcessId>,

    /// Number of committed changes
    epoch: u64,

    pre_commit: Vec<Arc<dyn CommitHook<D>>>,

    post_commit: Vec<Arc<dyn CommitHook<D>>>,
}

impl<const D: usize> Partition<D> {
    fn with_layout(layout: Layout<D>, world: IntRect<D>, count: usize, pid: ProcessId, aoi: i64) -> Result<Self> {
        if pid >= count {
            return Err(EngineError::Config(format!("process {} out of range for {} processes", pid, count)));
        }
        // Half-open rects only overlap a neighbor's halo when aoi >= 1
        if aoi < 1 {
            return Err(EngineError::Config(format!("aoi must be at least 1, got {}", aoi)));
        }
        let mut partition = Self {
            pid,
            count,
            world,
            aoi,
            layout,
            neighbors: Vec::new(),
            epoch: 0,
            pre_commit: Vec::new(),
            post_commit: Vec::new(),
        };
        partition.neighbors = partition.compute_neighbors()?;
        info!(
            "Partition {}/{} owns {} with neighbors {:?}",
            pid,
            count,
            partition.bounds(),
            partition.neighbors
        );
        Ok(partition)
    }

    /// Equal rectangles, one per process
    pub fn uniform(world: IntRect<D>, count: usize, pid: ProcessId, aoi: i64) -> Result<Self> {
        let grid = UniformGrid::new(world, count)?;
        Self::with_layout(Layout::Uniform(grid), world, count, pid, aoi)
    }

    /// Tree built by halving the largest leaf until there is one per process
    pub fn tree(world: IntRect<D>, count: usize, pid: ProcessId, aoi: i64) -> Result<Self> {
        let tree = PartitionTree::balanced(world, count)?;
        Self::with_layout(Layout::Tree(tree), world, count, pid, aoi)
    }

    /// Tree built from explicit split points
    pub fn tree_with_splits(
        world: IntRect<D>,
        splits: &[IntPoint<D>],
        count: usize,
        pid: ProcessId,
        aoi: i64,
    ) -> Result<Self> {
        let tree = PartitionTree::from_splits(world, splits, count)?;
        Self::with_layout(Layout::Tree(tree), world, count, pid, aoi)
    }

    pub fn from_config(partition: &PartitionConfig, cluster: &ClusterConfig) -> Result<Self> {
        let world = partition.world::<D>()?;
        match partition.strategy {
            PartitionStrategy::Uniform => {
                Self::uniform(world, cluster.process_count, cluster.process_id, partition.aoi)
            }
            PartitionStrategy::Tree => Self::tree(world, cluster.process_count, cluster.process_id, partition.aoi),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn process_count(&self) -> usize {
        self.count
    }

    pub fn world(&self) -> IntRect<D> {
        self.world
    }

    pub fn aoi(&self) -> i64 {
        self.aoi
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn layout(&self) -> &Layout<D> {
        &self.layout
    }

    /// The tree, when this is a tree layout
    pub fn tree_layout(&self) -> Option<&PartitionTree<D>> {
        match &self.layout {
            Layout::Tree(tree) => Some(tree),
            Layout::Uniform(_) => None,
        }
    }

    /// Core bounds owned by this process
    pub fn bounds(&self) -> IntRect<D> {
        self.layout.bounds_of(self.pid).unwrap_or(self.world)
    }

    /// Core bounds grown by the AOI, clipped to the world
    pub fn halo_bounds(&self) -> IntRect<D> {
        self.halo_of(&self.bounds())
    }

    fn halo_of(&self, core: &IntRect<D>) -> IntRect<D> {
        core.expand(self.aoi).intersection(&self.world).unwrap_or(*core)
    }

    /// Core bounds of any process
    pub fn bounds_of(&self, pid: ProcessId) -> Result<IntRect<D>> {
        self.layout
            .bounds_of(pid)
            .ok_or_else(|| EngineError::InvalidDestination(format!("no process {} in a run of {}", pid, self.count)))
    }

    /// Core bounds of every process, indexed by id
    pub fn all_bounds(&self) -> Result<Vec<IntRect<D>>> {
        (0..self.count).map(|pid| self.bounds_of(pid)).collect()
    }

    /// Processes whose core intersects this process's halo, sorted
    pub fn neighbors(&self) -> &[ProcessId] {
        &self.neighbors
    }

    pub fn is_neighbor(&self, pid: ProcessId) -> bool {
        self.neighbors.binary_search(&pid).is_ok()
    }

    fn compute_neighbors(&self) -> Result<Vec<ProcessId>> {
        let halo = self.halo_bounds();
        let mut out = Vec::new();
        for pid in 0..self.count {
            if pid != self.pid && self.bounds_of(pid)?.intersects(&halo) {
                out.push(pid);
            }
        }
        Ok(out)
    }

    pub fn owns(&self, p: &IntPoint<D>) -> bool {
        self.bounds().contains(p)
    }

    pub fn owns_real(&self, p: &RealPoint<D>) -> bool {
        self.bounds().contains_real(p)
    }

    /// Owning process of any point in the world
    pub fn to_process_id(&self, p: &IntPoint<D>) -> Result<ProcessId> {
        self.layout
            .owner(p)
            .ok_or_else(|| EngineError::OutOfDomain(format!("{} is outside {}", p, self.world)))
    }

    /// Owning process of a continuous point
    pub fn locate(&self, p: &RealPoint<D>) -> Result<ProcessId> {
        if !p.is_finite() || !self.world.contains_real(p) {
            return Err(EngineError::OutOfDomain(format!("{} is outside {}", p, self.world)));
        }
        self.to_process_id(&p.floor())
    }

    /// First hop toward the owner of `p`.
    ///
    /// The owner itself when it is a neighbor (or this process), otherwise
    /// the neighbor whose bounds lie closest to `p`. Repeated hops converge
    /// because each one strictly shortens the distance to the target.
    pub fn next_hop(&self, p: &RealPoint<D>) -> Result<ProcessId> {
        let owner = self.locate(p)?;
        if owner == self.pid || self.is_neighbor(owner) {
            return Ok(owner);
        }
        let mut best: Option<(f64, ProcessId)> = None;
        for &pid in &self.neighbors {
            let distance = self.bounds_of(pid)?.distance_to(p);
            if best.map(|(d, _)| distance < d).unwrap_or(true) {
                best = Some((distance, pid));
            }
        }
        Ok(best.map(|(_, pid)| pid).unwrap_or(owner))
    }

    pub fn register_pre_commit(&mut self, hook: Arc<dyn CommitHook<D>>) {
        self.pre_commit.push(hook);
    }

    pub fn register_post_commit(&mut self, hook: Arc<dyn CommitHook<D>>) {
        self.post_commit.push(hook);
    }

    /// Check a change against a copy of the layout without applying it
    pub fn validate(&self, change: &PartitionChange<D>) -> Result<()> {
        let mut next = self.layout.clone();
        next.apply(change)?;
        self.check_layout(&next)
    }

    fn check_layout(&self, layout: &Layout<D>) -> Result<()> {
        if let Layout::Tree(tree) = layout {
            if !tree.is_consistent(self.count) {
                return Err(EngineError::InvalidChange("change leaves an unowned or empty leaf".into()));
            }
        }
        Ok(())
    }

    /// Apply a structural change under the pre/post-commit protocol.
    ///
    /// Invalid changes are rejected before any hook runs. A hook failure
    /// aborts the commit and is returned as is.
    pub async fn commit(&mut self, change: PartitionChange<D>) -> Result<()> {
        let mut next = self.layout.clone();
        next.apply(&change)?;
        self.check_layout(&next)?;

        debug!("Partition {} running {} pre-commit hooks", self.pid, self.pre_commit.len());
        let hooks = self.pre_commit.clone();
        for hook in &hooks {
            hook.on_commit(self).await?;
        }

        let before = self.bounds();
        self.layout = next;
        self.neighbors = self.compute_neighbors()?;
        self.epoch += 1;
        info!(
            "Partition {} committed epoch {}: {} -> {}, neighbors {:?}",
            self.pid,
            self.epoch,
            before,
            self.bounds(),
            self.neighbors
        );

        let hooks = self.post_commit.clone();
        for hook in &hooks {
            hook.on_commit(self).await?;
        }
        Ok(())
    }
}

impl<const D: usize> fmt::Debug for Partition<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("pid", &self.pid)
            .field("count", &self.count)
            .field("bounds", &self.bounds())
            .field("neighbors", &self.neighbors)
            .field("epoch", &self.epoch)
            .finish()
    }
}
