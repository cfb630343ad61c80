// packages/engine/src/partition/tree.rs
//! Hierarchical 2^D-ary decomposition tree
//!
//! Each internal node carries an `origin` that cuts its shape into 2^D
//! children. Bit `d` of a child's index selects the upper half along axis
//! `d`:
//!
//! ```text
//!            root [0,100)x[0,100), origin (50,50)
//!   ┌─────────────┬─────────────┬─────────────┬─────────────┐
//!   child 0       child 1       child 2       child 3
//!   lo x, lo y    lo x, hi y    hi x, lo y    hi x, hi y
//! ```
//!
//! Leaves are owned by exactly one process. Every process holds an
//! identical copy of the tree and applies the same changes in the same
//! order, so node ids and ownership agree everywhere without
//! communication.

use crate::partition::geometry::{IntPoint, IntRect};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::ProcessId;
use std::collections::BTreeMap;
use tracing::debug;

/// Node identifier, allocated in creation order
pub type NodeId = u32;

/// One node of the decomposition tree
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode<const D: usize> {
    pub id: NodeId,

    pub parent: Option<NodeId>,

    /// Depth below the root (root = 0)
    pub level: usize,

    pub shape: IntRect<D>,

    /// Split point, present on internal nodes only
    pub origin: Option<IntPoint<D>>,

    /// Child ids indexed by orthant, empty on leaves
    pub children: Vec<NodeId>,

    /// Owning process, present on leaves only
    pub process: Option<ProcessId>,
}

impl<const D: usize> TreeNode<D> {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// The decomposition tree
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionTree<const D: usize> {
    nodes: BTreeMap<NodeId, TreeNode<D>>,
    next_id: NodeId,
}

impl<const D: usize> PartitionTree<D> {
    pub const ROOT: NodeId = 0;

    /// Number of children of an internal node
    pub const FANOUT: usize = 1 << D;

    /// Single-leaf tree covering `world`, owned by process 0
    pub fn new(world: IntRect<D>) -> Self {
        let root = TreeNode {
            id: Self::ROOT,
            parent: None,
            level: 0,
            shape: world,
            origin: None,
            children: Vec::new(),
            process: Some(0),
        };
        let mut nodes = BTreeMap::new();
        nodes.insert(Self::ROOT, root);
        Self { nodes, next_id: 1 }
    }

    /// Build a tree with `count` leaves by repeatedly halving the largest leaf
    pub fn balanced(world: IntRect<D>, count: usize) -> Result<Self> {
        Self::check_count(count)?;
        let mut tree = Self::new(world);

        while tree.leaf_count() < count {
            let target = tree
                .leaves()
                .into_iter()
                .max_by(|a, b| a.shape.volume().cmp(&b.shape.volume()).then(b.id.cmp(&a.id)))
                .map(|n| (n.id, n.shape))
                .ok_or_else(|| EngineError::Config("empty partition tree".into()))?;

            if !Self::splittable(&target.1) {
                return Err(EngineError::Config(format!(
                    "cannot split {} further while building {} partitions",
                    target.1, count
                )));
            }
            tree.split(target.0, target.1.center())?;
        }

        tree.assign_processes();
        Ok(tree)
    }

    /// Build a tree by splitting, in order, the leaf containing each point
    pub fn from_splits(world: IntRect<D>, splits: &[IntPoint<D>], count: usize) -> Result<Self> {
        Self::check_count(count)?;
        let mut tree = Self::new(world);

        for point in splits {
            let leaf = tree
                .leaf_containing(point)
                .ok_or_else(|| EngineError::Config(format!("split point {} outside world {}", point, world)))?;
            tree.split(leaf, *point).map_err(|e| EngineError::Config(e.to_string()))?;
        }

        if tree.leaf_count() != count {
            return Err(EngineError::Config(format!(
                "{} split points produce {} partitions, expected {}",
                splits.len(),
                tree.leaf_count(),
                count
            )));
        }

        tree.assign_processes();
        Ok(tree)
    }

    fn check_count(count: usize) -> Result<()> {
        let step = Self::FANOUT - 1;
        if count == 0 || (count - 1) % step != 0 {
            return Err(EngineError::Config(format!(
                "a {}-ary tree cannot hold {} partitions (need 1 + k*{})",
                Self::FANOUT,
                count,
                step
            )));
        }
        Ok(())
    }

    /// Whether a leaf can be cut at its center into non-empty children
    pub fn splittable(shape: &IntRect<D>) -> bool {
        (0..D).all(|d| shape.width(d) >= 2)
    }

    fn strictly_inside(shape: &IntRect<D>, origin: &IntPoint<D>) -> bool {
        (0..D).all(|d| shape.lo.0[d] < origin.0[d] && origin.0[d] < shape.hi.0[d])
    }

    /// Shape of child `k` of a node with `shape` cut at `origin`
    pub fn child_shape(shape: &IntRect<D>, origin: &IntPoint<D>, k: usize) -> IntRect<D> {
        let mut lo = shape.lo;
        let mut hi = shape.hi;
        for d in 0..D {
            if k & (1 << d) != 0 {
                lo.0[d] = origin.0[d];
            } else {
                hi.0[d] = origin.0[d];
            }
        }
        IntRect::new(lo, hi)
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode<D>> {
        self.nodes.get(&id)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut TreeNode<D>> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| EngineError::InvalidChange(format!("unknown tree node {}", id)))
    }

    pub fn root(&self) -> Option<&TreeNode<D>> {
        self.nodes.get(&Self::ROOT)
    }

    /// Leaves in depth-first child order
    pub fn leaves(&self) -> Vec<&TreeNode<D>> {
        self.leaves_under(Self::ROOT)
    }

    /// Leaves below `id` (itself if it is a leaf), depth-first
    pub fn leaves_under(&self, id: NodeId) -> Vec<&TreeNode<D>> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                if node.is_leaf() {
                    out.push(node);
                } else {
                    stack.extend(node.children.iter().rev());
                }
            }
        }
        out
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_leaf()).count()
    }

    /// Deepest leaf level
    pub fn depth(&self) -> usize {
        self.nodes.values().filter(|n| n.is_leaf()).map(|n| n.level).max().unwrap_or(0)
    }

    /// Internal nodes at `level`, in id order
    pub fn internal_at_level(&self, level: usize) -> Vec<&TreeNode<D>> {
        self.nodes.values().filter(|n| !n.is_leaf() && n.level == level).collect()
    }

    /// Internal nodes whose children are all leaves
    pub fn sibling_groups(&self) -> Vec<&TreeNode<D>> {
        self.nodes
            .values()
            .filter(|n| {
                !n.is_leaf()
                    && n.children
                        .iter()
                        .all(|c| self.nodes.get(c).map(|c| c.is_leaf()).unwrap_or(false))
            })
            .collect()
    }

    /// Leaf whose shape contains `point`
    pub fn leaf_containing(&self, point: &IntPoint<D>) -> Option<NodeId> {
        let mut current = self.root()?;
        if !current.shape.contains(point) {
            return None;
        }
        while let Some(origin) = current.origin {
            let mut k = 0usize;
            for d in 0..D {
                if point.0[d] >= origin.0[d] {
                    k |= 1 << d;
                }
            }
            current = self.nodes.get(current.children.get(k)?)?;
        }
        Some(current.id)
    }

    pub fn leaf_of_process(&self, pid: ProcessId) -> Option<&TreeNode<D>> {
        self.nodes.values().find(|n| n.is_leaf() && n.process == Some(pid))
    }

    /// Give leaf `i` (depth-first) to process `i`
    pub fn assign_processes(&mut self) {
        let ids: Vec<NodeId> = self.leaves().iter().map(|n| n.id).collect();
        for (pid, id) in ids.into_iter().enumerate() {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.process = Some(pid);
            }
        }
    }

    /// Cut leaf `id` at `origin` into 2^D children.
    ///
    /// Child 0 inherits the leaf's process; the others start unowned.
    pub fn split(&mut self, id: NodeId, origin: IntPoint<D>) -> Result<Vec<NodeId>> {
        let (shape, level, process) = {
            let node = self.node_mut(id)?;
            if !node.is_leaf() {
                return Err(EngineError::InvalidChange(format!("node {} is already split", id)));
            }
            (node.shape, node.level, node.process)
        };
        if !Self::strictly_inside(&shape, &origin) {
            return Err(EngineError::InvalidChange(format!(
                "origin {} does not cut {} into non-empty parts",
                origin, shape
            )));
        }

        let mut children = Vec::with_capacity(Self::FANOUT);
        for k in 0..Self::FANOUT {
            let child_id = self.next_id;
            self.next_id += 1;
            self.nodes.insert(
                child_id,
                TreeNode {
                    id: child_id,
                    parent: Some(id),
                    level: level + 1,
                    shape: Self::child_shape(&shape, &origin, k),
                    origin: None,
                    children: Vec::new(),
                    process: if k == 0 { process } else { None },
                },
            );
            children.push(child_id);
        }

        let node = self.node_mut(id)?;
        node.origin = Some(origin);
        node.children = children.clone();
        node.process = None;
        debug!("Split tree node {} at {} into {:?}", id, origin, children);
        Ok(children)
    }

    /// Collapse every descendant of `id` into `id`.
    ///
    /// Returns the processes of the removed leaves in depth-first order;
    /// the merged leaf is left unowned.
    pub fn merge(&mut self, id: NodeId) -> Result<Vec<ProcessId>> {
        if self.node_mut(id)?.is_leaf() {
            return Err(EngineError::InvalidChange(format!("node {} is a leaf", id)));
        }
        let freed: Vec<ProcessId> = self.leaves_under(id).iter().filter_map(|n| n.process).collect();

        let mut stack = self.node_mut(id)?.children.clone();
        while let Some(child) = stack.pop() {
            if let Some(node) = self.nodes.remove(&child) {
                stack.extend(node.children);
            }
        }

        let node = self.node_mut(id)?;
        node.children.clear();
        node.origin = None;
        node.process = None;
        debug!("Merged tree node {}, freed processes {:?}", id, freed);
        Ok(freed)
    }

    /// Move the split point of internal node `id`, reshaping its subtree
    pub fn move_origin(&mut self, id: NodeId, origin: IntPoint<D>) -> Result<()> {
        let shape = {
            let node = self.node_mut(id)?;
            if node.is_leaf() {
                return Err(EngineError::InvalidChange(format!("leaf {} has no origin", id)));
            }
            node.shape
        };
        if !Self::strictly_inside(&shape, &origin) {
            return Err(EngineError::InvalidChange(format!("origin {} not inside {}", origin, shape)));
        }
        self.node_mut(id)?.origin = Some(origin);
        self.reshape_children(id)
    }

    fn reshape(&mut self, id: NodeId, shape: IntRect<D>) -> Result<()> {
        let node = self.node_mut(id)?;
        node.shape = shape;
        if node.is_leaf() {
            return Ok(());
        }
        let needs_reset = node.origin.map(|o| !Self::strictly_inside(&shape, &o)).unwrap_or(true);
        if needs_reset {
            if !Self::splittable(&shape) {
                return Err(EngineError::InvalidChange(format!(
                    "node {} shrinks to {} and cannot keep its children",
                    id, shape
                )));
            }
            node.origin = Some(shape.center());
        }
        self.reshape_children(id)
    }

    fn reshape_children(&mut self, id: NodeId) -> Result<()> {
        let (shape, origin, children) = {
            let node = self.node_mut(id)?;
            match node.origin {
                Some(origin) => (node.shape, origin, node.children.clone()),
                None => return Ok(()),
            }
        };
        for (k, child) in children.into_iter().enumerate() {
            self.reshape(child, Self::child_shape(&shape, &origin, k))?;
        }
        Ok(())
    }

    /// Merge sibling group `merge` and split leaf `split`, handing the
    /// processes freed by the merge to the new children.
    pub fn restructure(&mut self, merge: NodeId, split: NodeId) -> Result<()> {
        let group = self
            .node(merge)
            .ok_or_else(|| EngineError::InvalidChange(format!("unknown tree node {}", merge)))?;
        if group.is_leaf() || group.children.iter().any(|c| self.node(*c).map(|n| !n.is_leaf()).unwrap_or(true)) {
            return Err(EngineError::InvalidChange(format!("node {} is not a group of leaves", merge)));
        }
        if group.children.contains(&split) {
            return Err(EngineError::InvalidChange(format!("leaf {} belongs to merged group {}", split, merge)));
        }
        let target = self
            .node(split)
            .ok_or_else(|| EngineError::InvalidChange(format!("unknown tree node {}", split)))?;
        if !target.is_leaf() || !Self::splittable(&target.shape) {
            return Err(EngineError::InvalidChange(format!("leaf {} cannot be split", split)));
        }
        let center = target.shape.center();

        let freed = self.merge(merge)?;
        let (keeper, rest) = freed
            .split_first()
            .ok_or_else(|| EngineError::InvalidChange(format!("group {} owned no processes", merge)))?;
        self.node_mut(merge)?.process = Some(*keeper);

        let children = self.split(split, center)?;
        for (child, pid) in children.iter().skip(1).zip(rest.iter()) {
            self.node_mut(*child)?.process = Some(*pid);
        }
        Ok(())
    }

    /// Every leaf owned, each process exactly once
    pub fn is_consistent(&self, count: usize) -> bool {
        let mut seen = vec![false; count];
        for leaf in self.leaves() {
            match leaf.process {
                Some(pid) if pid < count && !seen[pid] => seen[pid] = true,
                _ => return false,
            }
            if leaf.shape.is_empty() {
                return false;
            }
        }
        seen.into_iter().all(|s| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world2() -> IntRect<2> {
        IntRect::new(IntPoint([0, 0]), IntPoint([100, 100]))
    }

    #[test]
    fn test_balanced_quad_tree() {
        let tree = PartitionTree::balanced(world2(), 7).unwrap();
        assert_eq!(tree.leaf_count(), 7);
        assert_eq!(tree.depth(), 2);
        assert!(tree.is_consistent(7));

        let total: u64 = tree.leaves().iter().map(|n| n.shape.volume()).sum();
        assert_eq!(total, world2().volume());
    }

    #[test]
    fn test_incompatible_count_rejected() {
        assert!(matches!(PartitionTree::balanced(world2(), 2), Err(EngineError::Config(_))));
        assert!(matches!(PartitionTree::balanced(world2(), 5), Err(EngineError::Config(_))));
        // Binary trees accept any count
        let line = IntRect::new(IntPoint([0]), IntPoint([100]));
        assert_eq!(PartitionTree::balanced(line, 5).unwrap().leaf_count(), 5);
    }

    #[test]
    fn test_from_splits() {
        let tree = PartitionTree::from_splits(world2(), &[IntPoint([30, 60]), IntPoint([10, 10])], 7).unwrap();
        let first = tree.node(tree.leaf_containing(&IntPoint([0, 0])).unwrap()).unwrap();
        assert_eq!(first.shape, IntRect::new(IntPoint([0, 0]), IntPoint([10, 10])));
        assert_eq!(first.process, Some(0));
    }

    #[test]
    fn test_leaf_lookup_child_bits() {
        let tree = PartitionTree::balanced(world2(), 4).unwrap();
        // child 2 has bit 0 clear (low x) and bit 1 set (high y)
        let leaf = tree.node(tree.leaf_containing(&IntPoint([10, 90])).unwrap()).unwrap();
        assert_eq!(leaf.process, Some(2));
        assert_eq!(leaf.shape, IntRect::new(IntPoint([0, 50]), IntPoint([50, 100])));
    }

    #[test]
    fn test_move_origin_resets_grandchild_origin() {
        let mut tree = PartitionTree::from_splits(world2(), &[IntPoint([50, 50]), IntPoint([25, 25])], 7).unwrap();
        // node 1 is the low/low quadrant, split at (25,25); shrinking it to
        // [0,20)^2 pushes that origin outside and it is re-centered
        tree.move_origin(PartitionTree::<2>::ROOT, IntPoint([20, 20])).unwrap();
        let child = tree.node(1).unwrap();
        assert_eq!(child.shape, IntRect::new(IntPoint([0, 0]), IntPoint([20, 20])));
        assert_eq!(child.origin, Some(IntPoint([10, 10])));
        assert!(tree.is_consistent(7));
    }

    #[test]
    fn test_move_origin_rejects_edge() {
        let mut tree = PartitionTree::balanced(world2(), 4).unwrap();
        let before = tree.clone();
        assert!(tree.move_origin(PartitionTree::<2>::ROOT, IntPoint([0, 50])).is_err());
        assert_eq!(tree, before);
    }

    #[test]
    fn test_restructure_moves_processes() {
        let mut tree = PartitionTree::balanced(world2(), 7).unwrap();
        let group = tree.sibling_groups()[0].id;
        let outside = tree
            .leaves()
            .iter()
            .find(|n| n.parent != Some(group))
            .map(|n| n.id)
            .unwrap();

        tree.restructure(group, outside).unwrap();
        assert_eq!(tree.leaf_count(), 7);
        assert!(tree.is_consistent(7));
        assert!(tree.node(group).unwrap().is_leaf());
        assert!(!tree.node(outside).unwrap().is_leaf());
    }
}
