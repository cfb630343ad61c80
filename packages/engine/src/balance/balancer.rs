// packages/engine/src/balance/balancer.rs
//! Threshold/hysteresis balancing policy
//!
//! ```text
//!          imbalance >= threshold          cooldown elapsed and
//!  armed ─────────────────────────▶ fired ──imbalance < hysteresis──▶ armed
//! ```
//!
//! Imbalance is `max / mean` of the gathered costs. Origin moves walk the
//! tree one level per evaluation, deepest internal level first, wrapping
//! back after the root.

use crate::balance::cost::MovingAverage;
use crate::comm::Communicator;
use crate::observability::metrics as names;
use crate::partition::{IntPoint, IntRect, Partition, PartitionChange, PartitionTree};
use crate::utils::config::BalanceConfig;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use metrics::gauge;
use tracing::{debug, info, warn};

/// What an evaluation decided
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceOutcome<const D: usize> {
    /// No evaluation took place (disabled or uniform layout)
    Skipped,

    Unchanged { imbalance: f64 },

    /// A validated change every process computed identically
    Changed { imbalance: f64, change: PartitionChange<D> },
}

/// Decides repartitioning from gathered step costs
#[derive(Debug)]
pub struct LoadBalancer {
    config: BalanceConfig,

    average: MovingAverage,

    /// Steps recorded since start
    steps: u64,

    /// Tree level of the next origin pass
    level: Option<usize>,

    /// Evaluations left before the policy re-arms
    cooldown: u32,

    armed: bool,

    evaluations: u64,

    changes: u64,
}

impl LoadBalancer {
    pub fn new(config: BalanceConfig) -> Self {
        Self {
            average: MovingAverage::new(config.window),
            config,
            steps: 0,
            level: None,
            cooldown: 0,
            armed: true,
            evaluations: 0,
            changes: 0,
        }
    }

    pub fn config(&self) -> &BalanceConfig {
        &self.config
    }

    /// Record the cost of one local step
    pub fn record(&mut self, cost: f64) {
        self.average.push(cost);
        self.steps += 1;
    }

    /// Smoothed local cost
    pub fn local_cost(&self) -> f64 {
        self.average.value()
    }

    /// Whether this step ends an evaluation interval
    pub fn due(&self) -> bool {
        self.config.enabled && self.config.interval > 0 && self.steps > 0 && self.steps % self.config.interval == 0
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn changes(&self) -> u64 {
        self.changes
    }

    /// Gather costs from every process and decide.
    ///
    /// Collective on tree layouts: every process must call it at the same
    /// step. Uniform layouts return `Skipped` without communicating.
    pub async fn balance<const D: usize>(
        &mut self,
        partition: &Partition<D>,
        comm: &dyn Communicator,
    ) -> Result<BalanceOutcome<D>> {
        if !self.config.enabled || partition.tree_layout().is_none() {
            return Ok(BalanceOutcome::Skipped);
        }
        let local = Bytes::copy_from_slice(&self.local_cost().to_le_bytes());
        let gathered = comm.all_gather(local).await?;
        let costs = gathered
            .iter()
            .map(|raw| {
                let bytes: [u8; 8] = raw[..].try_into().map_err(|_| {
                    EngineError::CollectiveFailure(format!("malformed cost of {} bytes", raw.len()))
                })?;
                Ok(f64::from_le_bytes(bytes))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.decide(partition, &costs))
    }

    /// Decide from already gathered costs, indexed by process id
    pub fn decide<const D: usize>(&mut self, partition: &Partition<D>, costs: &[f64]) -> BalanceOutcome<D> {
        let Some(tree) = partition.tree_layout() else {
            return BalanceOutcome::Skipped;
        };
        self.evaluations += 1;

        let imbalance = imbalance(costs);
        gauge!(names::IMBALANCE).set(imbalance);
        debug!("Evaluation {}: imbalance {:.3}", self.evaluations, imbalance);

        if self.cooldown > 0 {
            self.cooldown -= 1;
            return BalanceOutcome::Unchanged { imbalance };
        }
        if !self.armed {
            if imbalance < self.config.hysteresis {
                self.armed = true;
            }
            return BalanceOutcome::Unchanged { imbalance };
        }
        if imbalance < self.config.threshold {
            return BalanceOutcome::Unchanged { imbalance };
        }

        let change = self
            .plan_restructure(tree, costs)
            .or_else(|| self.plan_origin_moves(tree, costs));
        let Some(change) = change else {
            return BalanceOutcome::Unchanged { imbalance };
        };
        if let Err(e) = partition.validate(&change) {
            warn!("Discarding balance change {:?}: {}", change, e);
            return BalanceOutcome::Unchanged { imbalance };
        }

        self.armed = false;
        self.cooldown = self.config.cooldown;
        self.changes += 1;
        // Costs measured under the old layout
        self.average.reset();
        info!("Imbalance {:.3} over threshold, changing partition: {:?}", imbalance, change);
        BalanceOutcome::Changed { imbalance, change }
    }

    /// Merge the cheapest sibling group to split a leaf far above the mean
    fn plan_restructure<const D: usize>(&self, tree: &PartitionTree<D>, costs: &[f64]) -> Option<PartitionChange<D>> {
        let mean = mean(costs);
        let hot = tree
            .leaves()
            .into_iter()
            .filter(|leaf| PartitionTree::<D>::splittable(&leaf.shape))
            .map(|leaf| (leaf.id, leaf_cost(leaf.process, costs)))
            .filter(|(_, cost)| *cost > self.config.split_factor * mean)
            .fold(None::<(u32, f64)>, |best, candidate| match best {
                Some(b) if b.1 >= candidate.1 => Some(b),
                _ => Some(candidate),
            })?;

        let cold = tree
            .sibling_groups()
            .into_iter()
            .filter(|group| !group.children.contains(&hot.0))
            .map(|group| {
                let cost: f64 = tree
                    .leaves_under(group.id)
                    .iter()
                    .map(|leaf| leaf_cost(leaf.process, costs))
                    .sum();
                (group.id, cost)
            })
            .filter(|(_, cost)| *cost < mean)
            .fold(None::<(u32, f64)>, |best, candidate| match best {
                Some(b) if b.1 <= candidate.1 => Some(b),
                _ => Some(candidate),
            })?;

        Some(PartitionChange::Restructure {
            merge: cold.0,
            split: hot.0,
        })
    }

    /// Move every origin on the current level to its cost-weighted centroid
    fn plan_origin_moves<const D: usize>(&mut self, tree: &PartitionTree<D>, costs: &[f64]) -> Option<PartitionChange<D>> {
        let depth = tree.depth();
        if depth == 0 {
            return None;
        }
        let level = self.level.filter(|l| *l < depth).unwrap_or(depth - 1);
        self.level = Some(if level == 0 { depth - 1 } else { level - 1 });

        let mut moves = Vec::new();
        for node in tree.internal_at_level(level) {
            let Some(current) = node.origin else { continue };
            let Some(origin) = weighted_origin(&node.shape, tree, node.id, costs) else {
                continue;
            };
            if origin != current {
                moves.push(PartitionChange::MoveOrigin { node: node.id, origin });
            }
        }
        debug!("Level {} origin pass proposes {} moves", level, moves.len());
        match moves.len() {
            0 => None,
            1 => moves.pop(),
            _ => Some(PartitionChange::Batch(moves)),
        }
    }
}

fn leaf_cost(process: Option<usize>, costs: &[f64]) -> f64 {
    process.and_then(|pid| costs.get(pid).copied()).unwrap_or(0.0)
}

fn mean(costs: &[f64]) -> f64 {
    if costs.is_empty() {
        0.0
    } else {
        costs.iter().sum::<f64>() / costs.len() as f64
    }
}

/// `max / mean`, 1 when there is no load at all
pub fn imbalance(costs: &[f64]) -> f64 {
    let mean = mean(costs);
    if mean <= 0.0 {
        return 1.0;
    }
    costs.iter().copied().fold(0.0, f64::max) / mean
}

/// Cost-weighted centroid of the leaf centers under `id`, kept strictly
/// inside `shape`
fn weighted_origin<const D: usize>(
    shape: &IntRect<D>,
    tree: &PartitionTree<D>,
    id: u32,
    costs: &[f64],
) -> Option<IntPoint<D>> {
    if !PartitionTree::<D>::splittable(shape) {
        return None;
    }
    let mut total = 0.0;
    let mut sum = [0.0f64; D];
    for leaf in tree.leaves_under(id) {
        let weight = leaf_cost(leaf.process, costs);
        let center = leaf.shape.real_center();
        for d in 0..D {
            sum[d] += weight * center.0[d];
        }
        total += weight;
    }
    if total <= 0.0 {
        return None;
    }
    let mut origin = [0i64; D];
    for d in 0..D {
        let target = (sum[d] / total).round() as i64;
        origin[d] = target.clamp(shape.lo.0[d] + 1, shape.hi.0[d] - 1);
    }
    Some(IntPoint(origin))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;

    fn world() -> IntRect<2> {
        IntRect::new(IntPoint([0, 0]), IntPoint([100, 100]))
    }

    fn config() -> BalanceConfig {
        BalanceConfig {
            interval: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_due_every_interval() {
        let mut balancer = LoadBalancer::new(config());
        assert!(!balancer.due());
        balancer.record(1.0);
        assert!(!balancer.due());
        balancer.record(1.0);
        assert!(balancer.due());

        let mut disabled = LoadBalancer::new(BalanceConfig {
            enabled: false,
            interval: 1,
            ..Default::default()
        });
        disabled.record(1.0);
        assert!(!disabled.due());
    }

    #[test]
    fn test_imbalance() {
        assert_eq!(imbalance(&[]), 1.0);
        assert_eq!(imbalance(&[0.0, 0.0]), 1.0);
        assert!((imbalance(&[3.0, 1.0]) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_origin_moves_toward_hot_leaf() {
        let partition = Partition::tree(world(), 4, 0, 5).unwrap();
        let mut balancer = LoadBalancer::new(config());

        let outcome = balancer.decide(&partition, &[10.0, 1.0, 1.0, 1.0]);
        match outcome {
            BalanceOutcome::Changed { change, .. } => {
                assert_eq!(
                    change,
                    PartitionChange::MoveOrigin {
                        node: PartitionTree::<2>::ROOT,
                        origin: IntPoint([33, 33]),
                    }
                );
            }
            other => panic!("expected a change, got {:?}", other),
        }
    }

    #[test]
    fn test_hysteresis_and_cooldown() {
        let partition = Partition::tree(world(), 4, 0, 5).unwrap();
        let mut balancer = LoadBalancer::new(config());
        let hot = [10.0, 1.0, 1.0, 1.0];

        balancer.record(4.0);
        assert!(matches!(balancer.decide(&partition, &hot), BalanceOutcome::Changed { .. }));
        assert_eq!(balancer.local_cost(), 0.0);
        // Cooldown evaluation
        assert!(matches!(balancer.decide(&partition, &hot), BalanceOutcome::Unchanged { .. }));
        // Still hot, so the policy stays disarmed
        assert!(matches!(balancer.decide(&partition, &hot), BalanceOutcome::Unchanged { .. }));
        // Balanced load re-arms
        assert!(matches!(
            balancer.decide(&partition, &[1.0; 4]),
            BalanceOutcome::Unchanged { .. }
        ));
        assert!(matches!(balancer.decide(&partition, &hot), BalanceOutcome::Changed { .. }));
        assert_eq!(balancer.changes(), 2);
    }

    #[test]
    fn test_restructure_hot_leaf() {
        let partition = Partition::tree(world(), 7, 0, 5).unwrap();
        let tree = partition.tree_layout().unwrap();
        let hot = tree.leaf_of_process(4).unwrap().id;
        let group = tree.leaf_of_process(0).unwrap().parent.unwrap();
        assert!(!tree.node(group).unwrap().children.contains(&hot));

        let mut costs = vec![1.0; 7];
        for pid in 0..4 {
            if tree.node(group).unwrap().children.contains(&tree.leaf_of_process(pid).unwrap().id) {
                costs[pid] = 0.1;
            }
        }
        costs[4] = 20.0;

        let mut balancer = LoadBalancer::new(config());
        match balancer.decide(&partition, &costs) {
            BalanceOutcome::Changed { change, .. } => {
                assert_eq!(change, PartitionChange::Restructure { merge: group, split: hot });
            }
            other => panic!("expected a restructure, got {:?}", other),
        }
    }

    #[test]
    fn test_uniform_is_skipped() {
        let partition = Partition::uniform(world(), 4, 0, 5).unwrap();
        let mut balancer = LoadBalancer::new(config());
        assert_eq!(balancer.decide(&partition, &[9.0, 1.0, 1.0, 1.0]), BalanceOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_all_processes_agree() {
        let comms = LocalCluster::new(4);
        let mut tasks = Vec::new();
        for comm in comms {
            tasks.push(tokio::spawn(async move {
                let pid = comm.rank();
                let partition = Partition::tree(world(), 4, pid, 5).unwrap();
                let mut balancer = LoadBalancer::new(config());
                balancer.record(if pid == 0 { 10.0 } else { 1.0 });
                balancer.balance(&partition, &comm).await.unwrap()
            }));
        }
        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }
        assert!(matches!(outcomes[0], BalanceOutcome::Changed { .. }));
        assert!(outcomes.iter().all(|o| *o == outcomes[0]));
    }
}
