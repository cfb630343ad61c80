// packages/engine/tests/common/mod.rs
//! Shared fixtures: an in-process cluster of engines with one continuous
//! agent field and one grid field each.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use dspace_engine::comm::LocalCluster;
use dspace_engine::field::{ContinuousStorage, FieldElement, GridStorage, HaloField};
use dspace_engine::partition::{IntPoint, IntRect, Partition};
use dspace_engine::registry::{InMemoryDirectory, RemoteObject};
use dspace_engine::runtime::{DistributedEngine, ExportFactory};
use dspace_engine::transport::{Payload, ScheduleMeta};
use dspace_engine::utils::config::BalanceConfig;
use dspace_engine::utils::ids::{EntityId, FieldId, ProcessId};
use dspace_engine::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Thing {
    Agent { id: EntityId, label: String },
    Cell(i64),
}

impl Thing {
    pub fn agent(id: EntityId) -> Self {
        Thing::Agent {
            id,
            label: format!("agent-{}", id.0),
        }
    }
}

impl Payload for Thing {
    fn entity_id(&self) -> Option<EntityId> {
        match self {
            Thing::Agent { id, .. } => Some(*id),
            Thing::Cell(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cell(pub i64);

impl FieldElement<Thing> for Cell {
    fn into_payload(self) -> Thing {
        Thing::Cell(self.0)
    }

    fn from_payload(payload: Thing) -> std::result::Result<Self, Thing> {
        match payload {
            Thing::Cell(value) => Ok(Cell(value)),
            other => Err(other),
        }
    }
}

pub type Agents<const D: usize> = HaloField<ContinuousStorage<Thing, D>, D>;
pub type Cells<const D: usize> = HaloField<GridStorage<Cell, D>, D>;

/// Reports which process serves it
pub struct Probe {
    host: ProcessId,
}

#[async_trait]
impl RemoteObject for Probe {
    async fn invoke(&self, method: &str, _args: Bytes) -> Result<Bytes> {
        match method {
            "host" => Ok(Bytes::from(self.host.to_string())),
            other => Err(EngineError::Registry(format!("probe has no method {}", other))),
        }
    }
}

pub fn probe(host: ProcessId) -> Arc<dyn RemoteObject> {
    Arc::new(Probe { host })
}

pub fn probe_factory(host: ProcessId) -> ExportFactory<Thing> {
    Arc::new(move |_id: EntityId, _payload: &Thing| probe(host))
}

pub struct Node<const D: usize> {
    pub engine: DistributedEngine<Thing, D>,
    pub agents: Arc<Mutex<Agents<D>>>,
    pub agent_field: FieldId,
    pub cells: Arc<Mutex<Cells<D>>>,
    pub cell_field: FieldId,
}

impl<const D: usize> Node<D> {
    pub fn pid(&self) -> ProcessId {
        self.engine.pid()
    }

    /// Ids in the agent field's core
    pub async fn agent_ids(&self) -> Vec<EntityId> {
        self.agents.lock().await.storage().core_ids()
    }
}

pub fn repeating() -> ScheduleMeta {
    ScheduleMeta::Repeating {
        ordering: 0,
        time: None,
        interval: 1.0,
    }
}

pub fn no_balancing() -> BalanceConfig {
    BalanceConfig {
        enabled: false,
        ..Default::default()
    }
}

pub fn line(count: usize, length: i64, aoi: i64) -> Vec<Partition<1>> {
    let world = IntRect::new(IntPoint([0]), IntPoint([length]));
    (0..count)
        .map(|pid| Partition::uniform(world, count, pid, aoi).unwrap())
        .collect()
}

pub fn square_tree(count: usize, side: i64, aoi: i64) -> Vec<Partition<2>> {
    let world = IntRect::new(IntPoint([0, 0]), IntPoint([side, side]));
    (0..count)
        .map(|pid| Partition::tree(world, count, pid, aoi).unwrap())
        .collect()
}

/// One engine per partition, all sharing an in-memory directory
pub fn cluster<const D: usize>(partitions: Vec<Partition<D>>, balance: BalanceConfig) -> Vec<Node<D>> {
    let comms = LocalCluster::new(partitions.len());
    let directory = InMemoryDirectory::new();
    comms
        .into_iter()
        .zip(partitions)
        .map(|(comm, partition)| {
            let pid = partition.pid();
            let registry = directory.handle(pid);
            let mut engine = DistributedEngine::new(Arc::new(comm), partition, registry, balance.clone())
                .unwrap()
                .with_exporter(probe_factory(pid));
            let agents = Arc::new(Mutex::new(Agents::continuous(engine.partition(), 2.0).unwrap()));
            let cells = Arc::new(Mutex::new(Cells::grid(engine.partition()).unwrap()));
            let agent_field = engine.register_field(agents.clone());
            let cell_field = engine.register_field(cells.clone());
            Node {
                engine,
                agents,
                agent_field,
                cells,
                cell_field,
            }
        })
        .collect()
}

/// Run `f` on every node concurrently, results in rank order
pub async fn run_all<const D: usize, F, Fut, T>(nodes: Vec<Node<D>>, f: F) -> Vec<(Node<D>, T)>
where
    F: Fn(Node<D>) -> Fut,
    Fut: Future<Output = (Node<D>, T)> + Send + 'static,
    T: Send + 'static,
{
    let tasks: Vec<_> = nodes.into_iter().map(|node| tokio::spawn(f(node))).collect();
    let mut out = Vec::with_capacity(tasks.len());
    for task in tasks {
        out.push(task.await.unwrap());
    }
    out
}

/// Every agent id across the cluster, sorted
pub async fn all_agents<const D: usize>(nodes: &[Node<D>]) -> Vec<EntityId> {
    let mut ids = Vec::new();
    for node in nodes {
        ids.extend(node.agent_ids().await);
    }
    ids.sort();
    ids
}
