// packages/engine/src/main.rs
//! Distributed Spatial Simulation Engine
//!
//! Runs one process of a random-walk demo: agents wander a 2-D continuous
//! field, a density grid counts them per cell, and the load balancer
//! reshapes the partition tree as crowds drift. Start `process_count`
//! copies with distinct `DSPACE__CLUSTER__PROCESS_ID` values; rank 0 also
//! hosts the coordinator.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dspace_engine::comm::tcp::{PeerInfo, TcpMesh};
use dspace_engine::comm::{Communicator, FrameCompressor};
use dspace_engine::field::{ContinuousStorage, FieldElement, GridStorage, HaloField};
use dspace_engine::observability::{init_metrics, init_tracing};
use dspace_engine::partition::{Partition, RealPoint};
use dspace_engine::registry::{CoordinatorClient, CoordinatorServer, ExportTable, ObjectServer, RegistryHandle, RemoteObject};
use dspace_engine::runtime::{DistributedEngine, ExportFactory};
use dspace_engine::transport::{Payload, ScheduleMeta};
use dspace_engine::utils::config::EngineConfig;
use dspace_engine::utils::errors::abort_on_fatal;
use dspace_engine::utils::ids::{EntityId, FieldId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

const DIMENSIONS: usize = 2;

/// Everything that can migrate in the demo
#[derive(Debug, Clone, Serialize, Deserialize)]
enum DemoPayload {
    Walker { id: EntityId, moves: u64 },
    Density(u32),
}

impl Payload for DemoPayload {
    fn entity_id(&self) -> Option<EntityId> {
        match self {
            DemoPayload::Walker { id, .. } => Some(*id),
            DemoPayload::Density(_) => None,
        }
    }
}

/// Agents per grid cell
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Density(u32);

impl FieldElement<DemoPayload> for Density {
    fn into_payload(self) -> DemoPayload {
        DemoPayload::Density(self.0)
    }

    fn from_payload(payload: DemoPayload) -> std::result::Result<Self, DemoPayload> {
        match payload {
            DemoPayload::Density(count) => Ok(Density(count)),
            other => Err(other),
        }
    }
}

type WalkerField = HaloField<ContinuousStorage<DemoPayload, DIMENSIONS>, DIMENSIONS>;
type DensityField = HaloField<GridStorage<Density, DIMENSIONS>, DIMENSIONS>;

/// Published face of a walker
struct WalkerObject {
    id: EntityId,
}

#[async_trait]
impl RemoteObject for WalkerObject {
    async fn invoke(&self, method: &str, _args: Bytes) -> dspace_engine::Result<Bytes> {
        match method {
            "whoami" => Ok(Bytes::from(self.id.to_string())),
            other => Err(dspace_engine::EngineError::Registry(format!("walker has no method {}", other))),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("loading configuration")?;
    init_tracing(config.observability.log_format)?;
    init_metrics(config.observability.metrics_address.as_deref())?;

    info!("Starting Distributed Spatial Simulation Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {:?}", config);

    let pid = config.cluster.process_id;
    let count = config.cluster.process_count;
    let timeout = Duration::from_secs(config.cluster.connect_timeout_secs);

    let coordinator = if pid == 0 {
        let server = CoordinatorServer::bind(&config.cluster.coordinator_address, count)
            .await
            .context("starting coordinator")?;
        Some(server.spawn())
    } else {
        None
    };

    // Listeners first, so the announced addresses are live
    let mesh_listener = TcpListener::bind(format!("{}:0", config.cluster.bind_host)).await?;
    let exports = Arc::new(ExportTable::new());
    let object_server = ObjectServer::bind(&format!("{}:0", config.cluster.bind_host), exports.clone()).await?;
    let me = PeerInfo {
        pid,
        mesh_address: mesh_listener.local_addr()?.to_string(),
        object_address: object_server.local_addr()?.to_string(),
    };
    let object_task = object_server.spawn();

    let client = CoordinatorClient::connect(&config.cluster.coordinator_address, timeout)
        .await
        .context("connecting to coordinator")?;
    let peers = client.announce(me.clone()).await?;
    info!("Process {} of {} sees peers {:?}", pid, count, peers);

    let compressor = FrameCompressor::new(config.transport.compression, config.transport.compression_threshold);
    let mesh = TcpMesh::connect(pid, mesh_listener, &peers, compressor, timeout).await?;
    let registry = RegistryHandle::new(pid, me.object_address.clone(), Arc::new(client), exports);

    let partition = Partition::<DIMENSIONS>::from_config(&config.partition, &config.cluster)
        .context("building partition")?;
    let exporter: ExportFactory<DemoPayload> = Arc::new(|id: EntityId, _payload: &DemoPayload| Arc::new(WalkerObject { id }) as Arc<dyn RemoteObject>);
    let mut engine = DistributedEngine::new(Arc::new(mesh), partition, registry, config.balance.clone())?
        .with_exporter(exporter);

    let walkers = Arc::new(Mutex::new(WalkerField::continuous(engine.partition(), config.demo.discretization)?));
    let density = Arc::new(Mutex::new(DensityField::grid(engine.partition())?));
    let walker_field = engine.register_field(walkers.clone());
    engine.register_field(density.clone());

    let mut rng = StdRng::seed_from_u64(config.demo.seed.wrapping_add(pid as u64));
    seed_walkers(&mut engine, walker_field, &mut rng, &config, pid, count).await?;
    abort_on_fatal(engine.sync_step().await)?;

    for step in 1..=config.demo.steps {
        let started = Instant::now();
        let world = engine.partition().world();
        for id in engine.schedule_mut().step() {
            let Some(position) = walkers.lock().await.storage().position(id) else {
                warn!("Scheduled walker {} is not in the field", id);
                continue;
            };
            let mut delta = [0.0; DIMENSIONS];
            for d in delta.iter_mut() {
                *d = rng.gen_range(-config.demo.jump..=config.demo.jump);
            }
            let mut target = position.translate(&delta);
            for d in 0..DIMENSIONS {
                target.0[d] = target.0[d].clamp(world.lo.0[d] as f64, world.hi.0[d] as f64 - 1e-6);
            }
            if let Some(DemoPayload::Walker { moves, .. }) = walkers.lock().await.storage_mut().get_mut(id) {
                *moves += 1;
            }
            engine.migrate(walker_field, id, target).await?;
        }
        count_density(&walkers, &density).await;
        engine.record_cost(started.elapsed().as_secs_f64());

        let report = abort_on_fatal(engine.sync_step().await)?;
        if step % 50 == 0 || report.balance.is_some() {
            info!(
                "Step {}: {} local walkers, {} arrived, {} forwarded, balance {:?}",
                step,
                walkers.lock().await.storage().core_ids().len(),
                report.integrated,
                report.forwarded,
                report.balance
            );
        }
    }

    if count > 1 && pid == 0 {
        match engine.registry().resolve("scout-1").await {
            Ok(mut scout) => match scout.invoke("whoami", Bytes::new()).await {
                Ok(reply) => info!("scout-1 answers {} from process {}", String::from_utf8_lossy(&reply), scout.owner()),
                Err(e) => warn!("scout-1 did not answer: {}", e),
            },
            Err(e) => warn!("scout-1 not found: {}", e),
        }
    }
    abort_on_fatal(engine.comm().barrier().await)?;

    let stats = engine.transporter().lock().await.stats();
    info!(
        "Process {} finished at epoch {}: {:?}",
        pid,
        engine.partition().epoch(),
        stats
    );
    object_task.abort();
    if let Some(coordinator) = coordinator {
        coordinator.abort();
    }
    Ok(())
}

async fn seed_walkers(
    engine: &mut DistributedEngine<DemoPayload, DIMENSIONS>,
    field: FieldId,
    rng: &mut StdRng,
    config: &EngineConfig,
    pid: usize,
    count: usize,
) -> Result<()> {
    let bounds = engine.partition().bounds();
    let share = config.demo.agents / count + usize::from(pid < config.demo.agents % count);
    for n in 0..share {
        let id = engine.next_id();
        let mut position = [0.0; DIMENSIONS];
        for (d, coordinate) in position.iter_mut().enumerate() {
            *coordinate = rng.gen_range(bounds.lo.0[d] as f64..bounds.hi.0[d] as f64);
        }
        let schedule = ScheduleMeta::Repeating {
            ordering: 0,
            time: None,
            interval: 1.0,
        };
        engine
            .add_entity(Some(field), DemoPayload::Walker { id, moves: 0 }, Some(RealPoint(position)), schedule)
            .await?;
        if n == 0 {
            let name = format!("scout-{}", pid);
            engine.registry().publish(&name, id, Arc::new(WalkerObject { id })).await?;
        }
    }
    info!("Process {} seeded {} walkers in {}", pid, share, bounds);
    Ok(())
}

async fn count_density(walkers: &Mutex<WalkerField>, density: &Mutex<DensityField>) {
    let walkers = walkers.lock().await;
    let mut density = density.lock().await;
    density.storage_mut().fill_core(Density(0));
    for id in walkers.storage().core_ids() {
        if let Some(position) = walkers.storage().position(id) {
            if let Ok(cell) = density.storage_mut().get_mut(&position.floor()) {
                cell.0 += 1;
            }
        }
    }
}
