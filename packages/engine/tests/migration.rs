// packages/engine/tests/migration.rs
//! Entity migration and halo synchronization across in-process clusters

mod common;

use common::{cluster, line, no_balancing, repeating, run_all, Cell, Thing};
use dspace_engine::partition::{IntPoint, IntRect, Partition, RealPoint};
use dspace_engine::utils::ids::EntityId;
use dspace_engine::EngineError;

#[tokio::test]
async fn test_entity_crosses_boundary_and_halo_follows() {
    let nodes = cluster(line(2, 100, 5), no_balancing());
    let id = EntityId(77);

    let results = run_all(nodes, move |mut node| async move {
        let pid = node.pid() as i64;
        {
            let mut cells = node.cells.lock().await;
            for p in cells.core().points() {
                cells.storage_mut().set(&p, Cell(p.0[0] * 10 + pid)).unwrap();
            }
        }

        if pid == 0 {
            node.engine
                .add_entity(Some(node.agent_field), Thing::agent(id), Some(RealPoint([49.0])), repeating())
                .await
                .unwrap();
            node.engine.migrate(node.agent_field, id, RealPoint([52.0])).await.unwrap();

            // Gone from the sender before any exchange
            assert!(!node.agents.lock().await.storage().contains(id));
            assert!(!node.engine.schedule().contains(id));
            assert_eq!(node.engine.transporter().lock().await.pending(), 1);
        }

        let report = node.engine.sync_step().await.unwrap();
        (node, report)
    })
    .await;

    let (sender, sent) = &results[0];
    let (receiver, received) = &results[1];
    assert_eq!(sent.integrated, 0);
    assert_eq!(received.integrated, 1);

    let agents = receiver.agents.lock().await;
    assert_eq!(agents.storage().position(id), Some(RealPoint([52.0])));
    assert!(receiver.engine.schedule().contains(id));
    assert!(sender.agent_ids().await.is_empty());

    // Each side's halo mirrors the other's boundary cells
    let cells = sender.cells.lock().await;
    for x in 50..55 {
        assert_eq!(cells.storage().get(&IntPoint([x])).unwrap(), &Cell(x * 10 + 1));
    }
    let cells = receiver.cells.lock().await;
    for x in 45..50 {
        assert_eq!(cells.storage().get(&IntPoint([x])).unwrap(), &Cell(x * 10));
    }
}

#[tokio::test]
async fn test_migration_is_exactly_once_across_hops() {
    // [0,30) [30,60) [60,90): process 0 and 2 are not neighbors
    let nodes = cluster(line(3, 90, 5), no_balancing());
    let near = EntityId(1);
    let far = EntityId(2);

    let results = run_all(nodes, move |mut node| async move {
        let mut reports = Vec::new();
        if node.pid() == 0 {
            for (id, x) in [(near, 10.0), (far, 20.0)] {
                node.engine
                    .add_entity(Some(node.agent_field), Thing::agent(id), Some(RealPoint([x])), repeating())
                    .await
                    .unwrap();
            }
            node.engine.migrate(node.agent_field, near, RealPoint([40.0])).await.unwrap();
            node.engine.migrate(node.agent_field, far, RealPoint([75.0])).await.unwrap();
        }
        for _ in 0..3 {
            reports.push(node.engine.sync_step().await.unwrap());
        }
        (node, reports)
    })
    .await;

    // Step 1: both land on process 1, which forwards the far one
    assert_eq!(results[1].1[0].integrated, 1);
    assert_eq!(results[1].1[0].forwarded, 1);
    assert_eq!(results[2].1[0].integrated, 0);
    // Step 2: the far one arrives
    assert_eq!(results[2].1[1].integrated, 1);
    assert!(results.iter().all(|(_, reports)| reports[2].integrated == 0));

    let nodes: Vec<_> = results.into_iter().map(|(node, _)| node).collect();
    assert!(nodes[0].agent_ids().await.is_empty());
    assert_eq!(nodes[1].agent_ids().await, vec![near]);
    assert_eq!(nodes[2].agent_ids().await, vec![far]);
    assert_eq!(common::all_agents(&nodes).await, vec![near, far]);
}

#[tokio::test]
async fn test_local_move_and_bad_targets() {
    let mut nodes = cluster(line(2, 100, 5), no_balancing());
    let node = &mut nodes[0];
    let id = EntityId(5);
    node.engine
        .add_entity(Some(node.agent_field), Thing::agent(id), Some(RealPoint([10.0])), repeating())
        .await
        .unwrap();

    // Staying inside the partition is a relocation, not a migration
    node.engine.migrate(node.agent_field, id, RealPoint([20.5])).await.unwrap();
    assert_eq!(node.agents.lock().await.storage().position(id), Some(RealPoint([20.5])));
    assert_eq!(node.engine.transporter().lock().await.pending(), 0);

    let outside = node.engine.migrate(node.agent_field, id, RealPoint([150.0])).await;
    assert!(matches!(outside, Err(EngineError::OutOfDomain(_))));
    // A refused migration leaves the entity stored and scheduled
    assert_eq!(node.agents.lock().await.storage().position(id), Some(RealPoint([20.5])));
    assert!(node.engine.schedule().contains(id));
    assert_eq!(node.engine.transporter().lock().await.pending(), 0);

    let unknown = node.engine.migrate(node.agent_field, EntityId(99), RealPoint([60.0])).await;
    assert!(matches!(unknown, Err(EngineError::NotLocal(_))));

    let foreign = node
        .engine
        .add_entity(Some(node.agent_field), Thing::agent(EntityId(6)), Some(RealPoint([70.0])), repeating())
        .await;
    assert!(matches!(foreign, Err(EngineError::NotLocal(_))));
}

#[tokio::test]
async fn test_adjacent_partitions_need_a_margin() {
    let world = IntRect::new(IntPoint([0]), IntPoint([100]));
    assert!(matches!(Partition::uniform(world, 2, 0, 0), Err(EngineError::Config(_))));

    // With the thinnest margin the boundary crossing still goes through
    let nodes = cluster(line(2, 100, 1), no_balancing());
    let id = EntityId(3);
    let results = run_all(nodes, move |mut node| async move {
        if node.pid() == 0 {
            node.engine
                .add_entity(Some(node.agent_field), Thing::agent(id), Some(RealPoint([49.0])), repeating())
                .await
                .unwrap();
            node.engine.migrate(node.agent_field, id, RealPoint([52.0])).await.unwrap();
        }
        node.engine.sync_step().await.unwrap();
        (node, ())
    })
    .await;

    assert!(results[0].0.agent_ids().await.is_empty());
    assert_eq!(results[1].0.agent_ids().await, vec![id]);
    assert!(results[1].0.engine.schedule().contains(id));
}
