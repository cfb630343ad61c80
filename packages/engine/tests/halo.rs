// packages/engine/tests/halo.rs
//! Halo synchronization on a 2-D tree layout, corners included

mod common;

use common::{cluster, no_balancing, repeating, run_all, square_tree, Cell, Node, Thing};
use dspace_engine::partition::{IntPoint, RealPoint};
use dspace_engine::utils::ids::EntityId;

/// Value every process writes into its core of the 100x100 world
fn owner_value(p: &IntPoint<2>) -> Cell {
    Cell(100 + (p.0[0] >= 50) as i64 + 2 * (p.0[1] >= 50) as i64)
}

/// Halo points whose value does not match the owning process
async fn stale_halo_cells(node: &Node<2>) -> Vec<IntPoint<2>> {
    let cells = node.cells.lock().await;
    let core = cells.core();
    cells
        .halo()
        .points()
        .filter(|p| !core.contains(p))
        .filter(|p| cells.storage().get(p).ok() != Some(&owner_value(p)))
        .collect()
}

#[tokio::test]
async fn test_corners_and_ghosts_follow_owners() {
    let nodes = cluster(square_tree(4, 100, 5), no_balancing());
    let id = EntityId(500);

    let results = run_all(nodes, move |mut node| async move {
        let value = Cell(100 + node.pid() as i64);
        node.cells.lock().await.storage_mut().fill_core(value);

        if node.pid() == 0 {
            // Inside every other process's halo
            node.engine
                .add_entity(Some(node.agent_field), Thing::agent(id), Some(RealPoint([48.5, 48.5])), repeating())
                .await
                .unwrap();
        }
        node.engine.sync_step().await.unwrap();
        let stale = stale_halo_cells(&node).await;
        let first = node.agents.lock().await.storage().position(id);

        if node.pid() == 0 {
            // Still owned by 0, now only near process 1
            node.engine.migrate(node.agent_field, id, RealPoint([47.5, 20.5])).await.unwrap();
        }
        node.engine.sync_step().await.unwrap();
        let second = node.agents.lock().await.storage().position(id);
        let ghosts = node.agents.lock().await.storage().len();

        (node, (stale, first, second, ghosts))
    })
    .await;

    for (node, (stale, first, _, _)) in &results {
        assert!(stale.is_empty(), "process {} has stale halo cells {:?}", node.pid(), stale);
        assert_eq!(*first, Some(RealPoint([48.5, 48.5])), "process {}", node.pid());
    }

    // Diagonal neighbors see each other's corner
    let corner = results[0].0.cells.lock().await;
    assert_eq!(corner.storage().get(&IntPoint([52, 52])).unwrap(), &Cell(103));
    assert_eq!(corner.storage().get(&IntPoint([54, 45])).unwrap(), &Cell(101));
    drop(corner);
    let corner = results[3].0.cells.lock().await;
    assert_eq!(corner.storage().get(&IntPoint([45, 45])).unwrap(), &Cell(100));
    assert_eq!(corner.storage().get(&IntPoint([49, 54])).unwrap(), &Cell(102));
    drop(corner);

    // The old ghost is replaced where the entity is still in range and
    // dropped where it is not
    let moved = RealPoint([47.5, 20.5]);
    assert_eq!(results[0].1 .2, Some(moved));
    assert_eq!(results[1].1 .2, Some(moved));
    assert_eq!(results[1].1 .3, 1);
    assert_eq!(results[2].1 .2, None);
    assert_eq!(results[3].1 .2, None);
    assert_eq!(results[3].1 .3, 0);

    assert_eq!(results[0].0.agent_ids().await, vec![id]);
    assert!(results[1].0.agent_ids().await.is_empty());
}
