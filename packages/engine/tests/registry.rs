// packages/engine/tests/registry.rs
//! Published names follow their entities across migration

mod common;

use bytes::Bytes;
use common::{cluster, line, no_balancing, probe, repeating, run_all, Thing};
use dspace_engine::partition::RealPoint;
use dspace_engine::utils::ids::EntityId;
use dspace_engine::EngineError;

#[tokio::test]
async fn test_name_survives_migration() {
    let nodes = cluster(line(2, 100, 5), no_balancing());
    let scout = EntityId(42);

    let results = run_all(nodes, move |mut node| async move {
        let registry = node.engine.registry().clone();
        if node.pid() == 0 {
            node.engine
                .add_entity(Some(node.agent_field), Thing::agent(scout), Some(RealPoint([45.0])), repeating())
                .await
                .unwrap();
            assert!(registry.publish("scout", scout, probe(0)).await.unwrap());
            assert!(!registry.publish("scout", EntityId(43), probe(0)).await.unwrap());
        }
        node.engine.sync_step().await.unwrap();

        // Both sides see the first host
        let mut before = registry.resolve("scout").await.unwrap();
        assert_eq!(before.owner(), 0);
        assert_eq!(&before.invoke("host", Bytes::new()).await.unwrap()[..], b"0");
        node.engine.sync_step().await.unwrap();

        if node.pid() == 0 {
            node.engine.migrate(node.agent_field, scout, RealPoint([55.0])).await.unwrap();
        }
        node.engine.sync_step().await.unwrap();

        // A stale reference re-resolves to the new host
        assert_eq!(&before.invoke("host", Bytes::new()).await.unwrap()[..], b"1");
        assert_eq!(before.owner(), 1);
        assert_eq!(registry.resolve("scout").await.unwrap().owner(), 1);
        (node, ())
    })
    .await;

    let (old_host, _) = &results[0];
    let (new_host, _) = &results[1];
    assert_eq!(old_host.engine.registry().publication_of(scout), None);
    assert_eq!(new_host.engine.registry().publication_of(scout), Some("scout".to_string()));
    assert_eq!(new_host.agent_ids().await, vec![scout]);
}

#[tokio::test]
async fn test_unpublish_and_unknown_names() {
    let nodes = cluster(line(2, 100, 5), no_balancing());
    let a = nodes[0].engine.registry().clone();
    let b = nodes[1].engine.registry().clone();

    assert!(matches!(b.resolve("nobody").await, Err(EngineError::NotBound(_))));
    assert!(a.publish("x", EntityId(1), probe(0)).await.unwrap());
    // Only the host can unpublish
    assert!(!b.unpublish("x").await.unwrap());
    assert!(a.unpublish("x").await.unwrap());
    assert!(matches!(b.resolve("x").await, Err(EngineError::NotBound(_))));
    assert!(b.publish("x", EntityId(2), probe(1)).await.unwrap());
    assert_eq!(a.resolve("x").await.unwrap().owner(), 1);
}
