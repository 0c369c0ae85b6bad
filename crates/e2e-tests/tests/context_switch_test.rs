//! User context lifecycle E2E tests.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use e2e_tests::{query_embedder, query_vector, seed_memory, TestHarness};
use papr_client::SearchOptions;
use papr_sync::MockMemoryApi;
use papr_types::{Memory, Tier};

/// After switching user with clear_cache, the prior user's memory is gone.
#[tokio::test]
async fn test_context_switch_wipes_cache() {
    let harness = TestHarness::new();
    let client = harness.client("u1", Some(query_embedder("milk"))).await;

    let store = client.store().await.unwrap();
    seed_memory(&store, Tier::Tier0, &Memory::new("m1", "buy milk"), &query_vector(), 0);
    let before = client.search("milk", SearchOptions::default()).await.unwrap();
    assert_eq!(before.ids(), vec!["m1"]);

    let ctx = client
        .set_user_context(Some("u2".into()), None, None, false, true)
        .await
        .unwrap();
    assert_eq!(ctx.version, 1);
    assert_eq!(ctx.user_id.as_deref(), Some("u2"));

    let after = client.search("milk", SearchOptions::default()).await.unwrap();
    assert!(!after.ids().contains(&"m1"));
    assert!(store.is_empty());
}

/// Resync after a switch pulls the new user's tiers.
#[tokio::test]
async fn test_switch_with_resync_loads_new_user() {
    let harness = TestHarness::new();
    let api = Arc::new(MockMemoryApi::new().with_tiers(
        vec![],
        vec![Memory::new("a1", "u1 memory").with_embedding(query_vector())],
    ));
    let client = harness
        .client_with_remote("u1", Some(query_embedder("milk")), api.clone())
        .await;
    assert_eq!(
        client.search("milk", SearchOptions::default()).await.unwrap().ids(),
        vec!["a1"]
    );

    api.set_tiers(
        vec![],
        vec![Memory::new("b1", "u2 memory").with_embedding(query_vector())],
    );
    client
        .set_user_context(Some("u2".into()), None, None, false, true)
        .await
        .unwrap();
    let report = client.sync_now().await.unwrap();
    assert_eq!(report.tier1.inserted, 1);

    let response = client.search("milk", SearchOptions::default()).await.unwrap();
    assert_eq!(response.ids(), vec!["b1"]);
    assert_eq!(api.search_calls(), 0);
}

/// Clearing the context routes to the remote service and drops the cache.
#[tokio::test]
async fn test_clear_user_context() {
    let harness = TestHarness::new();
    let api = Arc::new(
        MockMemoryApi::new().with_search_results(vec![Memory::new("r1", "anonymous answer")]),
    );
    let client = harness
        .client_with_remote("u1", Some(query_embedder("milk")), api.clone())
        .await;
    let store = client.store().await.unwrap();
    seed_memory(&store, Tier::Tier1, &Memory::new("m1", "buy milk"), &query_vector(), 0);

    let ctx = client.clear_user_context(true).await.unwrap();
    assert!(!ctx.is_set());
    assert!(store.is_empty());

    let response = client.search("milk", SearchOptions::default()).await.unwrap();
    assert_eq!(response.ids(), vec!["r1"]);
    assert_eq!(api.search_calls(), 1);
}
