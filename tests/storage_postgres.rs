//! PostgreSQL outbox store integration tests using testcontainers.
//!
//! Run with: cargo test --test storage_postgres --features postgres -- --nocapture
//!
//! These tests spin up PostgreSQL in a container, create the outbox table and
//! exercise transactional enqueue, skip-locked claims and status transitions.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use outpost::storage::{
    NewOutboxEvent, OutboxError, OutboxEvent, OutboxStatus, OutboxStore, PostgresOutboxStore,
};
use serde_json::json;
use uuid::Uuid;

const CREATE_ANIME_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS anime (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL
)
"#;

async fn setup() -> (
    testcontainers::ContainerAsync<testcontainers::GenericImage>,
    PostgresOutboxStore,
) {
    let (container, connection_string) = common::start_postgres().await;
    let pool = common::connect_postgres(&connection_string).await;

    let store = PostgresOutboxStore::new(pool);
    store.init().await.expect("Failed to create outbox table");
    sqlx::raw_sql(CREATE_ANIME_TABLE)
        .execute(store.pool())
        .await
        .expect("Failed to create anime table");

    (container, store)
}

/// Insert an anime row and its `create` event in one transaction.
async fn create_anime(
    store: &PostgresOutboxStore,
    name: &str,
    commit: bool,
) -> (Uuid, NewOutboxEvent) {
    let anime_id = Uuid::new_v4();
    let event = NewOutboxEvent::new("anime", "create", anime_id, &json!({ "name": name }))
        .expect("payload serializes");

    let mut tx = store.pool().begin().await.expect("begin");
    sqlx::query("INSERT INTO anime (id, name) VALUES ($1, $2)")
        .bind(anime_id)
        .bind(name)
        .execute(&mut *tx)
        .await
        .expect("insert anime");
    store.enqueue(&mut tx, &event).await.expect("enqueue");

    if commit {
        tx.commit().await.expect("commit");
    } else {
        tx.rollback().await.expect("rollback");
    }

    (anime_id, event)
}

async fn anime_exists(store: &PostgresOutboxStore, id: Uuid) -> bool {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM anime WHERE id = $1")
        .bind(id)
        .fetch_one(store.pool())
        .await
        .expect("count anime");
    count == 1
}

#[tokio::test]
async fn test_enqueue_is_atomic_with_domain_write() {
    println!("=== Transactional Enqueue Tests ===");
    let (_container, store) = setup().await;

    println!("--- commit: domain row and event both visible ---");
    let (anime_id, event) = create_anime(&store, "Frieren", true).await;
    assert!(anime_exists(&store, anime_id).await);
    let stored = store
        .get(event.id)
        .await
        .expect("get")
        .expect("committed event is visible");
    assert_eq!(stored.status, OutboxStatus::Incomplete);
    assert_eq!(stored.entity_id, anime_id);
    assert_eq!(stored.routing_key(), "anime.create");
    assert_eq!(stored.payload, json!({ "name": "Frieren" }));

    println!("--- rollback: neither domain row nor event visible ---");
    let (anime_id, event) = create_anime(&store, "Dungeon Meshi", false).await;
    assert!(!anime_exists(&store, anime_id).await);
    assert!(store.get(event.id).await.expect("get").is_none());

    println!("--- uncommitted event is not claimable ---");
    let first = store.claim_next().await.expect("claim");
    assert_eq!(first.map(|e| e.entity_id), Some(stored.entity_id));
    assert!(store.claim_next().await.expect("claim").is_none());

    println!("=== All transactional enqueue tests PASSED ===");
}

#[tokio::test]
async fn test_duplicate_event_id_rejected() {
    let (_container, store) = setup().await;
    let (_, event) = create_anime(&store, "Mushishi", true).await;

    let mut tx = store.pool().begin().await.expect("begin");
    let err = store.enqueue(&mut tx, &event).await.unwrap_err();
    assert!(matches!(err, OutboxError::Database(_)), "got {err:?}");
}

#[tokio::test]
async fn test_claim_and_transitions() {
    println!("=== Claim / Transition Tests ===");
    let (_container, store) = setup().await;

    let (_, older) = create_anime(&store, "Haikyu", true).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let (_, newer) = create_anime(&store, "Ping Pong", true).await;

    println!("--- oldest event is claimed first and marked pending ---");
    let claimed = store.claim_next().await.expect("claim").expect("event");
    assert_eq!(claimed.id, older.id);
    assert_eq!(claimed.status, OutboxStatus::Pending);
    assert!(claimed.updated_at >= claimed.created_at);
    assert!(claimed.claim_id.is_some());

    println!("--- pending -> completed ---");
    store.mark_completed(&claimed).await.expect("complete");
    let stored = store.get(older.id).await.expect("get").expect("event");
    assert_eq!(stored.status, OutboxStatus::Completed);
    assert_eq!(stored.claim_id, claimed.claim_id);

    println!("--- completed is terminal ---");
    let err = store.mark_completed(&claimed).await.unwrap_err();
    assert!(matches!(err, OutboxError::NotFound(id) if id == older.id));
    let err = store.mark_incomplete(&claimed).await.unwrap_err();
    assert!(matches!(err, OutboxError::NotFound(_)));

    println!("--- pending -> incomplete makes the event claimable again ---");
    let claimed = store.claim_next().await.expect("claim").expect("event");
    assert_eq!(claimed.id, newer.id);
    store.mark_incomplete(&claimed).await.expect("revert");
    let reverted = store.get(newer.id).await.expect("get").expect("event");
    assert_eq!(reverted.status, OutboxStatus::Incomplete);
    assert_eq!(reverted.claim_id, None);

    println!("--- incomplete cannot jump to completed ---");
    let err = store.mark_completed(&reverted).await.unwrap_err();
    assert!(matches!(err, OutboxError::NotFound(_)));
    let err = store.mark_completed(&claimed).await.unwrap_err();
    assert!(matches!(err, OutboxError::ClaimLost(id) if id == newer.id));

    let again = store.claim_next().await.expect("claim").expect("event");
    assert_eq!(again.id, newer.id);
    assert_ne!(again.claim_id, claimed.claim_id);

    println!("--- unknown id ---");
    let missing = OutboxEvent {
        id: Uuid::new_v4(),
        ..again.clone()
    };
    let err = store.mark_completed(&missing).await.unwrap_err();
    assert!(matches!(err, OutboxError::NotFound(id) if id == missing.id));

    println!("=== All claim / transition tests PASSED ===");
}

#[tokio::test]
async fn test_concurrent_claims_are_distinct() {
    let (_container, store) = setup().await;
    for i in 0..30 {
        create_anime(&store, &format!("anime-{i}"), true).await;
    }

    let store = Arc::new(store);
    let mut workers = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        workers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(event) = store.claim_next().await.expect("claim") {
                claimed.push(event.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await.expect("worker panicked"));
    }

    let distinct: HashSet<Uuid> = all.iter().copied().collect();
    assert_eq!(all.len(), 30, "every event claimed exactly once");
    assert_eq!(distinct.len(), 30);
}

#[tokio::test]
async fn test_reset_stale_pending() {
    let (_container, store) = setup().await;
    let (_, event) = create_anime(&store, "Monster", true).await;

    store.claim_next().await.expect("claim").expect("event");
    assert_eq!(
        store.reset_stale(Duration::from_secs(3600)).await.expect("reset"),
        0,
        "fresh claims are not stale"
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        store.reset_stale(Duration::from_millis(50)).await.expect("reset"),
        1
    );

    let stored = store.get(event.id).await.expect("get").expect("event");
    assert_eq!(stored.status, OutboxStatus::Incomplete);
    assert_eq!(stored.claim_id, None);
    let reclaimed = store.claim_next().await.expect("claim").expect("event");
    assert_eq!(reclaimed.id, event.id);
}

#[tokio::test]
async fn test_stale_holder_is_fenced_out() {
    let (_container, store) = setup().await;
    let (_, event) = create_anime(&store, "Kaiba", true).await;

    let stale = store.claim_next().await.expect("claim").expect("event");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        store.reset_stale(Duration::from_millis(50)).await.expect("reset"),
        1
    );

    println!("--- reset claim cannot be settled ---");
    let err = store.mark_completed(&stale).await.unwrap_err();
    assert!(matches!(err, OutboxError::ClaimLost(id) if id == event.id));

    println!("--- nor can it touch the next holder's claim ---");
    let current = store.claim_next().await.expect("claim").expect("event");
    assert_ne!(current.claim_id, stale.claim_id);
    let err = store.mark_incomplete(&stale).await.unwrap_err();
    assert!(matches!(err, OutboxError::ClaimLost(_)));
    let err = store.mark_completed(&stale).await.unwrap_err();
    assert!(matches!(err, OutboxError::ClaimLost(_)));
    let stored = store.get(event.id).await.expect("get").expect("event");
    assert_eq!(stored.status, OutboxStatus::Pending);

    store.mark_completed(&current).await.expect("complete");
    let stored = store.get(event.id).await.expect("get").expect("event");
    assert_eq!(stored.status, OutboxStatus::Completed);
    assert_eq!(stored.claim_id, current.claim_id);
}

#[tokio::test]
async fn test_schema_init_idempotent_and_status_checked() {
    let (_container, store) = setup().await;
    store.init().await.expect("second init is a no-op");

    let (_, event) = create_anime(&store, "Mononoke", true).await;
    let result = sqlx::query("UPDATE outbox SET status = 'failed' WHERE id = $1")
        .bind(event.id)
        .execute(store.pool())
        .await;
    assert!(result.is_err(), "status outside the state machine is rejected");
}
