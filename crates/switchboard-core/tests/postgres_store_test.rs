//! Store-contract tests against a real Postgres, plus one full wake/dispatch
//! round trip over LISTEN/NOTIFY. Every test skips (loudly) when no database
//! is configured; set `SWITCHBOARD_DATABASE_URL` or `DATABASE_URL` to run.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use switchboard_core::{InvocationState, InvocationStore, NewInvocation, PgInvocationStore};
use switchboard_notify::{ChannelListener, PgChannelListener};

fn database_url() -> Option<String> {
    std::env::var("SWITCHBOARD_DATABASE_URL")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()))
}

async fn test_store() -> Option<(PgPool, PgInvocationStore)> {
    let url = database_url()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect to test database");
    let store = PgInvocationStore::new(pool.clone()).await.expect("build store");
    store.init_schema().await.expect("init schema");
    Some((pool, store))
}

/// Per-test queue id so runs never observe each other's rows.
fn unique_queue() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    (nanos as i64 & i64::MAX).max(1)
}

macro_rules! require_db {
    () => {
        match test_store().await {
            Some(pair) => pair,
            None => {
                eprintln!("skipping: SWITCHBOARD_DATABASE_URL / DATABASE_URL not set");
                return;
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Insert and fetch
// ---------------------------------------------------------------------------

#[tokio::test]
#[serial]
async fn insert_assigns_id_and_round_trips_documents() {
    let (_pool, store) = require_db!();
    let queue = unique_queue();

    let inserted = store
        .insert(
            NewInvocation::new(
                queue,
                "actor-1",
                json!({"trace": "t-1", "attempt": 1}),
                json!({"k": 1, "nested": {"v": [1, 2]}}),
            )
            .with_priority(3),
        )
        .await
        .expect("insert");

    assert!(inserted.id > 0);
    assert_eq!(inserted.queue_id, queue);
    assert_eq!(inserted.state, InvocationState::Available);
    assert_eq!(inserted.priority, 3);
    assert!(inserted.created_at > 0);
    assert!(inserted.attempted_by.is_empty());

    let fetched = store
        .get(inserted.id)
        .await
        .expect("get")
        .expect("row exists");
    assert_eq!(fetched.payload, json!({"k": 1, "nested": {"v": [1, 2]}}));
    assert_eq!(fetched.metadata, json!({"trace": "t-1", "attempt": 1}));
    assert_eq!(fetched.created_by, "actor-1");
    assert!(fetched.result.is_none());
}

// ---------------------------------------------------------------------------
// Claim semantics
// ---------------------------------------------------------------------------

#[tokio::test]
#[serial]
async fn claim_orders_by_priority_then_id_and_claims_once() {
    let (_pool, store) = require_db!();
    let queue = unique_queue();

    let relaxed = store
        .insert(NewInvocation::new(queue, "a", json!({"m": 1}), json!({})).with_priority(9))
        .await
        .expect("insert relaxed");
    let urgent = store
        .insert(NewInvocation::new(queue, "a", json!({"m": 2}), json!({})).with_priority(1))
        .await
        .expect("insert urgent");

    let first = store
        .claim_next(queue, "worker-1")
        .await
        .expect("claim")
        .expect("urgent row claimable");
    assert_eq!(first.id, urgent.id);
    assert_eq!(first.state, InvocationState::Running);
    assert_eq!(first.claimant(), Some("worker-1"));
    assert!(first.attempted_at.is_some());

    let second = store
        .claim_next(queue, "worker-2")
        .await
        .expect("claim")
        .expect("relaxed row claimable");
    assert_eq!(second.id, relaxed.id);

    assert!(
        store.claim_next(queue, "worker-3").await.expect("claim").is_none(),
        "an empty queue claims nothing"
    );
}

#[tokio::test]
#[serial]
async fn completion_is_conditional_on_state_and_claimant() {
    let (_pool, store) = require_db!();
    let queue = unique_queue();

    let row = store
        .insert(NewInvocation::new(queue, "a", json!({"m": 1}), json!({})))
        .await
        .expect("insert");

    // not running yet
    assert!(store
        .complete(row.id, "worker-1", json!({"r": 0}))
        .await
        .expect("call")
        .is_none());

    store
        .claim_next(queue, "worker-1")
        .await
        .expect("claim")
        .expect("claimable");

    // wrong claimant
    assert!(store
        .complete(row.id, "someone-else", json!({"r": 0}))
        .await
        .expect("call")
        .is_none());

    let completed = store
        .complete(row.id, "worker-1", json!({"r": 1}))
        .await
        .expect("complete")
        .expect("matches");
    assert_eq!(completed.state, InvocationState::Completed);
    assert_eq!(completed.result, Some(json!({"r": 1})));
    assert!(completed.finalized_at.is_some());

    // duplicate completion and late discard both lose
    assert!(store
        .complete(row.id, "worker-1", json!({"r": 2}))
        .await
        .expect("call")
        .is_none());
    assert!(store
        .discard(row.id, "worker-1", json!({"e": 1}))
        .await
        .expect("call")
        .is_none());
}

#[tokio::test]
#[serial]
async fn discard_stores_errors() {
    let (_pool, store) = require_db!();
    let queue = unique_queue();

    let row = store
        .insert(NewInvocation::new(queue, "a", json!({"m": 1}), json!({})))
        .await
        .expect("insert");
    store
        .claim_next(queue, "worker-1")
        .await
        .expect("claim")
        .expect("claimable");

    let discarded = store
        .discard(row.id, "worker-1", json!({"error": "boom"}))
        .await
        .expect("discard")
        .expect("matches");
    assert_eq!(discarded.state, InvocationState::Discarded);
    assert_eq!(discarded.errors, Some(json!({"error": "boom"})));
}

// ---------------------------------------------------------------------------
// Agent resolution
// ---------------------------------------------------------------------------

#[tokio::test]
#[serial]
async fn register_agent_upserts_and_find_resolves() {
    let (_pool, store) = require_db!();
    let queue = unique_queue();
    let name = format!("agent-{queue}");

    store.register_agent(&name, queue).await.expect("register");
    store
        .register_agent(&name, queue + 1)
        .await
        .expect("re-register");

    let agent = store
        .find_agent(&name)
        .await
        .expect("find")
        .expect("agent exists");
    assert_eq!(agent.queue_id, queue + 1);

    assert!(store
        .find_agent("never-registered")
        .await
        .expect("find")
        .is_none());
}

// ---------------------------------------------------------------------------
// NOTIFY round trip through the dedicated listener
// ---------------------------------------------------------------------------

#[tokio::test]
#[serial]
async fn notify_reaches_a_listening_session() {
    let (pool, store) = require_db!();
    let topic = format!("itest_topic_{}", unique_queue());

    let mut listener = PgChannelListener::new(pool);
    listener.connect().await.expect("listener connect");
    listener.listen(&topic).await.expect("listen");
    listener.ping().await.expect("ping on a live session");

    store.notify(&topic, "12345").await.expect("notify");

    let cancel = CancellationToken::new();
    let event = tokio::time::timeout(Duration::from_secs(5), listener.recv(&cancel))
        .await
        .expect("notification within the window")
        .expect("recv");
    assert_eq!(event.topic, topic, "schema prefix is stripped");
    assert_eq!(event.payload, "12345");

    listener.close().await.expect("close");
}

#[tokio::test]
#[serial]
async fn unlistened_topic_receives_nothing() {
    let (pool, store) = require_db!();
    let topic = format!("itest_quiet_{}", unique_queue());

    let mut listener = PgChannelListener::new(pool);
    listener.connect().await.expect("listener connect");
    listener.listen(&topic).await.expect("listen");
    listener.unlisten(&topic).await.expect("unlisten");

    store.notify(&topic, "dropped").await.expect("notify");

    let cancel = CancellationToken::new();
    let waited = tokio::time::timeout(Duration::from_millis(500), listener.recv(&cancel)).await;
    assert!(waited.is_err(), "no delivery after UNLISTEN");

    listener.close().await.expect("close");
}
