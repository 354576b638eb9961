//! End-to-end manager flows over the in-memory store, with the mock listener
//! closing the NOTIFY loop: insert → wake → claim → complete, racing
//! long-polls, synchronous execution, and shutdown semantics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use switchboard_core::{
    CoreError, InvocationManager, InvocationState, ManagerConfig, MemoryInvocationStore,
    SyncOutcome, INVOKE_TOPIC,
};
use switchboard_notify::testing::{MockHub, MockListener};
use switchboard_notify::{Notifier, NotifierConfig};

const QUEUE: i64 = 7;
const AGENT: &str = "echo";

struct Rig {
    store: Arc<MemoryInvocationStore>,
    manager: Arc<InvocationManager<MemoryInvocationStore>>,
    #[allow(dead_code)]
    hub: MockHub,
}

async fn rig() -> Rig {
    let store = Arc::new(MemoryInvocationStore::new());
    let (listener, hub) = MockListener::new();

    // the store's NOTIFYs feed the listener the way pg_notify feeds Postgres
    let wire = hub.clone();
    store.set_notification_sink(Arc::new(move |topic: &str, payload: &str| {
        wire.notify(topic, payload)
    }));

    let notifier = Notifier::new(
        Box::new(listener),
        NotifierConfig::default().with_backoff(Duration::from_millis(20), Duration::from_millis(80)),
    );
    let manager = Arc::new(InvocationManager::new(
        Arc::clone(&store),
        notifier,
        ManagerConfig::default(),
    ));

    store.register_agent(AGENT, QUEUE).await;
    manager.start().await.expect("manager start");

    // invoke subscription must be live before tests start inserting
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if hub.listened_topics().contains(&INVOKE_TOPIC.to_string()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(hub.listened_topics().contains(&INVOKE_TOPIC.to_string()));

    Rig {
        store,
        manager,
        hub,
    }
}

// ---------------------------------------------------------------------------
// Happy path: insert → claim → complete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn insert_claim_complete_round_trip() {
    let rig = rig().await;

    let id = rig
        .manager
        .insert_invocation("actor-1", AGENT, &json!({"trace": "t-1"}), &json!({"k": 1}))
        .await
        .expect("insert");

    let claimed = rig
        .manager
        .get_next_invocation("worker-1", QUEUE, Some(5))
        .await
        .expect("get next")
        .expect("one invocation should be claimable");
    assert_eq!(claimed.external_id(), id);
    assert_eq!(claimed.state, InvocationState::Running);
    assert_eq!(claimed.payload, json!({"k": 1}));
    assert_eq!(claimed.metadata, json!({"trace": "t-1"}));
    assert_eq!(claimed.claimant(), Some("worker-1"));
    assert_eq!(claimed.created_by, "actor-1");
    assert!(claimed.attempted_at.is_some());

    let completed = rig
        .manager
        .return_invocation_response(&id, "worker-1", &json!({"r": 1}))
        .await
        .expect("complete")
        .expect("completion should match the running row");
    assert_eq!(completed.state, InvocationState::Completed);
    assert_eq!(completed.result, Some(json!({"r": 1})));
    assert!(completed.finalized_at.is_some());

    let fetched = rig
        .manager
        .get_invocation(&id)
        .await
        .expect("get")
        .expect("row exists");
    assert_eq!(fetched.state, InvocationState::Completed);

    rig.manager.close().await;
}

// ---------------------------------------------------------------------------
// Long-poll wake-up: a parked consumer is woken by the insert's NOTIFY
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parked_long_poll_wakes_on_insert() {
    let rig = rig().await;

    let manager = Arc::clone(&rig.manager);
    let poller = tokio::spawn(async move {
        let started = Instant::now();
        let got = manager.get_next_invocation("worker-1", QUEUE, Some(10)).await;
        (got, started.elapsed())
    });

    // let the poller park on the dispatcher before work arrives
    tokio::time::sleep(Duration::from_millis(150)).await;
    rig.manager
        .insert_invocation("actor-1", AGENT, &json!({"trace": "t"}), &json!({}))
        .await
        .expect("insert");

    let (got, elapsed) = poller.await.expect("join");
    let invocation = got.expect("get next").expect("woken with the new invocation");
    assert_eq!(invocation.state, InvocationState::Running);
    assert!(
        elapsed < Duration::from_secs(5),
        "woke via notification, not budget expiry: {elapsed:?}"
    );

    rig.manager.close().await;
}

// ---------------------------------------------------------------------------
// Exactly one of many racing pollers claims a given invocation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn racing_long_polls_claim_exactly_once() {
    let rig = rig().await;

    let mut pollers = Vec::new();
    for i in 0..4 {
        let manager = Arc::clone(&rig.manager);
        pollers.push(tokio::spawn(async move {
            manager
                .get_next_invocation(&format!("worker-{i}"), QUEUE, Some(2))
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    rig.manager
        .insert_invocation("actor-1", AGENT, &json!({"trace": "t"}), &json!({}))
        .await
        .expect("insert");

    let results = futures::future::join_all(pollers).await;
    let mut hits = 0;
    let mut misses = 0;
    for joined in results {
        match joined.expect("join").expect("get next") {
            Some(_) => hits += 1,
            None => misses += 1,
        }
    }
    assert_eq!(hits, 1, "exactly one poller claims the invocation");
    assert_eq!(misses, 3, "everyone else times out empty");

    rig.manager.close().await;
}

// ---------------------------------------------------------------------------
// Budget expiry is Ok(None), on time
// ---------------------------------------------------------------------------

#[tokio::test]
async fn long_poll_with_no_work_returns_none_at_deadline() {
    let rig = rig().await;

    let started = Instant::now();
    let got = rig
        .manager
        .get_next_invocation("worker-1", QUEUE, Some(1))
        .await
        .expect("get next");
    let elapsed = started.elapsed();

    assert!(got.is_none());
    assert!(elapsed >= Duration::from_millis(900), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "returned late: {elapsed:?}");

    rig.manager.close().await;
}

// ---------------------------------------------------------------------------
// Completion races: duplicates and imposters lose as "not found"
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_and_mismatched_returns_are_no_ops() {
    let rig = rig().await;

    let id = rig
        .manager
        .insert_invocation("actor-1", AGENT, &json!({"trace": "t"}), &json!({}))
        .await
        .expect("insert");
    rig.manager
        .get_next_invocation("worker-1", QUEUE, Some(5))
        .await
        .expect("get next")
        .expect("claim");

    // wrong claimant cannot finish someone else's work
    assert!(rig
        .manager
        .return_invocation_response(&id, "imposter", &json!({"r": 0}))
        .await
        .expect("call succeeds")
        .is_none());

    // first return wins
    assert!(rig
        .manager
        .return_invocation_response(&id, "worker-1", &json!({"r": 1}))
        .await
        .expect("complete")
        .is_some());

    // second return (either flavor) is a harmless not-found
    assert!(rig
        .manager
        .return_invocation_response(&id, "worker-1", &json!({"r": 2}))
        .await
        .expect("duplicate response call succeeds")
        .is_none());
    assert!(rig
        .manager
        .return_invocation_error(&id, "worker-1", &json!({"e": 1}))
        .await
        .expect("late error call succeeds")
        .is_none());

    // the stored result is the first one
    let row = rig.manager.get_invocation(&id).await.expect("get").expect("row");
    assert_eq!(row.result, Some(json!({"r": 1})));
    assert_eq!(row.state, InvocationState::Completed);

    rig.manager.close().await;
}

#[tokio::test]
async fn error_return_discards_the_invocation() {
    let rig = rig().await;

    let id = rig
        .manager
        .insert_invocation("actor-1", AGENT, &json!({"trace": "t"}), &json!({}))
        .await
        .expect("insert");
    rig.manager
        .get_next_invocation("worker-1", QUEUE, Some(5))
        .await
        .expect("get next")
        .expect("claim");

    let discarded = rig
        .manager
        .return_invocation_error(&id, "worker-1", &json!({"error": "boom"}))
        .await
        .expect("fail")
        .expect("error return should match");
    assert_eq!(discarded.state, InvocationState::Discarded);
    assert_eq!(discarded.errors, Some(json!({"error": "boom"})));

    rig.manager.close().await;
}

// ---------------------------------------------------------------------------
// Synchronous execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sync_execution_returns_result_from_responding_consumer() {
    let rig = rig().await;

    let manager = Arc::clone(&rig.manager);
    let consumer = tokio::spawn(async move {
        let claimed = manager
            .get_next_invocation("worker-1", QUEUE, Some(10))
            .await
            .expect("consumer get next")
            .expect("consumer claims the sync invocation");
        manager
            .return_invocation_response(&claimed.external_id(), "worker-1", &json!({"echo": true}))
            .await
            .expect("consumer completes")
            .expect("completion matches");
    });

    let outcome = rig
        .manager
        .execute_invocation_sync("actor-1", AGENT, &json!({"trace": "t"}), &json!({}), Some(10))
        .await
        .expect("sync execute");
    match outcome {
        SyncOutcome::Finished(invocation) => {
            assert_eq!(invocation.state, InvocationState::Completed);
            assert_eq!(invocation.result, Some(json!({"echo": true})));
        }
        SyncOutcome::TimedOut { invocation_id } => {
            panic!("expected completion, still pending: {invocation_id}")
        }
    }

    consumer.await.expect("consumer join");
    rig.manager.close().await;
}

#[tokio::test]
async fn sync_execution_timeout_is_an_outcome_not_an_error() {
    let rig = rig().await;

    let started = Instant::now();
    let outcome = rig
        .manager
        .execute_invocation_sync("actor-1", AGENT, &json!({"trace": "t"}), &json!({}), Some(1))
        .await
        .expect("sync execute");
    let elapsed = started.elapsed();

    let SyncOutcome::TimedOut { invocation_id } = outcome else {
        panic!("no consumer exists, the call must time out");
    };
    assert!(elapsed >= Duration::from_millis(900));
    assert!(elapsed < Duration::from_secs(3));

    // the timeout left the row alone: still claimable by a late consumer
    let row = rig
        .manager
        .get_invocation(&invocation_id)
        .await
        .expect("get")
        .expect("row survives the timeout");
    assert_eq!(row.state, InvocationState::Available);

    rig.manager.close().await;
}

// ---------------------------------------------------------------------------
// Input validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_agent_is_a_client_error() {
    let rig = rig().await;

    let err = rig
        .manager
        .insert_invocation("actor-1", "nonexistent", &json!({"trace": "t"}), &json!({}))
        .await
        .expect_err("unknown agent must be rejected");
    assert!(matches!(err, CoreError::UnknownAgent(_)));
    assert!(err.is_client_error());
    assert!(rig.store.is_empty().await, "nothing inserted");

    rig.manager.close().await;
}

#[tokio::test]
async fn empty_metadata_is_rejected() {
    let rig = rig().await;

    let err = rig
        .manager
        .insert_invocation("actor-1", AGENT, &json!({}), &json!({"k": 1}))
        .await
        .expect_err("empty metadata must be rejected");
    assert!(matches!(err, CoreError::InvalidInput(_)));
    assert!(err.is_client_error());

    rig.manager.close().await;
}

#[tokio::test]
async fn garbage_ids_read_as_not_found() {
    let rig = rig().await;

    assert!(rig
        .manager
        .get_invocation("not-a-number")
        .await
        .expect("get succeeds")
        .is_none());
    assert!(rig
        .manager
        .return_invocation_response("999999", "worker-1", &json!({}))
        .await
        .expect("call succeeds")
        .is_none());

    rig.manager.close().await;
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_rejects_new_work_and_is_idempotent() {
    let rig = rig().await;

    rig.manager.close().await;
    rig.manager.close().await;
    assert!(rig.manager.is_closed());

    let err = rig
        .manager
        .insert_invocation("actor-1", AGENT, &json!({"trace": "t"}), &json!({}))
        .await
        .expect_err("insert after close");
    assert!(err.is_closed());

    let err = rig
        .manager
        .get_next_invocation("worker-1", QUEUE, Some(1))
        .await
        .expect_err("poll after close");
    assert!(err.is_closed());
}

#[tokio::test]
async fn close_unblocks_inflight_long_polls() {
    let rig = rig().await;

    let manager = Arc::clone(&rig.manager);
    let poller = tokio::spawn(async move {
        manager.get_next_invocation("worker-1", QUEUE, Some(60)).await
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let started = Instant::now();
    rig.manager.close().await;
    let result = poller.await.expect("join");

    let err = result.expect_err("poll must be released with a closed error");
    assert!(err.is_closed(), "got: {err}");
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "released promptly, not at budget expiry"
    );
}
