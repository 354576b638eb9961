//! In-memory invocation store.
//!
//! Mirrors the Postgres store's conditional semantics exactly — claim order,
//! claimant matching, no-op losers — so the manager can be exercised
//! end-to-end in-process. The notification sink stands in for `pg_notify`;
//! tests wire it to the mock listener hub to close the wake-up loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::invocation::{Agent, Invocation, InvocationState, NewInvocation};
use crate::store::InvocationStore;

/// Receives every NOTIFY the store would have sent.
pub type NotificationSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
struct Tables {
    next_id: i64,
    invocations: BTreeMap<i64, Invocation>,
    agents: HashMap<String, i64>,
}

/// In-process [`InvocationStore`] for tests and embedded use.
pub struct MemoryInvocationStore {
    tables: Mutex<Tables>,
    sink: std::sync::Mutex<Option<NotificationSink>>,
}

impl std::fmt::Debug for MemoryInvocationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryInvocationStore").finish()
    }
}

impl Default for MemoryInvocationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInvocationStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            sink: std::sync::Mutex::new(None),
        }
    }

    /// Route this store's notifications somewhere (e.g. a mock listener hub).
    pub fn set_notification_sink(&self, sink: NotificationSink) {
        *self.sink.lock().unwrap_or_else(|p| p.into_inner()) = Some(sink);
    }

    pub async fn register_agent(&self, name: &str, queue_id: i64) -> Agent {
        let mut tables = self.tables.lock().await;
        tables.agents.insert(name.to_string(), queue_id);
        Agent {
            name: name.to_string(),
            queue_id,
        }
    }

    /// Number of rows currently held, for test assertions.
    pub async fn len(&self) -> usize {
        self.tables.lock().await.invocations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn now_epoch() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[async_trait]
impl InvocationStore for MemoryInvocationStore {
    async fn insert(&self, new: NewInvocation) -> Result<Invocation> {
        let mut tables = self.tables.lock().await;
        tables.next_id += 1;
        let id = tables.next_id;
        let invocation = Invocation {
            id,
            queue_id: new.queue_id,
            state: InvocationState::Available,
            payload: new.payload,
            metadata: new.metadata,
            result: None,
            errors: None,
            priority: new.priority,
            created_by: new.created_by,
            created_at: Self::now_epoch(),
            attempted_at: None,
            finalized_at: None,
            attempted_by: Vec::new(),
        };
        tables.invocations.insert(id, invocation.clone());
        Ok(invocation)
    }

    async fn claim_next(&self, queue_id: i64, claimant: &str) -> Result<Option<Invocation>> {
        let mut tables = self.tables.lock().await;
        // BTreeMap iterates in id order, so min-by priority is FIFO within
        // a priority band, matching the SQL ORDER BY priority, id
        let candidate = tables
            .invocations
            .values()
            .filter(|inv| inv.queue_id == queue_id && inv.state == InvocationState::Available)
            .min_by_key(|inv| (inv.priority, inv.id))
            .map(|inv| inv.id);
        let Some(id) = candidate else {
            return Ok(None);
        };
        let Some(inv) = tables.invocations.get_mut(&id) else {
            return Ok(None);
        };
        inv.state = InvocationState::Running;
        inv.attempted_at = Some(Self::now_epoch());
        inv.attempted_by.push(claimant.to_string());
        Ok(Some(inv.clone()))
    }

    async fn complete(
        &self,
        id: i64,
        claimant: &str,
        result: Value,
    ) -> Result<Option<Invocation>> {
        let mut tables = self.tables.lock().await;
        let Some(inv) = tables.invocations.get_mut(&id) else {
            return Ok(None);
        };
        if inv.state != InvocationState::Running || inv.claimant() != Some(claimant) {
            return Ok(None);
        }
        inv.state = InvocationState::Completed;
        inv.result = Some(result);
        inv.finalized_at = Some(Self::now_epoch());
        Ok(Some(inv.clone()))
    }

    async fn discard(
        &self,
        id: i64,
        claimant: &str,
        errors: Value,
    ) -> Result<Option<Invocation>> {
        let mut tables = self.tables.lock().await;
        let Some(inv) = tables.invocations.get_mut(&id) else {
            return Ok(None);
        };
        if inv.state != InvocationState::Running || inv.claimant() != Some(claimant) {
            return Ok(None);
        }
        inv.state = InvocationState::Discarded;
        inv.errors = Some(errors);
        inv.finalized_at = Some(Self::now_epoch());
        Ok(Some(inv.clone()))
    }

    async fn get(&self, id: i64) -> Result<Option<Invocation>> {
        let tables = self.tables.lock().await;
        Ok(tables.invocations.get(&id).cloned())
    }

    async fn find_agent(&self, name: &str) -> Result<Option<Agent>> {
        let tables = self.tables.lock().await;
        Ok(tables.agents.get(name).map(|queue_id| Agent {
            name: name.to_string(),
            queue_id: *queue_id,
        }))
    }

    async fn notify(&self, topic: &str, payload: &str) -> Result<()> {
        let sink = {
            let guard = self.sink.lock().unwrap_or_else(|p| p.into_inner());
            guard.clone()
        };
        if let Some(sink) = sink {
            sink(topic, payload);
        }
        Ok(())
    }
}
