//! Durable storage contract for invocations.
//!
//! The manager is generic over [`InvocationStore`] so the same wake/dispatch
//! logic runs against Postgres in production and the in-memory store in
//! tests. Every mutating method is atomic and conditional: a concurrent
//! caller that loses the race observes `None`, never a partial write.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::invocation::{Agent, Invocation, NewInvocation};

pub mod memory;
pub mod postgres;

#[async_trait]
pub trait InvocationStore: Send + Sync {
    /// Insert an `available` row and return it with its assigned id.
    async fn insert(&self, new: NewInvocation) -> Result<Invocation>;

    /// Atomically claim the next available row for a queue: mark it
    /// `running`, stamp `attempted_at`, append `claimant` to the claim
    /// history. Lowest priority value first, FIFO within a priority.
    /// `None` when the queue has nothing available.
    async fn claim_next(&self, queue_id: i64, claimant: &str) -> Result<Option<Invocation>>;

    /// Transition `running → completed` iff the row is running and `claimant`
    /// holds the claim. Stamps `finalized_at` and stores `result`. `None`
    /// when no row matched — already terminal, wrong claimant, unknown id.
    async fn complete(&self, id: i64, claimant: &str, result: Value)
        -> Result<Option<Invocation>>;

    /// Transition `running → discarded`, storing `errors`. Same matching
    /// rules as [`complete`](Self::complete).
    async fn discard(&self, id: i64, claimant: &str, errors: Value)
        -> Result<Option<Invocation>>;

    /// Fetch a row by id.
    async fn get(&self, id: i64) -> Result<Option<Invocation>>;

    /// Resolve an agent name to its queue.
    async fn find_agent(&self, name: &str) -> Result<Option<Agent>>;

    /// Fire one NOTIFY with the given topic and payload. Issued immediately
    /// after the domain write it follows; not transactional with it.
    async fn notify(&self, topic: &str, payload: &str) -> Result<()>;
}
