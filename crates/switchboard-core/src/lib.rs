//! # Switchboard Core
//!
//! The execution core of the Switchboard agent platform: a durable invocation
//! queue in Postgres paired with ephemeral LISTEN/NOTIFY wake-ups, so agents
//! long-polling a queue are woken the moment work lands without busy polling.
//!
//! Durable truth lives in the [`store`]; notifications (via
//! [`switchboard_notify`]) are only a latency optimization. Every consumer
//! that wakes — for any reason — re-queries the store, and every state
//! transition is guarded by a conditional query so racing callers lose
//! gracefully with "not found" instead of corrupting a row.
//!
//! Entry point: [`InvocationManager`], which composes a
//! [`Notifier`](switchboard_notify::Notifier) and a
//! [`Dispatcher`](switchboard_notify::Dispatcher) with an
//! [`InvocationStore`](store::InvocationStore).

pub mod error;
pub mod invocation;
pub mod manager;
pub mod store;

pub use error::{CoreError, Result};
pub use invocation::{parse_invocation_id, Agent, Invocation, InvocationState, NewInvocation};
pub use manager::{
    InvocationManager, ManagerConfig, SyncOutcome, INVOKE_TOPIC, RESPONSE_TOPIC,
};
pub use store::memory::MemoryInvocationStore;
pub use store::postgres::PgInvocationStore;
pub use store::InvocationStore;
