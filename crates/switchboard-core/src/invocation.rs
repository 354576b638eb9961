//! Invocation domain types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Lifecycle of one invocation.
///
/// `available` and `running` are non-terminal; the rest are final. The only
/// transitions this crate performs are `available → running` (claim) and
/// `running → completed|discarded` (return); cancellation is written by a
/// collaborator and treated as terminal here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationState {
    Available,
    Running,
    Completed,
    Discarded,
    Cancelled,
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationState::Completed | InvocationState::Discarded | InvocationState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationState::Available => "available",
            InvocationState::Running => "running",
            InvocationState::Completed => "completed",
            InvocationState::Discarded => "discarded",
            InvocationState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for InvocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InvocationState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(InvocationState::Available),
            "running" => Ok(InvocationState::Running),
            "completed" => Ok(InvocationState::Completed),
            "discarded" => Ok(InvocationState::Discarded),
            "cancelled" => Ok(InvocationState::Cancelled),
            other => Err(CoreError::CorruptRecord(format!(
                "unknown invocation state '{other}'"
            ))),
        }
    }
}

/// One unit of work submitted for a target agent to perform.
#[derive(Debug, Clone, Serialize)]
pub struct Invocation {
    pub id: i64,
    /// Mailbox of the target actor; immutable for the row's lifetime
    pub queue_id: i64,
    pub state: InvocationState,
    pub payload: Value,
    pub metadata: Value,
    pub result: Option<Value>,
    pub errors: Option<Value>,
    /// Lower value is claimed first within a queue
    pub priority: i32,
    pub created_by: String,
    /// Epoch seconds
    pub created_at: i64,
    pub attempted_at: Option<i64>,
    pub finalized_at: Option<i64>,
    /// Every identity that ever claimed the row, in claim order
    pub attempted_by: Vec<String>,
}

impl Invocation {
    /// The identifier handed to external callers.
    pub fn external_id(&self) -> String {
        self.id.to_string()
    }

    /// Current claimant: the most recent entry in the claim history.
    pub fn claimant(&self) -> Option<&str> {
        self.attempted_by.last().map(String::as_str)
    }
}

/// Parameters for inserting a new invocation row.
#[derive(Debug, Clone)]
pub struct NewInvocation {
    pub queue_id: i64,
    pub created_by: String,
    pub metadata: Value,
    pub payload: Value,
    pub priority: i32,
}

impl NewInvocation {
    pub fn new(queue_id: i64, created_by: &str, metadata: Value, payload: Value) -> Self {
        Self {
            queue_id,
            created_by: created_by.to_string(),
            metadata,
            payload,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Resolution target for an invocation: an agent name bound to a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Agent {
    pub name: String,
    pub queue_id: i64,
}

/// Parse the numeric invocation id out of its external form.
///
/// Garbage yields `None`, which callers report as "not found" — an id that
/// never existed and an id that cannot exist are indistinguishable outcomes.
pub fn parse_invocation_id(external: &str) -> Option<i64> {
    external.parse::<i64>().ok().filter(|id| *id > 0)
}
