//! Configuration for the notify layer.
//!
//! Explicit structs passed to constructors; nothing here is global state.

use std::time::Duration;

/// Configuration for the [`Notifier`](crate::Notifier) background loop.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// First reconnect delay after a connection failure
    pub backoff_floor: Duration,
    /// Largest reconnect delay; doubling stops here
    pub backoff_ceiling: Duration,
    /// Attempt count after which the backoff sequence starts over, keeping
    /// long outages from pinning every retry at the ceiling
    pub backoff_reset_after: u32,
    /// Buffer size for the loop's internal command channel
    pub command_buffer: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            backoff_floor: Duration::from_millis(200),
            backoff_ceiling: Duration::from_secs(30),
            backoff_reset_after: 10,
            command_buffer: 128,
        }
    }
}

impl NotifierConfig {
    /// Override the backoff window.
    pub fn with_backoff(mut self, floor: Duration, ceiling: Duration) -> Self {
        self.backoff_floor = floor;
        self.backoff_ceiling = ceiling;
        self
    }
}

/// Configuration for a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-id channel capacity. Dispatches beyond this while no waiter is
    /// draining are dropped, which the at-most-once contract permits.
    pub buffer_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 32,
        }
    }
}
