//! Generic id-keyed rendezvous between notification producers and waiters.
//!
//! Each id owns one bounded channel, created lazily by `listen`/`wait_for`.
//! `dispatch` is a non-blocking send: no channel, or a full buffer, drops the
//! payload. Several waiters may block on the same id, and each dispatched
//! payload wakes exactly one of them — this is a wake-up hint, not a
//! broadcast, so consumers re-derive ground truth (query the store) after
//! every wake.
//!
//! Policy on shutdown: `close` is idempotent and void; `listen`, `wait_for`
//! and `dispatch` all report [`NotifyError::DispatcherClosed`] afterwards,
//! and waiters blocked at close time are released promptly with that error.
//! Channels are reclaimed only by `close` — the key space is one entry per
//! actively-polled queue, bounded in practice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::config::DispatcherConfig;
use crate::error::{NotifyError, Result};

struct DispatchEntry<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for DispatchEntry<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
        }
    }
}

struct DispatcherState<T> {
    closed: bool,
    channels: HashMap<String, DispatchEntry<T>>,
}

/// Concurrency-safe id → channel multiplexer.
pub struct Dispatcher<T> {
    state: std::sync::Mutex<DispatcherState<T>>,
    capacity: usize,
}

impl<T> std::fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f.debug_struct("Dispatcher")
            .field("closed", &state.closed)
            .field("channels", &state.channels.len())
            .finish()
    }
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl<T> Dispatcher<T> {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            state: std::sync::Mutex::new(DispatcherState {
                closed: false,
                channels: HashMap::new(),
            }),
            capacity: config.buffer_capacity.max(1),
        }
    }

    fn entry(&self, id: &str) -> Result<DispatchEntry<T>> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.closed {
            return Err(NotifyError::DispatcherClosed);
        }
        let capacity = self.capacity;
        let entry = state.channels.entry(id.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(capacity);
            DispatchEntry {
                tx,
                rx: Arc::new(Mutex::new(rx)),
            }
        });
        Ok(entry.clone())
    }

    /// Ensure a channel exists for `id`.
    pub fn listen(&self, id: &str) -> Result<()> {
        self.entry(id).map(|_| ())
    }

    /// Block until a payload is dispatched to `id`, the timeout elapses
    /// (`Ok(None)`), or the dispatcher closes (`Err(DispatcherClosed)`).
    /// The channel is created if absent.
    pub async fn wait_for(&self, id: &str, timeout: Duration) -> Result<Option<T>> {
        // hold only the receiver side: a retained sender clone would keep the
        // channel open across close() and leave waiters stuck to their timeout
        let rx = self.entry(id)?.rx;
        let received = tokio::time::timeout(timeout, async {
            // waiters on the same id queue here; one payload wakes one waiter
            let mut rx = rx.lock().await;
            rx.recv().await
        })
        .await;
        match received {
            Ok(Some(payload)) => Ok(Some(payload)),
            // sender dropped: close() ran while we were waiting
            Ok(None) => Err(NotifyError::DispatcherClosed),
            Err(_) => Ok(None),
        }
    }

    /// Non-blocking, at-most-once handoff to `id`'s channel. Payloads for
    /// unknown ids, and payloads beyond the buffer, are discarded.
    pub fn dispatch(&self, id: &str, payload: T) -> Result<()> {
        let entry = {
            let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if state.closed {
                return Err(NotifyError::DispatcherClosed);
            }
            state.channels.get(id).cloned()
        };
        let Some(entry) = entry else {
            debug!(id = %id, "dispatch without listener, payload dropped");
            return Ok(());
        };
        if entry.tx.try_send(payload).is_err() {
            debug!(id = %id, "dispatch buffer full, payload dropped");
        }
        Ok(())
    }

    /// Close every channel and refuse further use. Idempotent. Blocked
    /// waiters observe `DispatcherClosed` rather than waiting out their
    /// timeouts.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.closed = true;
        // dropping the senders wakes every receiver with channel-closed
        state.channels.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .closed
    }
}
