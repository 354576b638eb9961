//! Test doubles for the notify layer.
//!
//! [`MockListener`] implements [`ChannelListener`] over an in-process event
//! channel so notifier and manager behavior can be exercised without a
//! database. The paired [`MockHub`] is the "server side": it injects
//! notifications, severs the connection, and scripts failures.
//!
//! The mock honors the LISTEN gate the way Postgres does: a notification for
//! a topic the session is not listening on is never delivered, and nothing
//! sent while disconnected is replayed later.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{NotifyError, Result};
use crate::listener::{ChannelListener, NotificationEvent};

enum MockEvent {
    Notify { topic: String, payload: String },
    Disconnect,
}

struct MockShared {
    connected: AtomicBool,
    listened: Mutex<HashSet<String>>,
    fail_connects: AtomicU32,
    fail_listen_topics: Mutex<HashSet<String>>,
}

/// Scripted stand-in for the dedicated LISTEN connection.
pub struct MockListener {
    rx: mpsc::UnboundedReceiver<MockEvent>,
    shared: Arc<MockShared>,
}

impl std::fmt::Debug for MockListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockListener")
            .field("connected", &self.shared.connected.load(Ordering::SeqCst))
            .finish()
    }
}

/// Control handle paired with a [`MockListener`].
#[derive(Clone)]
pub struct MockHub {
    tx: mpsc::UnboundedSender<MockEvent>,
    shared: Arc<MockShared>,
}

impl std::fmt::Debug for MockHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHub")
            .field("connected", &self.shared.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl MockListener {
    pub fn new() -> (MockListener, MockHub) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            connected: AtomicBool::new(false),
            listened: Mutex::new(HashSet::new()),
            fail_connects: AtomicU32::new(0),
            fail_listen_topics: Mutex::new(HashSet::new()),
        });
        (
            MockListener {
                rx,
                shared: Arc::clone(&shared),
            },
            MockHub { tx, shared },
        )
    }
}

impl MockHub {
    /// Inject a notification. Like the server, delivery is decided at send
    /// time: nothing is queued for a disconnected session or a topic the
    /// session is not listening on.
    pub fn notify(&self, topic: &str, payload: &str) {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return;
        }
        let listened = self
            .shared
            .listened
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(topic);
        if !listened {
            return;
        }
        let _ = self.tx.send(MockEvent::Notify {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }

    /// Sever the connection; the next blocking wait reports `ConnectionLost`.
    pub fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        let _ = self.tx.send(MockEvent::Disconnect);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Topics the current session is listening on.
    pub fn listened_topics(&self) -> Vec<String> {
        let listened = self.shared.listened.lock().unwrap_or_else(|p| p.into_inner());
        listened.iter().cloned().collect()
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Make LISTEN fail for `topic` until cleared.
    pub fn fail_listen_on(&self, topic: &str) {
        self.shared
            .fail_listen_topics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(topic.to_string());
    }

    pub fn clear_listen_failure(&self, topic: &str) {
        self.shared
            .fail_listen_topics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(topic);
    }
}

#[async_trait]
impl ChannelListener for MockListener {
    async fn connect(&mut self) -> Result<()> {
        let failures = self.shared.fail_connects.load(Ordering::SeqCst);
        if failures > 0 {
            self.shared
                .fail_connects
                .store(failures - 1, Ordering::SeqCst);
            return Err(NotifyError::Connection("injected connect failure".into()));
        }
        // a fresh session starts with an empty mailbox; stale events from a
        // severed session must not leak into it
        while self.rx.try_recv().is_ok() {}
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared
            .listened
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        Ok(())
    }

    async fn listen(&mut self, topic: &str) -> Result<()> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(NotifyError::NotConnected);
        }
        let injected = self
            .shared
            .fail_listen_topics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(topic);
        if injected {
            return Err(NotifyError::Listen {
                topic: topic.to_string(),
                reason: "injected listen failure".into(),
            });
        }
        self.shared
            .listened
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(topic.to_string());
        Ok(())
    }

    async fn unlisten(&mut self, topic: &str) -> Result<()> {
        self.shared
            .listened
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(topic);
        Ok(())
    }

    async fn recv(&mut self, cancel: &CancellationToken) -> Result<NotificationEvent> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(NotifyError::NotConnected);
        }
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(NotifyError::Cancelled),
            e = self.rx.recv() => e,
        };
        match event {
            Some(MockEvent::Notify { topic, payload }) => {
                Ok(NotificationEvent { topic, payload })
            }
            Some(MockEvent::Disconnect) | None => Err(NotifyError::ConnectionLost),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NotifyError::NotConnected)
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared
            .listened
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        Ok(())
    }
}
