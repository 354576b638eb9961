//! Dedicated LISTEN connection wrapper.
//!
//! [`PgChannelListener`] owns exactly one connection drawn from the pool and
//! uses it for nothing but LISTEN/UNLISTEN and blocking notification waits.
//! Channel names are namespaced as `<schema>.<topic>` so multiple tenants
//! sharing a cluster (one schema each) never observe each other's signals;
//! the prefix is stripped before events reach subscribers.
//!
//! The wrapper has no retry policy of its own. Connection loss surfaces as
//! [`NotifyError::ConnectionLost`] and the owner (the notifier loop) decides
//! when to reconnect and re-register.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgNotification};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{NotifyError, Result};

/// Probe topic used by `ping`; never carries subscriber traffic.
const PING_TOPIC: &str = "__switchboard_ping__";

/// A notification received from the database, schema prefix already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub topic: String,
    pub payload: String,
}

/// One dedicated database session for LISTEN/UNLISTEN/wait.
///
/// Implementations are used by exactly one caller at a time (the notifier
/// loop); `&mut self` receivers encode that. The trait exists so tests can
/// substitute a scripted listener — see [`crate::testing::MockListener`] —
/// and needs exactly one production implementation.
#[async_trait]
pub trait ChannelListener: Send {
    /// Acquire the dedicated connection and resolve the namespace prefix.
    /// Idempotent while connected.
    async fn connect(&mut self) -> Result<()>;

    /// Issue LISTEN for a topic. No-op if already listened on this session.
    async fn listen(&mut self, topic: &str) -> Result<()>;

    /// Issue UNLISTEN for a topic. No-op if not listened.
    async fn unlisten(&mut self, topic: &str) -> Result<()>;

    /// Block until a notification arrives or `cancel` fires.
    ///
    /// Returns [`NotifyError::Cancelled`] on cancellation and
    /// [`NotifyError::ConnectionLost`] when the session dropped mid-wait.
    async fn recv(&mut self, cancel: &CancellationToken) -> Result<NotificationEvent>;

    /// Liveness round-trip on the dedicated connection.
    async fn ping(&mut self) -> Result<()>;

    /// Release the connection. A session with topics still listened is not
    /// handed back as-is; it is scrubbed or dropped so no other caller
    /// inherits stray subscriptions.
    async fn close(&mut self) -> Result<()>;
}

fn channel_name(schema: &str, topic: &str) -> String {
    format!("{schema}.{topic}")
}

fn strip_schema<'a>(schema: &str, channel: &'a str) -> &'a str {
    channel
        .strip_prefix(schema)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(channel)
}

/// Production [`ChannelListener`] over `sqlx::postgres::PgListener`.
pub struct PgChannelListener {
    pool: PgPool,
    schema: Option<String>,
    inner: Option<PgListener>,
    listened: HashSet<String>,
}

impl std::fmt::Debug for PgChannelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgChannelListener")
            .field("schema", &self.schema)
            .field("connected", &self.inner.is_some())
            .field("listened", &self.listened.len())
            .finish()
    }
}

impl PgChannelListener {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: None,
            inner: None,
            listened: HashSet::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_some()
    }

    /// Topics currently listened on this session.
    pub fn listened_topics(&self) -> Vec<String> {
        self.listened.iter().cloned().collect()
    }

    fn schema(&self) -> Result<&str> {
        self.schema.as_deref().ok_or(NotifyError::NotConnected)
    }

    fn translate(&self, n: PgNotification) -> NotificationEvent {
        let schema = self.schema.as_deref().unwrap_or_default();
        NotificationEvent {
            topic: strip_schema(schema, n.channel()).to_string(),
            payload: n.payload().to_string(),
        }
    }
}

#[async_trait]
impl ChannelListener for PgChannelListener {
    async fn connect(&mut self) -> Result<()> {
        if self.inner.is_some() {
            return Ok(());
        }
        let schema: String = sqlx::query_scalar("SELECT current_schema()::text")
            .fetch_one(&self.pool)
            .await?;
        let listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| NotifyError::Connection(e.to_string()))?;
        debug!(schema = %schema, "channel listener connected");
        self.schema = Some(schema);
        self.inner = Some(listener);
        self.listened.clear();
        Ok(())
    }

    async fn listen(&mut self, topic: &str) -> Result<()> {
        if self.listened.contains(topic) {
            return Ok(());
        }
        let channel = channel_name(self.schema()?, topic);
        let inner = self.inner.as_mut().ok_or(NotifyError::NotConnected)?;
        inner
            .listen(&channel)
            .await
            .map_err(|e| NotifyError::Listen {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        self.listened.insert(topic.to_string());
        debug!(topic = %topic, channel = %channel, "LISTEN registered");
        Ok(())
    }

    async fn unlisten(&mut self, topic: &str) -> Result<()> {
        if !self.listened.contains(topic) {
            return Ok(());
        }
        let channel = channel_name(self.schema()?, topic);
        let inner = self.inner.as_mut().ok_or(NotifyError::NotConnected)?;
        inner.unlisten(&channel).await?;
        self.listened.remove(topic);
        debug!(topic = %topic, "UNLISTEN issued");
        Ok(())
    }

    async fn recv(&mut self, cancel: &CancellationToken) -> Result<NotificationEvent> {
        loop {
            let inner = self.inner.as_mut().ok_or(NotifyError::NotConnected)?;
            let received = tokio::select! {
                _ = cancel.cancelled() => return Err(NotifyError::Cancelled),
                r = inner.try_recv() => r,
            };
            match received {
                Ok(Some(n)) => {
                    let event = self.translate(n);
                    // the ping probe is session-internal traffic
                    if event.topic == PING_TOPIC {
                        continue;
                    }
                    return Ok(event);
                }
                // sqlx re-established the session under us; the LISTEN set on
                // the new session is not ours to trust, so report the gap and
                // let the owner re-register.
                Ok(None) => return Err(NotifyError::ConnectionLost),
                Err(e) => return Err(NotifyError::Database(e)),
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        let channel = channel_name(self.schema()?, PING_TOPIC);
        let inner = self.inner.as_mut().ok_or(NotifyError::NotConnected)?;
        inner.listen(&channel).await?;
        inner.unlisten(&channel).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut inner) = self.inner.take() {
            if self.listened.is_empty() {
                let _ = inner.unlisten_all().await;
            }
            // Dropping the PgListener hands the session back through sqlx,
            // which scrubs subscriptions (UNLISTEN *) before any reuse.
            drop(inner);
        }
        self.listened.clear();
        self.schema = None;
        Ok(())
    }
}
