//! Invocation manager: durable rows + ephemeral wake-ups.
//!
//! Producers insert a row and fire a NOTIFY carrying the queue id; consumers
//! long-polling that queue wake via the dispatcher and re-run the claim
//! query. The claim is always retried after a wake regardless of why the wait
//! returned — notification, timeout, spurious — because notifications are
//! hints, not deliveries. Synchronous callers subscribe to the response topic
//! *before* their row becomes visible, closing the race against a consumer
//! that finishes before the caller starts waiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use switchboard_notify::{Dispatcher, DispatcherConfig, Notifier, Subscription};

use crate::error::{CoreError, Result};
use crate::invocation::{parse_invocation_id, Invocation, NewInvocation};
use crate::store::InvocationStore;

/// Topic announcing a newly-available invocation; payload is the queue id.
pub const INVOKE_TOPIC: &str = "invocation_ready";
/// Topic announcing a finished invocation; payload is the invocation id.
pub const RESPONSE_TOPIC: &str = "invocation_response";

/// Tunables for the manager's blocking operations.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Wait applied to `execute_invocation_sync` when the caller passes none
    pub default_sync_wait: Duration,
    /// Wait applied to `get_next_invocation` when the caller passes none
    pub default_poll_wait: Duration,
    /// Upper clamp for both waits
    pub max_wait: Duration,
    /// Buffer for the sync caller's response-notification channel
    pub response_buffer: usize,
    /// Dispatcher channel sizing
    pub dispatcher: DispatcherConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_sync_wait: Duration::from_secs(10),
            default_poll_wait: Duration::from_secs(30),
            max_wait: Duration::from_secs(60),
            response_buffer: 32,
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Resolve a caller-supplied wait into the clamped window.
    fn clamp_wait(&self, wait_secs: Option<u64>, default: Duration) -> Duration {
        match wait_secs {
            Some(secs) => Duration::from_secs(secs).min(self.max_wait),
            None => default.min(self.max_wait),
        }
    }
}

/// Outcome of a synchronous execution.
#[derive(Debug)]
pub enum SyncOutcome {
    /// The invocation reached a terminal state within the deadline; the row
    /// carries state, result, and errors.
    Finished(Invocation),
    /// Deadline expired with the invocation still pending. Not an error: the
    /// row is untouched and the caller may poll `get_invocation` or retry.
    TimedOut { invocation_id: String },
}

impl SyncOutcome {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, SyncOutcome::TimedOut { .. })
    }
}

/// Composes the notifier, dispatcher, and store into the invocation API.
pub struct InvocationManager<S: InvocationStore> {
    store: Arc<S>,
    notifier: Notifier,
    dispatcher: Arc<Dispatcher<String>>,
    config: ManagerConfig,
    invoke_sub: Mutex<Option<Subscription>>,
    closed: AtomicBool,
}

impl<S: InvocationStore> std::fmt::Debug for InvocationManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationManager")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<S: InvocationStore> InvocationManager<S> {
    pub fn new(store: Arc<S>, notifier: Notifier, config: ManagerConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(config.dispatcher.clone()));
        Self {
            store,
            notifier,
            dispatcher,
            config,
            invoke_sub: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe the invoke topic into the dispatcher and start the notifier.
    pub async fn start(&self) -> Result<()> {
        self.ensure_open()?;
        let dispatcher = Arc::clone(&self.dispatcher);
        let sub = self
            .notifier
            .listen(
                INVOKE_TOPIC,
                Arc::new(move |_topic: &str, payload: &str| {
                    // non-blocking by construction; a full buffer just drops
                    // the hint and the poll loop's claim query catches up
                    if let Err(e) = dispatcher.dispatch(payload, payload.to_string()) {
                        debug!(error = %e, "invoke dispatch after shutdown ignored");
                    }
                }),
            )
            .await?;
        *self.invoke_sub.lock().await = Some(sub);
        self.notifier.start()?;
        info!("invocation manager started");
        Ok(())
    }

    /// Insert an invocation for `agent` and wake one long-poller on its
    /// queue. Returns the new invocation's external id.
    pub async fn insert_invocation<M, P>(
        &self,
        caller_actor_id: &str,
        agent: &str,
        metadata: &M,
        payload: &P,
    ) -> Result<String>
    where
        M: Serialize + ?Sized + Sync,
        P: Serialize + ?Sized + Sync,
    {
        let invocation = self
            .insert_row(caller_actor_id, agent, metadata, payload)
            .await?;
        Ok(invocation.external_id())
    }

    /// Insert an invocation and block until it finishes or the deadline
    /// expires (`wait_secs` clamped to `[0, max_wait]`, default 10s).
    ///
    /// The response subscription is registered before the row is inserted and
    /// released on every exit path.
    pub async fn execute_invocation_sync<M, P>(
        &self,
        caller_actor_id: &str,
        agent: &str,
        metadata: &M,
        payload: &P,
        wait_secs: Option<u64>,
    ) -> Result<SyncOutcome>
    where
        M: Serialize + ?Sized + Sync,
        P: Serialize + ?Sized + Sync,
    {
        self.ensure_open()?;
        let budget = self
            .config
            .clamp_wait(wait_secs, self.config.default_sync_wait);

        let (tx, mut rx) = mpsc::channel::<String>(self.config.response_buffer);
        let sub = self
            .notifier
            .listen(
                RESPONSE_TOPIC,
                Arc::new(move |_topic: &str, payload: &str| {
                    let _ = tx.try_send(payload.to_string());
                }),
            )
            .await?;

        let outcome = self
            .run_sync(caller_actor_id, agent, metadata, payload, budget, &mut rx)
            .await;
        if let Err(e) = sub.unlisten().await {
            debug!(error = %e, "response unlisten failed");
        }
        outcome
    }

    async fn run_sync<M, P>(
        &self,
        caller_actor_id: &str,
        agent: &str,
        metadata: &M,
        payload: &P,
        budget: Duration,
        rx: &mut mpsc::Receiver<String>,
    ) -> Result<SyncOutcome>
    where
        M: Serialize + ?Sized + Sync,
        P: Serialize + ?Sized + Sync,
    {
        let invocation = self
            .insert_row(caller_actor_id, agent, metadata, payload)
            .await?;
        let external_id = invocation.external_id();
        let deadline = Instant::now() + budget;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(SyncOutcome::TimedOut {
                    invocation_id: external_id,
                });
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(signalled_id)) if signalled_id == external_id => {
                    // the signal is a hint too: confirm against the row
                    match self.store.get(invocation.id).await? {
                        Some(row) if row.state.is_terminal() => {
                            return Ok(SyncOutcome::Finished(row))
                        }
                        _ => continue,
                    }
                }
                // response for some other invocation
                Ok(Some(_)) => continue,
                Ok(None) => return Err(CoreError::Closed),
                Err(_) => {
                    return Ok(SyncOutcome::TimedOut {
                        invocation_id: external_id,
                    })
                }
            }
        }
    }

    /// Long-poll the next invocation for a queue, claiming it atomically.
    ///
    /// `wait_secs` is clamped to `[0, max_wait]`, default 30s. `Ok(None)`
    /// when the budget expires with nothing claimable.
    pub async fn get_next_invocation(
        &self,
        caller_actor_id: &str,
        queue_id: i64,
        wait_secs: Option<u64>,
    ) -> Result<Option<Invocation>> {
        self.ensure_open()?;
        let key = queue_id.to_string();
        self.dispatcher.listen(&key)?;

        let budget = self
            .config
            .clamp_wait(wait_secs, self.config.default_poll_wait);
        let deadline = Instant::now() + budget;

        loop {
            if let Some(invocation) = self.store.claim_next(queue_id, caller_actor_id).await? {
                debug!(
                    invocation_id = invocation.id,
                    queue_id,
                    claimant = %caller_actor_id,
                    "invocation claimed"
                );
                return Ok(Some(invocation));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // wake reason is irrelevant; the claim query above is the truth
            self.dispatcher.wait_for(&key, remaining).await?;
        }
    }

    /// Record a successful result for a running invocation.
    ///
    /// `Ok(None)` when nothing matched — unparseable id, unknown row, not
    /// running, or a different claimant — so duplicate and late returns are
    /// harmless.
    pub async fn return_invocation_response<R>(
        &self,
        external_id: &str,
        caller_actor_id: &str,
        result: &R,
    ) -> Result<Option<Invocation>>
    where
        R: Serialize + ?Sized + Sync,
    {
        let Some(id) = parse_invocation_id(external_id) else {
            return Ok(None);
        };
        let value = serde_json::to_value(result)?;
        let updated = self.store.complete(id, caller_actor_id, value).await?;
        if let Some(invocation) = &updated {
            self.notify_response(invocation).await;
        }
        Ok(updated)
    }

    /// Record a failure for a running invocation; same matching rules as
    /// [`return_invocation_response`](Self::return_invocation_response).
    pub async fn return_invocation_error<E>(
        &self,
        external_id: &str,
        caller_actor_id: &str,
        errors: &E,
    ) -> Result<Option<Invocation>>
    where
        E: Serialize + ?Sized + Sync,
    {
        let Some(id) = parse_invocation_id(external_id) else {
            return Ok(None);
        };
        let value = serde_json::to_value(errors)?;
        let updated = self.store.discard(id, caller_actor_id, value).await?;
        if let Some(invocation) = &updated {
            self.notify_response(invocation).await;
        }
        Ok(updated)
    }

    /// Fetch an invocation by external id.
    pub async fn get_invocation(&self, external_id: &str) -> Result<Option<Invocation>> {
        let Some(id) = parse_invocation_id(external_id) else {
            return Ok(None);
        };
        self.store.get(id).await
    }

    /// Shut down: release the invoke subscription, close the dispatcher,
    /// stop the notifier. Best-effort at every step; in-flight long-polls
    /// unblock promptly with a closed error.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sub) = self.invoke_sub.lock().await.take() {
            if let Err(e) = sub.unlisten().await {
                debug!(error = %e, "invoke unlisten failed during close");
            }
        }
        self.dispatcher.close();
        self.notifier.stop().await;
        info!("invocation manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        Ok(())
    }

    /// Validate, marshal, insert, and fire the invoke-topic hint.
    async fn insert_row<M, P>(
        &self,
        caller_actor_id: &str,
        agent: &str,
        metadata: &M,
        payload: &P,
    ) -> Result<Invocation>
    where
        M: Serialize + ?Sized + Sync,
        P: Serialize + ?Sized + Sync,
    {
        self.ensure_open()?;
        let metadata = serde_json::to_value(metadata)?;
        let payload = serde_json::to_value(payload)?;
        ensure_metadata(&metadata)?;

        let agent = self
            .store
            .find_agent(agent)
            .await?
            .ok_or_else(|| CoreError::UnknownAgent(agent.to_string()))?;

        let invocation = self
            .store
            .insert(NewInvocation::new(
                agent.queue_id,
                caller_actor_id,
                metadata,
                payload,
            ))
            .await?;

        // best-effort: a lost hint only costs latency, pollers still claim
        if let Err(e) = self
            .store
            .notify(INVOKE_TOPIC, &invocation.queue_id.to_string())
            .await
        {
            warn!(
                invocation_id = invocation.id,
                error = %e,
                "invoke notification failed"
            );
        }
        Ok(invocation)
    }

    async fn notify_response(&self, invocation: &Invocation) {
        if let Err(e) = self
            .store
            .notify(RESPONSE_TOPIC, &invocation.id.to_string())
            .await
        {
            warn!(
                invocation_id = invocation.id,
                error = %e,
                "response notification failed"
            );
        }
    }
}

/// Metadata must be a non-empty JSON object; it carries the correlation and
/// tracing context every invocation is required to have.
fn ensure_metadata(metadata: &Value) -> Result<()> {
    match metadata.as_object() {
        Some(map) if !map.is_empty() => Ok(()),
        _ => Err(CoreError::InvalidInput(
            "metadata must be a non-empty JSON object".to_string(),
        )),
    }
}
