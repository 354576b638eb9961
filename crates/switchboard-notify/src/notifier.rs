//! Topic subscription fan-out over a single LISTEN connection.
//!
//! One background loop owns the [`ChannelListener`]: it connects, replays
//! LISTEN for every registered topic, and then multiplexes between incoming
//! notifications, control commands, and shutdown. Subscribers never touch the
//! connection; registration while the loop is live is forwarded into it as a
//! command and answered synchronously, so a failed LISTEN is reported to the
//! caller with no partial subscription left behind.
//!
//! On any connection error the loop drops the session, reports `Unhealthy`,
//! sleeps with jittered exponential backoff, then reconnects and re-applies
//! the subscription map. Subscribers observe a delivery gap, never an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::NotifierConfig;
use crate::error::{NotifyError, Result};
use crate::listener::{ChannelListener, NotificationEvent};

/// Subscriber callback. Must not block: the notifier loop invokes it inline,
/// so implementations hand the payload off with a non-blocking send.
pub type NotifyFunc = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Observer for lifecycle/health transitions, for external monitoring.
pub type StatusObserver = Arc<dyn Fn(NotifierStatus) + Send + Sync>;

/// Lifecycle states reported to the [`StatusObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierStatus {
    Initializing,
    Healthy,
    Unhealthy,
    ShuttingDown,
    Stopped,
}

/// Commands forwarded into the background loop.
enum LoopCommand {
    /// Register a DB-level LISTEN; replied to synchronously so the caller
    /// learns about registration failures.
    Listen {
        topic: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Drop a DB-level LISTEN; fire-and-forget.
    Unlisten { topic: String },
}

type SubscriptionMap = HashMap<String, Vec<(u64, NotifyFunc)>>;

struct NotifierInner {
    config: NotifierConfig,
    subscriptions: Mutex<SubscriptionMap>,
    command_tx: mpsc::Sender<LoopCommand>,
    running: AtomicBool,
    next_sub_id: AtomicU64,
    observer: StatusObserver,
    cancel: CancellationToken,
}

impl NotifierInner {
    fn set_status(&self, status: NotifierStatus) {
        (self.observer)(status);
    }

    async fn fan_out(&self, event: &NotificationEvent) {
        let funcs: Vec<NotifyFunc> = {
            let subs = self.subscriptions.lock().await;
            match subs.get(&event.topic) {
                Some(list) => list.iter().map(|(_, f)| Arc::clone(f)).collect(),
                None => return,
            }
        };
        debug!(
            topic = %event.topic,
            subscribers = funcs.len(),
            "dispatching notification"
        );
        for func in funcs {
            func(&event.topic, &event.payload);
        }
    }
}

/// Fan-out hub for Postgres notifications.
///
/// Cheap to share via the [`Subscription`] handles it returns; the notifier
/// itself is typically owned by the component that composes it (the
/// invocation manager).
pub struct Notifier {
    inner: Arc<NotifierInner>,
    listener: std::sync::Mutex<Option<Box<dyn ChannelListener>>>,
    command_rx: std::sync::Mutex<Option<mpsc::Receiver<LoopCommand>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("running", &self.inner.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl Notifier {
    pub fn new(listener: Box<dyn ChannelListener>, config: NotifierConfig) -> Self {
        Self::with_observer(listener, config, Arc::new(|_| {}))
    }

    /// Build a notifier that reports lifecycle transitions to `observer`.
    pub fn with_observer(
        listener: Box<dyn ChannelListener>,
        config: NotifierConfig,
        observer: StatusObserver,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
        Self {
            inner: Arc::new(NotifierInner {
                config,
                subscriptions: Mutex::new(HashMap::new()),
                command_tx,
                running: AtomicBool::new(false),
                next_sub_id: AtomicU64::new(1),
                observer,
                cancel: CancellationToken::new(),
            }),
            listener: std::sync::Mutex::new(Some(listener)),
            command_rx: std::sync::Mutex::new(Some(command_rx)),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the background loop. A second call while running is a no-op;
    /// a call after [`stop`](Self::stop) reports `NotifierStopped`.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = {
            let mut slot = self
                .listener
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            slot.take()
        };
        let command_rx = {
            let mut slot = self
                .command_rx
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            slot.take()
        };
        let (Some(listener), Some(command_rx)) = (listener, command_rx) else {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(NotifyError::NotifierStopped);
        };
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(run_loop(inner, listener, command_rx));
        // only the start() that won the running swap reaches this store
        if let Ok(mut handle) = self.handle.try_lock() {
            *handle = Some(task);
        }
        Ok(())
    }

    /// Register a callback for `topic`.
    ///
    /// When the loop is running and this is the first subscriber for the
    /// topic, the DB-level LISTEN is issued synchronously; its failure is
    /// returned here and nothing is registered. Additional subscribers for an
    /// already-listened topic involve no database round-trip. When the loop
    /// has not started yet, registration succeeds and is replayed at connect
    /// time — notifications sent before then are simply not delivered.
    pub async fn listen(&self, topic: &str, func: NotifyFunc) -> Result<Subscription> {
        let first = {
            let subs = self.inner.subscriptions.lock().await;
            !subs.contains_key(topic)
        };
        if first && self.is_running() {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.inner
                .command_tx
                .send(LoopCommand::Listen {
                    topic: topic.to_string(),
                    reply: reply_tx,
                })
                .await
                .map_err(|_| NotifyError::NotifierStopped)?;
            reply_rx.await.map_err(|_| NotifyError::NotifierStopped)??;
        }
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.inner.subscriptions.lock().await;
        subs.entry(topic.to_string())
            .or_default()
            .push((id, Arc::clone(&func)));
        Ok(Subscription {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            id,
        })
    }

    /// Stop the loop and release the listener. Idempotent.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let task = self.handle.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "notifier loop join failed");
            }
        }
    }
}

/// Handle to one registered subscription.
pub struct Subscription {
    inner: Arc<NotifierInner>,
    topic: String,
    id: u64,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove this subscription. Idempotent; the DB-level UNLISTEN fires only
    /// when the topic loses its last subscriber, and is best-effort.
    pub async fn unlisten(&self) -> Result<()> {
        let mut subs = self.inner.subscriptions.lock().await;
        let Some(list) = subs.get_mut(&self.topic) else {
            return Ok(());
        };
        let Some(pos) = list.iter().position(|(id, _)| *id == self.id) else {
            return Ok(());
        };
        list.remove(pos);
        if list.is_empty() {
            subs.remove(&self.topic);
            if self.inner.running.load(Ordering::SeqCst) {
                let _ = self.inner.command_tx.try_send(LoopCommand::Unlisten {
                    topic: self.topic.clone(),
                });
            }
        }
        Ok(())
    }
}

async fn run_loop(
    inner: Arc<NotifierInner>,
    mut listener: Box<dyn ChannelListener>,
    mut command_rx: mpsc::Receiver<LoopCommand>,
) {
    inner.set_status(NotifierStatus::Initializing);
    let mut backoff = ExponentialBackoff::new(
        inner.config.backoff_floor,
        inner.config.backoff_ceiling,
        inner.config.backoff_reset_after,
    );
    let mut first_connect = true;

    'outer: loop {
        if inner.cancel.is_cancelled() {
            break;
        }
        let _ = listener.close().await;
        match connect_and_replay(&inner, listener.as_mut()).await {
            Ok(()) => {
                backoff.reset();
                if first_connect {
                    info!("notifier connected");
                    first_connect = false;
                } else {
                    info!("notifier reconnected");
                }
                inner.set_status(NotifierStatus::Healthy);
            }
            Err(e) => {
                inner.set_status(NotifierStatus::Unhealthy);
                let delay = backoff.next_delay();
                let delay_ms = delay.as_millis();
                warn!(error = %e, delay_ms, "notifier connect failed, backing off");
                if backoff_wait(&inner, &mut command_rx, delay).await {
                    break 'outer;
                }
                continue 'outer;
            }
        }

        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => break 'outer,

                command = command_rx.recv() => match command {
                    Some(command) => apply_command(listener.as_mut(), command).await,
                    // every sender gone: the notifier itself was dropped
                    None => break 'outer,
                },

                event = listener.recv(&inner.cancel) => match event {
                    Ok(event) => inner.fan_out(&event).await,
                    Err(NotifyError::Cancelled) => break 'outer,
                    Err(e) => {
                        inner.set_status(NotifierStatus::Unhealthy);
                        let delay = backoff.next_delay();
                        let delay_ms = delay.as_millis();
                        warn!(error = %e, delay_ms, "notification wait failed, backing off");
                        if backoff_wait(&inner, &mut command_rx, delay).await {
                            break 'outer;
                        }
                        continue 'outer;
                    }
                },
            }
        }
    }

    inner.set_status(NotifierStatus::ShuttingDown);
    if let Err(e) = listener.close().await {
        debug!(error = %e, "listener close failed during shutdown");
    }
    inner.running.store(false, Ordering::SeqCst);
    inner.set_status(NotifierStatus::Stopped);
}

/// Connect the listener and re-issue LISTEN for every registered topic.
async fn connect_and_replay(
    inner: &Arc<NotifierInner>,
    listener: &mut dyn ChannelListener,
) -> Result<()> {
    listener.connect().await?;
    let topics: Vec<String> = {
        let subs = inner.subscriptions.lock().await;
        subs.keys().cloned().collect()
    };
    for topic in topics {
        listener.listen(&topic).await?;
    }
    Ok(())
}

/// Handle one control command on the live connection.
async fn apply_command(listener: &mut dyn ChannelListener, command: LoopCommand) {
    match command {
        LoopCommand::Listen { topic, reply } => {
            let result = listener.listen(&topic).await;
            if let Err(e) = &result {
                warn!(topic = %topic, error = %e, "LISTEN registration failed");
            }
            let _ = reply.send(result);
        }
        LoopCommand::Unlisten { topic } => {
            if let Err(e) = listener.unlisten(&topic).await {
                debug!(topic = %topic, error = %e, "UNLISTEN failed");
            }
        }
    }
}

/// Sleep out a backoff window, still answering commands so registration
/// attempts fail fast instead of hanging. Returns true when cancelled.
async fn backoff_wait(
    inner: &Arc<NotifierInner>,
    command_rx: &mut mpsc::Receiver<LoopCommand>,
    delay: std::time::Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return true,
            _ = &mut sleep => return false,
            command = command_rx.recv() => match command {
                Some(LoopCommand::Listen { reply, .. }) => {
                    let _ = reply.send(Err(NotifyError::NotConnected));
                }
                Some(LoopCommand::Unlisten { .. }) => {}
                None => return true,
            },
        }
    }
}
