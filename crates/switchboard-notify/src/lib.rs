//! # Switchboard Notify
//!
//! The wake-up plumbing underneath the Switchboard execution core: Postgres
//! LISTEN/NOTIFY multiplexed to any number of in-process subscribers, plus a
//! generic id-keyed dispatcher that turns notifications into bounded waits.
//!
//! ## Components
//!
//! - [`ChannelListener`] / [`PgChannelListener`]: one dedicated database
//!   connection used for LISTEN/UNLISTEN and blocking notification waits.
//!   Channel names are namespaced by the active schema so tenants sharing a
//!   cluster never cross signals.
//! - [`Notifier`]: owns the listener, maintains topic subscriptions, and runs
//!   the single background loop that reconnects with backoff and fans each
//!   notification out to every subscriber of its topic.
//! - [`Dispatcher`]: concurrency-safe map of id → bounded channel. Converts
//!   "a notification arrived for id X" into "one waiter blocked on X wakes
//!   up". A wake-up hint, not a queue: payloads are dropped when nobody is
//!   listening or buffers are full, and consumers re-query ground truth.
//!
//! Notifications are a latency optimization only. Durable state lives in the
//! relational store; every consumer falls back to polling it on a deadline.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod notifier;
pub mod testing;

pub use backoff::ExponentialBackoff;
pub use config::{DispatcherConfig, NotifierConfig};
pub use dispatcher::Dispatcher;
pub use error::{NotifyError, Result};
pub use listener::{ChannelListener, NotificationEvent, PgChannelListener};
pub use notifier::{Notifier, NotifierStatus, NotifyFunc, StatusObserver, Subscription};
