//! Pool event bus.
//!
//! Components report what happens to workers by sending an [`Event`] to a
//! shared [`EventBus`]. Subscribers register a pattern over the
//! `"{source}.{event_type}"` key together with an `mpsc` sender; delivery
//! never blocks the sender, a full subscriber queue simply misses the event.
//!
//! Patterns:
//! - `"*"` matches everything
//! - `"worker_watcher.*"` matches by prefix, `"*.worker_error"` by suffix
//! - `"pool.no_free_workers"` matches exactly
//!
//! Matching ignores case.

use std::collections::HashMap;
use std::fmt;

use drover_core::{DroverError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Event source used by the worker watcher.
pub const SOURCE_WATCHER: &str = "worker_watcher";
/// Event source used by the pool facade.
pub const SOURCE_POOL: &str = "pool";
/// Event source used by the supervisor.
pub const SOURCE_SUPERVISOR: &str = "supervisor";

/// Kind of pool event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A worker was allocated and released into the pool
    WorkerConstruct,
    /// A worker marked for destruction exited
    WorkerDestruct,
    /// A worker exited and could not be replaced
    WorkerProcessExit,
    /// A checkout timed out waiting for an idle worker
    NoFreeWorkers,
    /// A worker outlived its ttl
    Ttl,
    /// A worker was idle for too long
    IdleTtl,
    /// A worker was busy for too long
    ExecTtl,
    /// Allocating a worker failed
    WorkerError,
    /// Waiting on a worker process reported an abnormal exit
    WorkerWaitExit,
    /// A worker was stopped on request
    WorkerStopped,
    /// The supervisor could not act on a worker
    SupervisorError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkerConstruct => "worker_construct",
            EventType::WorkerDestruct => "worker_destruct",
            EventType::WorkerProcessExit => "worker_process_exit",
            EventType::NoFreeWorkers => "no_free_workers",
            EventType::Ttl => "ttl",
            EventType::IdleTtl => "idle_ttl",
            EventType::ExecTtl => "exec_ttl",
            EventType::WorkerError => "worker_error",
            EventType::WorkerWaitExit => "worker_wait_exit",
            EventType::WorkerStopped => "worker_stopped",
            EventType::SupervisorError => "supervisor_error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single pool event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub source: String,
    pub message: String,
}

impl Event {
    pub fn new(
        event_type: EventType,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            source: source.into(),
            message: message.into(),
        }
    }

    /// Routing key, `"{source}.{event_type}"`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.source, self.event_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Exact(String),
    Wildcard { prefix: String, suffix: String },
}

impl Matcher {
    fn parse(pattern: &str) -> Result<Self> {
        let lowered = pattern.to_lowercase();
        match lowered.matches('*').count() {
            0 => {
                if lowered.matches('.').count() != 1 {
                    return Err(DroverError::invalid_pattern(
                        pattern,
                        "expected `source.event` or a single `*` wildcard",
                    ));
                }
                Ok(Matcher::Exact(lowered))
            }
            1 => {
                let (prefix, suffix) = lowered
                    .split_once('*')
                    .ok_or_else(|| DroverError::internal("wildcard pattern without `*`"))?;
                Ok(Matcher::Wildcard {
                    prefix: prefix.to_string(),
                    suffix: suffix.to_string(),
                })
            }
            _ => Err(DroverError::invalid_pattern(
                pattern,
                "only one `*` wildcard is allowed",
            )),
        }
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            Matcher::Exact(exact) => exact == key,
            Matcher::Wildcard { prefix, suffix } => {
                key.len() >= prefix.len() + suffix.len()
                    && key.starts_with(prefix.as_str())
                    && key.ends_with(suffix.as_str())
            }
        }
    }
}

#[derive(Debug)]
struct Subscription {
    pattern: String,
    matcher: Matcher,
    tx: mpsc::Sender<Event>,
}

/// Publish/subscribe hub for pool events.
///
/// Constructed explicitly and shared as `Arc<EventBus>`.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Subscription>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tx` under subscriber `id` for events matching `pattern`.
    ///
    /// One id may hold several patterns; it still receives each event at
    /// most once.
    pub fn subscribe(&self, id: &str, pattern: &str, tx: mpsc::Sender<Event>) -> Result<()> {
        let matcher = Matcher::parse(pattern)?;
        self.subscribers
            .write()
            .entry(id.to_string())
            .or_default()
            .push(Subscription {
                pattern: pattern.to_string(),
                matcher,
                tx,
            });
        debug!(subscriber = id, pattern, "event subscription added");
        Ok(())
    }

    /// Register `tx` under `id` for every event.
    pub fn subscribe_all(&self, id: &str, tx: mpsc::Sender<Event>) -> Result<()> {
        self.subscribe(id, "*", tx)
    }

    /// Drop every subscription held by `id`.
    pub fn unsubscribe(&self, id: &str) {
        if self.subscribers.write().remove(id).is_some() {
            debug!(subscriber = id, "event subscriber removed");
        }
    }

    /// Drop the subscription of `id` registered with exactly `pattern`.
    pub fn unsubscribe_pattern(&self, id: &str, pattern: &str) {
        let mut subscribers = self.subscribers.write();
        if let Some(subs) = subscribers.get_mut(id) {
            subs.retain(|s| s.pattern != pattern);
            if subs.is_empty() {
                subscribers.remove(id);
            }
        }
    }

    /// Deliver `event` to every matching subscriber without blocking.
    pub fn send(&self, event: Event) {
        let key = event.key().to_lowercase();
        debug!(
            event_type = %event.event_type,
            source = %event.source,
            message = %event.message,
            "pool event"
        );

        let subscribers = self.subscribers.read();
        for (id, subs) in subscribers.iter() {
            let Some(sub) = subs.iter().find(|s| s.matcher.matches(&key)) else {
                continue;
            };
            if sub.tx.try_send(event.clone()).is_err() {
                debug!(
                    subscriber = %id,
                    key = %key,
                    "event dropped, subscriber queue full or closed"
                );
            }
        }
    }

    /// Number of subscriber ids.
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
