//! Periodic worker supervision.
//!
//! Every `watch_tick` the supervisor walks the roster and retires workers
//! that exceeded one of the configured limits:
//!
//! | Limit      | Applies to          | Action                                   |
//! |------------|---------------------|------------------------------------------|
//! | `ttl`      | `Ready` / `Working` | remove idle worker, invalidate busy one  |
//! | `idle_ttl` | `Ready`             | remove                                   |
//! | `exec_ttl` | `Working`           | invalidate and kill                      |
//!
//! Removed workers are replaced by their lifecycle task. Invalidated busy
//! workers are killed when they are checked back in. A zero limit disables
//! the check.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use drover_core::SupervisorConfig;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::{Event, EventBus, EventType, SOURCE_SUPERVISOR};
use crate::state::WorkerState;
use crate::watcher::WorkerWatcher;
use crate::worker::Worker;

/// Handle to a running supervisor task.
#[derive(Debug)]
pub struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Start supervising the roster of `watcher`.
    pub fn spawn(config: SupervisorConfig, watcher: WorkerWatcher, events: Arc<EventBus>) -> Self {
        let cancel = CancellationToken::new();
        let control = Control {
            config,
            watcher,
            events,
        };

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let tick = control.config.watch_tick;
            let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(watch_tick = ?tick, "supervisor started");

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => control.tick(Utc::now()),
                }
            }
            debug!("supervisor stopped");
        });

        Self { cancel, task }
    }

    /// Stop the supervisor and wait for its task to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

struct Control {
    config: SupervisorConfig,
    watcher: WorkerWatcher,
    events: Arc<EventBus>,
}

impl Control {
    fn tick(&self, now: DateTime<Utc>) {
        for worker in self.watcher.list() {
            let state = worker.state().get();
            if state == WorkerState::Invalid || state.is_terminal() {
                continue;
            }

            if exceeded(self.config.ttl, worker.created_at(), now) {
                match state {
                    WorkerState::Ready => self.retire(&worker, EventType::Ttl),
                    WorkerState::Working => {
                        if worker
                            .state()
                            .transition(WorkerState::Working, WorkerState::Invalid)
                        {
                            self.emit(
                                EventType::Ttl,
                                &worker,
                                "ttl reached, invalidated while working",
                            );
                        }
                    }
                    _ => {}
                }
                continue;
            }

            let last_used = worker.state().last_used();
            if state == WorkerState::Ready && exceeded(self.config.idle_ttl, last_used, now) {
                self.retire(&worker, EventType::IdleTtl);
                continue;
            }

            if state == WorkerState::Working && exceeded(self.config.exec_ttl, last_used, now) {
                if worker.state().transition(WorkerState::Working, WorkerState::Invalid) {
                    worker.kill();
                    self.emit(EventType::ExecTtl, &worker, "exec ttl reached, killed");
                }
            }
        }
    }

    fn retire(&self, worker: &Worker, reason: EventType) {
        if self.watcher.remove(worker) {
            self.emit(reason, worker, "limit reached, removed");
        } else {
            self.emit(EventType::SupervisorError, worker, "worker already gone from roster");
        }
    }

    fn emit(&self, event_type: EventType, worker: &Worker, message: &str) {
        self.events.send(Event::new(
            event_type,
            SOURCE_SUPERVISOR,
            format!("{message}, pid: {}", worker.pid()),
        ));
    }
}

fn exceeded(limit: Duration, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if limit.is_zero() {
        return false;
    }
    (now - since).to_std().unwrap_or_default() >= limit
}
