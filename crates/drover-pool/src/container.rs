//! Bounded idle-worker container.
//!
//! Idle workers live in a FIFO buffer guarded by a short-lived mutex. A
//! semaphore counts buffered workers so that [`Container::pop`] can wait
//! without holding the lock; each successful pop consumes one permit and
//! each buffered push adds one.
//!
//! When the buffer is full, [`Container::push`] evicts at most one worker
//! that is neither `Ready` nor `Working`. The scan visits every buffered
//! worker once and always terminates.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use drover_core::{DroverError, Result};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::state::WorkerState;
use crate::worker::Worker;

/// Bounded buffer of idle workers.
#[derive(Debug)]
pub struct Container {
    capacity: usize,
    workers: Mutex<VecDeque<Arc<Worker>>>,
    available: Semaphore,
    destroyed: AtomicBool,
}

impl Container {
    /// Create an empty container holding at most `capacity` workers.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            workers: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Semaphore::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Buffer an idle worker. Never blocks.
    pub fn push(&self, worker: Arc<Worker>) {
        if self.is_destroyed() {
            trace!(pid = worker.pid(), "container destroyed, not buffering worker");
            return;
        }

        let mut workers = self.workers.lock();
        if workers.len() < self.capacity {
            workers.push_back(worker);
            drop(workers);
            self.available.add_permits(1);
            return;
        }

        // Full: look for one worker that should not be here.
        for _ in 0..workers.len() {
            let Some(candidate) = workers.pop_front() else {
                break;
            };
            match candidate.state().get() {
                WorkerState::Ready | WorkerState::Working => workers.push_back(candidate),
                state => {
                    debug!(
                        evicted = candidate.pid(),
                        state = %state,
                        incoming = worker.pid(),
                        "evicting worker from full container"
                    );
                    candidate.kill();
                    workers.push_back(worker);
                    return;
                }
            }
        }
        drop(workers);

        debug!(pid = worker.pid(), "container full, discarding incoming worker");
        worker.state().set(WorkerState::Invalid);
        worker.kill();
    }

    /// Wait for an idle worker.
    ///
    /// Returns [`DroverError::Cancelled`] if `cancel` fires first and
    /// [`DroverError::PoolStopped`] once the container is destroyed. A
    /// destroyed container drops whatever it still buffers.
    pub async fn pop(&self, cancel: &CancellationToken) -> Result<Arc<Worker>> {
        if self.is_destroyed() {
            self.drain();
            return Err(DroverError::PoolStopped);
        }

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DroverError::Cancelled),
            permit = self.available.acquire() => permit,
        };

        match permit {
            Ok(permit) => {
                permit.forget();
                self.workers.lock().pop_front().ok_or(DroverError::PoolStopped)
            }
            Err(_closed) => {
                self.drain();
                Err(DroverError::PoolStopped)
            }
        }
    }

    /// No-op: workers are only ever removed by popping them.
    pub fn remove(&self, _pid: u32) {}

    /// Switch to drain mode and wake every blocked [`pop`](Self::pop).
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.available.close();
        debug!(buffered = self.len(), "container destroyed");
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Number of buffered workers.
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn drain(&self) {
        self.workers.lock().clear();
    }
}
