//! Worker watcher.
//!
//! The [`WorkerWatcher`] owns the authoritative roster of live workers and
//! the idle [`Container`]. It hands out idle workers ([`WorkerWatcher::take`]),
//! takes them back ([`WorkerWatcher::release`]), and runs one lifecycle task
//! per worker that replaces the worker when its process exits.
//!
//! ## Reset and destroy
//!
//! Both start by destroying the current container so nothing new is handed
//! out, then wait until the roster is back at its target size with no worker
//! mid-request. Every worker is then marked [`WorkerState::Destroyed`] and
//! killed; the lifecycle tasks see the mark and do not replace them. Reset
//! finally installs an empty roster and a fresh container.
//!
//! If the caller's token fires before the pool is quiet, the teardown is
//! forced anyway.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use drover_core::{DroverError, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::allocator::Allocator;
use crate::container::Container;
use crate::events::{Event, EventBus, EventType, SOURCE_WATCHER};
use crate::state::WorkerState;
use crate::worker::{Worker, WorkerInfo};

/// Delay between allocation retries.
pub const ALLOCATE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Poll interval while waiting for the roster to settle.
const QUIESCE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Called when the pool can no longer serve anything.
pub type FatalHandler = Arc<dyn Fn(&DroverError) + Send + Sync>;

struct Roster {
    workers: Vec<Arc<Worker>>,
    container: Arc<Container>,
}

enum Admission {
    Admitted,
    Surplus,
    Stopped,
}

struct Inner {
    roster: RwLock<Roster>,
    num_workers: AtomicU64,
    allocator: Arc<dyn Allocator>,
    allocate_timeout: Duration,
    events: Arc<EventBus>,
    events_id: String,
    destroyed: AtomicBool,
    on_fatal: RwLock<FatalHandler>,
}

/// Owner of the worker roster and the idle container.
///
/// Cheap to clone; clones share the same roster.
#[derive(Clone)]
pub struct WorkerWatcher {
    inner: Arc<Inner>,
}

impl WorkerWatcher {
    /// Create a watcher expecting `num_workers` workers.
    ///
    /// Workers are added with [`watch`](Self::watch).
    pub fn new(
        allocator: Arc<dyn Allocator>,
        num_workers: u64,
        allocate_timeout: Duration,
        events: Arc<EventBus>,
    ) -> Self {
        let capacity = usize::try_from(num_workers).unwrap_or(usize::MAX);
        Self {
            inner: Arc::new(Inner {
                roster: RwLock::new(Roster {
                    workers: Vec::with_capacity(capacity),
                    container: Arc::new(Container::new(capacity)),
                }),
                num_workers: AtomicU64::new(num_workers),
                allocator,
                allocate_timeout,
                events,
                events_id: uuid::Uuid::new_v4().to_string(),
                destroyed: AtomicBool::new(false),
                on_fatal: RwLock::new(Arc::new(default_fatal_handler)),
            }),
        }
    }

    /// Replace the handler invoked when no workers are left.
    ///
    /// The default logs the error and aborts the process.
    pub fn set_fatal_handler(&self, handler: impl Fn(&DroverError) + Send + Sync + 'static) {
        *self.inner.on_fatal.write() = Arc::new(handler);
    }

    /// Subscribe `tx` to bus events under this watcher's subscriber id.
    ///
    /// The subscription is dropped on [`destroy`](Self::destroy).
    pub fn subscribe(&self, pattern: &str, tx: mpsc::Sender<Event>) -> Result<()> {
        self.inner.events.subscribe(&self.inner.events_id, pattern, tx)
    }

    /// Start supervising `workers`: buffer them as idle and spawn their
    /// lifecycle tasks.
    pub fn watch(&self, workers: Vec<Arc<Worker>>) {
        for worker in workers {
            self.container().push(Arc::clone(&worker));
            self.inner.roster.write().workers.push(Arc::clone(&worker));
            self.spawn_lifecycle(worker);
        }
    }

    /// Take an idle `Ready` worker, waiting until one is available.
    ///
    /// Buffered workers in any other state are discarded (`Working` ones
    /// are put back). Fails with [`DroverError::Cancelled`] when `cancel`
    /// fires and [`DroverError::PoolStopped`] once the pool is torn down.
    pub async fn take(&self, cancel: &CancellationToken) -> Result<Arc<Worker>> {
        loop {
            let container = self.container();
            let worker = match container.pop(cancel).await {
                Ok(worker) => worker,
                Err(DroverError::PoolStopped) => {
                    // A completed reset swaps in a new container; wait on that one.
                    if !self.is_destroyed() && !Arc::ptr_eq(&container, &self.container()) {
                        continue;
                    }
                    return Err(DroverError::PoolStopped);
                }
                Err(e) => return Err(e),
            };

            match worker.state().get() {
                WorkerState::Ready => return Ok(worker),
                WorkerState::Working => {
                    container.push(worker);
                    tokio::task::yield_now().await;
                }
                state => {
                    debug!(pid = worker.pid(), state = %state, "discarding unusable idle worker");
                    worker.kill();
                }
            }
        }
    }

    /// Return a worker. `Ready` workers go back to the idle container;
    /// anything else is killed.
    pub fn release(&self, worker: Arc<Worker>) {
        match worker.state().get() {
            WorkerState::Ready => self.container().push(worker),
            state => {
                debug!(pid = worker.pid(), state = %state, "killing released worker");
                worker.kill();
            }
        }
    }

    /// Allocate one worker and add it to the pool.
    ///
    /// Failures are retried every [`ALLOCATE_RETRY_INTERVAL`] until the
    /// allocate timeout expires, at which point the target worker count is
    /// reduced by one.
    ///
    /// A worker that arrives after a reset, or when the roster is already at
    /// its target size, is killed instead of joining the pool.
    #[instrument(level = "debug", skip(self))]
    pub async fn allocate(&self) -> Result<()> {
        let container = self.container();
        let worker = match self.inner.allocator.allocate().await {
            Ok(worker) => worker,
            Err(e) => {
                self.emit(
                    EventType::WorkerError,
                    format!("failed to allocate worker: {e}"),
                );
                if self.inner.allocate_timeout.is_zero() {
                    return Err(DroverError::allocation_failed(e.to_string()));
                }
                self.allocate_with_retry().await?
            }
        };

        let pid = worker.pid();
        match self.admit(&container, &worker) {
            Admission::Admitted => {}
            Admission::Stopped => {
                destroy_all(&[worker]);
                return Err(DroverError::PoolStopped);
            }
            Admission::Surplus => {
                debug!(pid, "worker no longer needed, killing it");
                destroy_all(&[worker]);
                return Ok(());
            }
        }

        self.spawn_lifecycle(Arc::clone(&worker));
        self.release(worker);

        self.emit(
            EventType::WorkerConstruct,
            format!("worker allocated, pid: {pid}"),
        );
        Ok(())
    }

    /// Add `worker` to the roster if it still belongs there.
    ///
    /// `container` is the container that was current when the allocation
    /// started; a reset since then replaced it.
    fn admit(&self, container: &Arc<Container>, worker: &Arc<Worker>) -> Admission {
        let mut roster = self.inner.roster.write();
        if self.is_destroyed() {
            return Admission::Stopped;
        }
        if !Arc::ptr_eq(&roster.container, container)
            || roster.workers.len() as u64 >= self.num_workers()
        {
            return Admission::Surplus;
        }
        roster.workers.push(Arc::clone(worker));
        Admission::Admitted
    }

    async fn allocate_with_retry(&self) -> Result<Arc<Worker>> {
        let deadline = tokio::time::sleep(self.inner.allocate_timeout);
        tokio::pin!(deadline);

        let mut retry = tokio::time::interval(ALLOCATE_RETRY_INTERVAL);
        retry.tick().await;

        loop {
            tokio::select! {
                () = &mut deadline => {
                    let _ = self.inner.num_workers.fetch_update(
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        |n| n.checked_sub(1),
                    );
                    warn!(
                        timeout = ?self.inner.allocate_timeout,
                        target = self.num_workers(),
                        "allocation timed out, reducing target worker count"
                    );
                    return Err(DroverError::allocation_failed(format!(
                        "no worker allocated within {:?}",
                        self.inner.allocate_timeout
                    )));
                }
                _ = retry.tick() => {
                    match self.inner.allocator.allocate().await {
                        Ok(worker) => return Ok(worker),
                        Err(e) => self.emit(
                            EventType::WorkerError,
                            format!("failed to allocate worker, retrying: {e}"),
                        ),
                    }
                }
            }
        }
    }

    /// Remove `worker` from the roster and kill it.
    ///
    /// Returns false if the worker is not in the roster.
    pub fn remove(&self, worker: &Worker) -> bool {
        let removed = {
            let mut roster = self.inner.roster.write();
            match roster.workers.iter().position(|w| w.pid() == worker.pid()) {
                Some(pos) => {
                    roster.workers.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            worker.kill();
        }
        removed
    }

    /// Tear down every worker and start over with an empty roster.
    ///
    /// The caller repopulates the roster afterwards.
    #[instrument(level = "debug", skip_all)]
    pub async fn reset(&self, cancel: &CancellationToken) {
        self.container().destroy();
        self.quiesce(cancel).await;

        let target = self.num_workers();
        let capacity = usize::try_from(target).unwrap_or(usize::MAX);
        let mut roster = self.inner.roster.write();
        destroy_all(&roster.workers);
        roster.workers = Vec::with_capacity(capacity);
        roster.container = Arc::new(Container::new(capacity));
        info!(target, "worker pool reset");
    }

    /// Tear down every worker for good.
    #[instrument(level = "debug", skip_all)]
    pub async fn destroy(&self, cancel: &CancellationToken) {
        self.container().destroy();
        self.inner.events.unsubscribe(&self.inner.events_id);
        self.quiesce(cancel).await;

        self.inner.destroyed.store(true, Ordering::SeqCst);
        destroy_all(&self.inner.roster.write().workers);
        info!("worker pool destroyed");
    }

    async fn quiesce(&self, cancel: &CancellationToken) {
        let mut poll = tokio::time::interval(QUIESCE_POLL_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    warn!(
                        roster = self.len(),
                        target = self.num_workers(),
                        "pool did not settle in time, forcing teardown"
                    );
                    return;
                }
                _ = poll.tick() => {
                    let roster = self.inner.roster.read();
                    let settled = roster.workers.len() as u64 == self.num_workers()
                        && roster
                            .workers
                            .iter()
                            .all(|w| w.state().get() != WorkerState::Working);
                    if settled {
                        return;
                    }
                }
            }
        }
    }

    /// Snapshot of the roster.
    pub fn list(&self) -> Vec<Arc<Worker>> {
        self.inner.roster.read().workers.clone()
    }

    /// Introspection records for every worker in the roster.
    pub fn infos(&self) -> Vec<WorkerInfo> {
        self.inner
            .roster
            .read()
            .workers
            .iter()
            .map(|w| w.info())
            .collect()
    }

    /// Number of workers in the roster.
    pub fn len(&self) -> usize {
        self.inner.roster.read().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Target worker count.
    pub fn num_workers(&self) -> u64 {
        self.inner.num_workers.load(Ordering::SeqCst)
    }

    /// Number of idle workers in the current container.
    pub fn idle(&self) -> usize {
        self.container().len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    fn container(&self) -> Arc<Container> {
        Arc::clone(&self.inner.roster.read().container)
    }

    fn emit(&self, event_type: EventType, message: String) {
        self.inner
            .events
            .send(Event::new(event_type, SOURCE_WATCHER, message));
    }

    fn spawn_lifecycle(&self, worker: Arc<Worker>) {
        let watcher = self.clone();
        tokio::spawn(async move { watcher.lifecycle(worker).await });
    }

    /// Runs once per worker, until its process exits.
    async fn lifecycle(&self, worker: Arc<Worker>) {
        let pid = worker.pid();
        if let Err(e) = worker.wait().await {
            self.emit(
                EventType::WorkerWaitExit,
                format!("worker stopped, error: {e}"),
            );
        }

        self.remove(&worker);

        if worker.state().get() == WorkerState::Destroyed || self.is_destroyed() {
            self.emit(
                EventType::WorkerDestruct,
                format!("worker destroyed, pid: {pid}"),
            );
            return;
        }

        worker.state().set(WorkerState::Stopped);
        if self.len() as u64 >= self.num_workers() {
            debug!(pid, "roster already at target, not replacing worker");
            self.check_exhausted("target worker count dropped to zero");
            return;
        }
        debug!(pid, "worker exited, allocating replacement");

        if let Err(e) = self.allocate().await {
            self.emit(
                EventType::WorkerProcessExit,
                format!("failed to allocate worker, error: {e}"),
            );
            self.check_exhausted(&format!("can't allocate workers: {e}"));
        }
    }

    /// Invoke the fatal handler once nothing is left to serve requests.
    fn check_exhausted(&self, reason: &str) {
        if self.is_empty() && self.num_workers() == 0 && !self.is_destroyed() {
            let fatal = DroverError::NoWorkersLeft {
                message: reason.to_string(),
            };
            let handler = Arc::clone(&*self.inner.on_fatal.read());
            handler(&fatal);
        }
    }
}

impl std::fmt::Debug for WorkerWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerWatcher")
            .field("workers", &self.len())
            .field("num_workers", &self.num_workers())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

fn destroy_all(workers: &[Arc<Worker>]) {
    for worker in workers {
        worker.state().set(WorkerState::Destroyed);
        worker.kill();
    }
}

fn default_fatal_handler(err: &DroverError) {
    error!(error = %err, "no workers left in the pool, aborting");
    std::process::abort();
}
