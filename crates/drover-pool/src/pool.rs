//! Pool facade.
//!
//! [`Pool`] wires an [`Allocator`], a [`WorkerWatcher`] and an optional
//! [`Supervisor`] together behind a checkout/checkin API:
//!
//! ```no_run
//! use std::sync::Arc;
//! use drover_core::{PoolConfig, WorkerCommandConfig};
//! use drover_pool::{CommandAllocator, EventBus, Pool};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> drover_core::Result<()> {
//! let command = WorkerCommandConfig::new("php").with_arg("worker.php");
//! let allocator = Arc::new(CommandAllocator::new(command));
//! let pool = Pool::new(PoolConfig::new(4), allocator, Arc::new(EventBus::new())).await?;
//!
//! let worker = pool.checkout(&CancellationToken::new()).await?;
//! // ... talk to the worker ...
//! worker.finish();
//! # Ok(())
//! # }
//! ```

use std::ops::Deref;
use std::sync::Arc;

use drover_core::{DroverError, PoolConfig, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::allocator::Allocator;
use crate::events::{Event, EventBus, EventType, SOURCE_POOL};
use crate::state::WorkerState;
use crate::supervisor::Supervisor;
use crate::watcher::WorkerWatcher;
use crate::worker::{Worker, WorkerInfo};

/// A supervised pool of worker processes.
pub struct Pool {
    config: PoolConfig,
    allocator: Arc<dyn Allocator>,
    watcher: WorkerWatcher,
    events: Arc<EventBus>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl Pool {
    /// Start `config.num_workers` workers and begin watching them.
    ///
    /// Fails on the first worker that cannot be allocated; workers started
    /// before it are killed.
    #[instrument(level = "debug", skip_all, fields(num_workers = config.num_workers))]
    pub async fn new(
        config: PoolConfig,
        allocator: Arc<dyn Allocator>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        config.validate()?;

        let workers = allocate_workers(allocator.as_ref(), config.num_workers).await?;
        let watcher = WorkerWatcher::new(
            Arc::clone(&allocator),
            config.num_workers,
            config.allocate_timeout,
            Arc::clone(&events),
        );
        watcher.watch(workers);

        let supervisor = config
            .supervisor
            .clone()
            .map(|cfg| Supervisor::spawn(cfg, watcher.clone(), Arc::clone(&events)));

        info!(
            num_workers = config.num_workers,
            supervised = supervisor.is_some(),
            "worker pool started"
        );

        Ok(Self {
            config,
            allocator,
            watcher,
            events,
            supervisor: Mutex::new(supervisor),
        })
    }

    /// Check out an idle worker.
    ///
    /// Waits at most `allocate_timeout`; on expiry a `NoFreeWorkers` event
    /// is emitted and [`DroverError::NoFreeWorkers`] returned.
    pub async fn checkout(&self, cancel: &CancellationToken) -> Result<PooledWorker> {
        let timeout = self.config.allocate_timeout;
        let worker = match tokio::time::timeout(timeout, self.take_ready(cancel)).await {
            Ok(taken) => taken?,
            Err(_elapsed) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                self.events.send(Event::new(
                    EventType::NoFreeWorkers,
                    SOURCE_POOL,
                    format!("no free workers after {timeout_ms}ms"),
                ));
                return Err(DroverError::NoFreeWorkers { timeout_ms });
            }
        };

        worker.state().touch();
        worker.state().register_exec();

        Ok(PooledWorker {
            worker,
            watcher: self.watcher.clone(),
            max_jobs: self.config.max_jobs,
            returned: false,
        })
    }

    async fn take_ready(&self, cancel: &CancellationToken) -> Result<Arc<Worker>> {
        loop {
            let worker = self.watcher.take(cancel).await?;
            if let Some(worker) = self.claim(worker) {
                return Ok(worker);
            }
        }
    }

    /// Mark a taken worker `Working`, or give it back if it stopped being
    /// `Ready` after it left the container.
    fn claim(&self, worker: Arc<Worker>) -> Option<Arc<Worker>> {
        if worker
            .state()
            .transition(WorkerState::Ready, WorkerState::Working)
        {
            return Some(worker);
        }
        debug!(
            pid = worker.pid(),
            state = %worker.state().get(),
            "worker left ready state before checkout"
        );
        self.watcher.release(worker);
        None
    }

    /// Snapshot of every worker in the roster.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.watcher.list()
    }

    /// Introspection records for every worker.
    pub fn infos(&self) -> Vec<WorkerInfo> {
        self.watcher.infos()
    }

    /// Stop the worker with `pid`; its lifecycle task allocates a replacement.
    pub fn remove_worker(&self, pid: u32) -> Result<()> {
        let worker = self
            .watcher
            .list()
            .into_iter()
            .find(|w| w.pid() == pid)
            .ok_or(DroverError::WorkerNotFound { pid })?;

        if !self.watcher.remove(&worker) {
            return Err(DroverError::WorkerNotFound { pid });
        }
        self.events.send(Event::new(
            EventType::WorkerStopped,
            SOURCE_POOL,
            format!("worker removed on request, pid: {pid}"),
        ));
        Ok(())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Replace every worker with a freshly allocated one.
    #[instrument(level = "debug", skip_all)]
    pub async fn reset(&self, cancel: &CancellationToken) -> Result<()> {
        self.watcher.reset(cancel).await;

        let workers = allocate_workers(self.allocator.as_ref(), self.watcher.num_workers()).await?;
        self.watcher.watch(workers);
        info!(num_workers = self.watcher.len(), "worker pool reset complete");
        Ok(())
    }

    /// Stop supervision and tear down every worker.
    #[instrument(level = "debug", skip_all)]
    pub async fn destroy(&self, cancel: &CancellationToken) {
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }
        self.watcher.destroy(cancel).await;
    }

    /// The underlying watcher.
    pub fn watcher(&self) -> &WorkerWatcher {
        &self.watcher
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("watcher", &self.watcher)
            .finish()
    }
}

async fn allocate_workers(allocator: &dyn Allocator, count: u64) -> Result<Vec<Arc<Worker>>> {
    let mut workers = Vec::with_capacity(usize::try_from(count).unwrap_or_default());
    for _ in 0..count {
        match allocator.allocate().await {
            Ok(worker) => workers.push(worker),
            Err(e) => {
                warn!(error = %e, started = workers.len(), "initial worker allocation failed");
                for worker in &workers {
                    worker.state().set(WorkerState::Destroyed);
                    worker.kill();
                }
                return Err(e);
            }
        }
    }
    Ok(workers)
}

/// A checked-out worker.
///
/// Returned to the pool by [`finish`](Self::finish) or on drop. A worker that
/// reached `max_jobs` is killed instead and replaced in the background.
#[derive(Debug)]
pub struct PooledWorker {
    worker: Arc<Worker>,
    watcher: WorkerWatcher,
    max_jobs: u64,
    returned: bool,
}

impl PooledWorker {
    /// Return the worker to the pool.
    pub fn finish(mut self) {
        self.checkin();
    }

    /// Discard the worker; it is killed and replaced.
    pub fn invalidate(mut self) {
        self.worker.state().set(WorkerState::Invalid);
        self.checkin();
    }

    fn checkin(&mut self) {
        if std::mem::replace(&mut self.returned, true) {
            return;
        }

        let state = self.worker.state();
        let exhausted = self.max_jobs > 0 && state.num_execs() >= self.max_jobs;
        let next = if exhausted {
            WorkerState::Invalid
        } else {
            WorkerState::Ready
        };
        if state.transition(WorkerState::Working, next) {
            state.touch();
            if exhausted {
                debug!(pid = self.worker.pid(), max_jobs = self.max_jobs, "max jobs reached");
            }
        }
        self.watcher.release(Arc::clone(&self.worker));
    }
}

impl Deref for PooledWorker {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        &self.worker
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        self.checkin();
    }
}
