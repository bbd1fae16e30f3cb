//! In-memory processes and a scripted allocator for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use drover_core::{DroverError, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::allocator::Allocator;
use crate::events::{Event, EventBus};
use crate::process::Process;
use crate::state::WorkerState;
use crate::worker::Worker;

#[derive(Debug, Default)]
struct Shared {
    exited: CancellationToken,
    crashed: AtomicBool,
    clean: AtomicBool,
    kills: AtomicUsize,
}

/// A process that exits when killed or when its handle says so.
#[derive(Debug)]
pub struct FakeProcess {
    pid: u32,
    shared: Arc<Shared>,
}

/// Test-side control over a [`FakeProcess`].
#[derive(Debug, Clone)]
pub struct FakeProcessHandle {
    shared: Arc<Shared>,
}

impl FakeProcess {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn handle(&self) -> FakeProcessHandle {
        FakeProcessHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl FakeProcessHandle {
    /// Simulate an unexpected crash (exit code 1).
    pub fn crash(&self) {
        self.shared.crashed.store(true, Ordering::SeqCst);
        self.shared.exited.cancel();
    }

    /// Simulate a clean exit (exit code 0).
    pub fn exit_clean(&self) {
        self.shared.clean.store(true, Ordering::SeqCst);
        self.shared.exited.cancel();
    }

    pub fn is_exited(&self) -> bool {
        self.shared.exited.is_cancelled()
    }

    pub fn kill_count(&self) -> usize {
        self.shared.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Process for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn kill(&self) -> Result<()> {
        self.shared.kills.fetch_add(1, Ordering::SeqCst);
        self.shared.exited.cancel();
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        self.shared.exited.cancelled().await;
        if self.shared.clean.load(Ordering::SeqCst) {
            return Ok(());
        }
        let exit_code = self.shared.crashed.load(Ordering::SeqCst).then_some(1);
        Err(DroverError::WorkerExit {
            pid: self.pid,
            exit_code,
        })
    }
}

/// Allocator handing out [`FakeProcess`] workers with sequential pids.
///
/// `fail_next(n)` makes the next `n` allocations fail; `fail_after` delays
/// the failures by a number of successful calls. `hold_next` parks one call.
#[derive(Debug)]
pub struct FakeAllocator {
    next_pid: AtomicU32,
    grace: AtomicUsize,
    failures: AtomicUsize,
    calls: AtomicUsize,
    hold: Mutex<Option<CancellationToken>>,
    handles: Mutex<HashMap<u32, FakeProcessHandle>>,
}

impl FakeAllocator {
    pub fn new(first_pid: u32) -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(first_pid),
            grace: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            hold: Mutex::new(None),
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Let `successes` allocations through, then fail the next `failures`.
    pub fn fail_after(&self, successes: usize, failures: usize) {
        self.grace.store(successes, Ordering::SeqCst);
        self.failures.store(failures, Ordering::SeqCst);
    }

    /// Block the next allocation until the returned token is cancelled.
    pub fn hold_next(&self) -> CancellationToken {
        let gate = CancellationToken::new();
        *self.hold.lock() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn handle(&self, pid: u32) -> FakeProcessHandle {
        self.handles
            .lock()
            .get(&pid)
            .cloned()
            .unwrap_or_else(|| panic!("no fake process with pid {pid}"))
    }

    /// Spawn a `Ready` worker without counting an allocator call.
    pub fn spawn_ready(&self) -> Arc<Worker> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let process = FakeProcess::new(pid);
        self.handles.lock().insert(pid, process.handle());
        let worker = Worker::new(Box::new(process));
        worker.state().set(WorkerState::Ready);
        Arc::new(worker)
    }

    pub fn spawn_many(&self, n: usize) -> Vec<Arc<Worker>> {
        (0..n).map(|_| self.spawn_ready()).collect()
    }
}

#[async_trait]
impl Allocator for FakeAllocator {
    async fn allocate(&self) -> Result<Arc<Worker>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.hold.lock().take();
        if let Some(gate) = gate {
            gate.cancelled().await;
        }
        let graced = self
            .grace
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if graced {
            return Ok(self.spawn_ready());
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DroverError::worker_spawn("fake-worker", "scripted failure"));
        }
        Ok(self.spawn_ready())
    }
}

/// Subscribe to everything on `bus` under `id`.
pub fn collect_events(bus: &EventBus, id: &str) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel(256);
    bus.subscribe_all(id, tx).unwrap();
    rx
}

/// Everything currently queued on `rx`.
pub fn drain_events(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Poll `condition` every 5ms until it holds or `timeout` elapses.
pub async fn eventually(
    timeout: std::time::Duration,
    mut condition: impl FnMut() -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    condition()
}
