//! Worker handle.

use std::fmt;

use chrono::{DateTime, Utc};
use drover_core::{Result, log_worker_event};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::process::Process;
use crate::state::{State, WorkerState};

/// One worker subprocess.
///
/// Workers are shared as `Arc<Worker>`: the watcher's roster owns them and
/// the idle container holds extra references while they are idle. Only the
/// [`State`] is mutated after construction.
pub struct Worker {
    pid: u32,
    created_at: DateTime<Utc>,
    state: State,
    process: Box<dyn Process>,
}

impl Worker {
    /// Wrap a started process. The worker begins in [`WorkerState::Inactive`].
    pub fn new(process: Box<dyn Process>) -> Self {
        Self {
            pid: process.pid(),
            created_at: Utc::now(),
            state: State::new(WorkerState::Inactive),
            process,
        }
    }

    /// Process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// When the worker was spawned.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Atomic state accessor.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Force-kill the process. Idempotent and best-effort.
    ///
    /// The state moves to [`WorkerState::Killing`] unless it is already
    /// terminal, so a `Destroyed` mark survives. Failures are logged.
    pub fn kill(&self) {
        self.state.set_unless_terminal(WorkerState::Killing);
        if let Err(e) = self.process.kill() {
            warn!(pid = self.pid, error = %e, "failed to kill worker");
            return;
        }
        log_worker_event!(self.pid, "kill_requested", state = %self.state.get());
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> Result<()> {
        self.process.wait().await
    }

    /// Introspection snapshot.
    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            pid: self.pid,
            state: self.state.get().to_string(),
            num_executions: self.state.num_execs(),
            created_at: self.created_at,
            last_updated_at: self.state.last_used(),
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("state", &self.state.get())
            .field("num_execs", &self.state.num_execs())
            .finish()
    }
}

/// Worker summary exposed to informer/reset front-ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Process id
    pub pid: u32,
    /// State name (`ready`, `working`, ...)
    pub state: String,
    /// Executions served so far
    pub num_executions: u64,
    /// When the worker was spawned
    pub created_at: DateTime<Utc>,
    /// Last checkout or checkin
    pub last_updated_at: DateTime<Utc>,
}
