//! Worker allocation.
//!
//! An [`Allocator`] spawns one new worker and hands it back already in the
//! [`WorkerState::Ready`] state. The watcher calls it to replace workers
//! whose process exited; the pool calls it to build the initial roster.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use drover_core::{DroverError, Result, WorkerCommandConfig, log_worker_event};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::process::ChildProcess;
use crate::state::WorkerState;
use crate::worker::Worker;

/// Spawns a single healthy worker.
#[async_trait]
pub trait Allocator: Send + Sync {
    /// Spawn a worker. On success the worker is `Ready` with a valid pid.
    async fn allocate(&self) -> Result<Arc<Worker>>;
}

/// Allocator that runs a configured command as a child process.
///
/// Worker stdout/stdin are detached; stderr is inherited so worker
/// diagnostics end up next to drover's own console output.
#[derive(Debug, Clone)]
pub struct CommandAllocator {
    config: WorkerCommandConfig,
}

impl CommandAllocator {
    /// Create an allocator for `config`.
    pub fn new(config: WorkerCommandConfig) -> Self {
        Self { config }
    }

    /// The command this allocator runs.
    pub fn config(&self) -> &WorkerCommandConfig {
        &self.config
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(ref workdir) = self.config.workdir {
            cmd.current_dir(workdir);
        }
        cmd
    }
}

#[async_trait]
impl Allocator for CommandAllocator {
    #[instrument(level = "debug", skip(self))]
    async fn allocate(&self) -> Result<Arc<Worker>> {
        let child = self
            .command()
            .spawn()
            .map_err(|e| DroverError::worker_spawn(self.config.display(), e.to_string()))?;

        let process = ChildProcess::new(child)?;
        let worker = Worker::new(Box::new(process));
        debug!(pid = worker.pid(), command = %self.config.command, "worker process started");

        worker.state().set(WorkerState::Ready);
        log_worker_event!(worker.pid(), "spawned");
        Ok(Arc::new(worker))
    }
}
