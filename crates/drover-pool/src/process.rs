//! Worker process handles.
//!
//! [`Process`] is the seam between the pool and whatever actually runs a
//! worker. The pool needs exactly three things from it: the pid, a way to
//! request termination, and a future that resolves when the process is gone.
//! [`ChildProcess`] implements it on top of `tokio::process`.

use std::fmt;

use async_trait::async_trait;
use drover_core::{DroverError, Result};
use parking_lot::Mutex;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// An OS process (or anything that behaves like one) backing a worker.
#[async_trait]
pub trait Process: Send + Sync + fmt::Debug {
    /// Process id.
    fn pid(&self) -> u32;

    /// Request termination. Idempotent and non-blocking.
    fn kill(&self) -> Result<()>;

    /// Resolve once the process has exited.
    ///
    /// Called once, by the worker's lifecycle task. Returns an error when
    /// the process exited abnormally.
    async fn wait(&self) -> Result<()>;
}

/// A spawned child process.
///
/// The child itself is moved into [`Process::wait`]; [`Process::kill`] only
/// flips a token that the waiting side reacts to, so killing never contends
/// with the blocking wait.
pub struct ChildProcess {
    pid: u32,
    child: Mutex<Option<Child>>,
    kill: CancellationToken,
}

impl ChildProcess {
    /// Wrap a freshly spawned child.
    pub fn new(child: Child) -> Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| DroverError::internal("spawned child has no pid"))?;
        Ok(Self {
            pid,
            child: Mutex::new(Some(child)),
            kill: CancellationToken::new(),
        })
    }
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.pid)
            .field("kill_requested", &self.kill.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Process for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn kill(&self) -> Result<()> {
        self.kill.cancel();
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let mut child = self
            .child
            .lock()
            .take()
            .ok_or_else(|| DroverError::internal(format!("process {} already awaited", self.pid)))?;

        let status = tokio::select! {
            status = child.wait() => status,
            () = self.kill.cancelled() => {
                if let Err(e) = child.start_kill() {
                    // InvalidInput means the child already exited.
                    debug!(pid = self.pid, error = %e, "kill signal not delivered");
                }
                child.wait().await
            }
        }
        .map_err(|e| DroverError::io("waiting for worker", format!("pid:{}", self.pid), e))?;

        if status.success() {
            Ok(())
        } else {
            Err(DroverError::WorkerExit {
                pid: self.pid,
                exit_code: status.code(),
            })
        }
    }
}
