//! Worker state machine.
//!
//! Every [`Worker`](crate::Worker) carries a [`State`]: an atomically
//! updated [`WorkerState`] plus the execution counter and last-activity
//! timestamp. The state is the only worker field written from several call
//! sites (take, release, the lifecycle task, the supervisor), so it is only
//! ever touched through [`State::get`] and [`State::set`].
//!
//! ```text
//! Inactive -> Ready <-> Working
//!      any -> Invalid | Errored | Stopping | Killing -> Stopped | Destroyed
//! ```

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    /// Spawned, not yet handed to the pool
    Inactive = 0,
    /// Idle and assignable
    Ready = 1,
    /// Checked out by a consumer
    Working = 2,
    /// Must not be handed out again; killed on its next checkin
    Invalid = 3,
    /// Soft stop in progress
    Stopping = 4,
    /// Forced stop in progress
    Killing = 5,
    /// Killed by reset/destroy; no replacement expected
    Destroyed = 6,
    /// Process has terminated
    Stopped = 7,
    /// Process failed and cannot be used
    Errored = 8,
}

impl WorkerState {
    /// Terminal states never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Destroyed)
    }

    /// Ready or Working.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Ready | Self::Working)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Inactive,
            1 => Self::Ready,
            2 => Self::Working,
            3 => Self::Invalid,
            4 => Self::Stopping,
            5 => Self::Killing,
            6 => Self::Destroyed,
            7 => Self::Stopped,
            _ => Self::Errored,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Ready => write!(f, "ready"),
            Self::Working => write!(f, "working"),
            Self::Invalid => write!(f, "invalid"),
            Self::Stopping => write!(f, "stopping"),
            Self::Killing => write!(f, "killing"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Atomically guarded worker state with usage counters.
#[derive(Debug)]
pub struct State {
    value: AtomicU8,
    num_execs: AtomicU64,
    // unix nanos
    last_used: AtomicI64,
}

impl State {
    /// Create a state holding `value`, last used now.
    pub fn new(value: WorkerState) -> Self {
        Self {
            value: AtomicU8::new(value as u8),
            num_execs: AtomicU64::new(0),
            last_used: AtomicI64::new(now_nanos()),
        }
    }

    /// Current state.
    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Overwrite the state. No transition validation is performed.
    pub fn set(&self, value: WorkerState) {
        self.value.store(value as u8, Ordering::Release);
    }

    /// Set `value` unless the current state is terminal.
    ///
    /// Returns false (and leaves the state untouched) for terminal states.
    pub fn set_unless_terminal(&self, value: WorkerState) -> bool {
        self.value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if WorkerState::from_u8(current).is_terminal() {
                    None
                } else {
                    Some(value as u8)
                }
            })
            .is_ok()
    }

    /// Move from `current` to `new` only if the state is still `current`.
    pub fn transition(&self, current: WorkerState, new: WorkerState) -> bool {
        self.value
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Record one more execution.
    pub fn register_exec(&self) {
        self.num_execs.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of executions served.
    pub fn num_execs(&self) -> u64 {
        self.num_execs.load(Ordering::Relaxed)
    }

    /// Mark the worker as used now.
    pub fn touch(&self) {
        self.last_used.store(now_nanos(), Ordering::Relaxed);
    }

    /// When the worker was last checked out or returned.
    pub fn last_used(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.last_used.load(Ordering::Relaxed))
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new(WorkerState::Inactive)
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
