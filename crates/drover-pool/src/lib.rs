//! Worker pool and lifecycle management for drover.
//!
//! This crate keeps a fixed-size set of long-lived worker subprocesses alive
//! and hands them out one request at a time.
//!
//! # Overview
//!
//! - [`Container`] buffers idle workers and lets callers wait for one
//! - [`WorkerWatcher`] owns the roster, replaces workers whose process exits,
//!   and drives reset/destroy
//! - [`Pool`] is the checkout/checkin facade with per-worker job limits
//! - [`Supervisor`] retires workers that outlived their TTLs
//! - [`EventBus`] carries lifecycle events to subscribers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐       ┌──────────────────────┐
//! │        Pool          │──────▶│      Supervisor      │
//! │ (checkout, reset)    │       │  (ttl, idle, exec)   │
//! └──────────┬───────────┘       └──────────┬───────────┘
//!            │                              │
//!            ▼                              ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                    WorkerWatcher                      │
//! │  roster · take/release · allocate · lifecycle tasks   │
//! └──────────┬─────────────────────────────┬─────────────┘
//!            │                             │
//!            ▼                             ▼
//! ┌──────────────────────┐       ┌──────────────────────┐
//! │      Container       │       │      Allocator       │
//! │   (idle workers)     │       │  (spawn processes)   │
//! └──────────────────────┘       └──────────────────────┘
//! ```
//!
//! # Worker states
//!
//! ```text
//! Inactive ──▶ Ready ◀──▶ Working
//!                │           │
//!                ▼           ▼
//!     Invalid | Errored | Stopping | Killing
//!                      │
//!                      ▼
//!             Stopped | Destroyed
//! ```
//!
//! A worker whose process exits is replaced unless it was marked
//! `Destroyed` by reset or destroy.
//!
//! # Events
//!
//! Every component reports to an injected [`EventBus`]. Subscribe with a
//! `"{source}.{event_type}"` pattern, for example `"worker_watcher.*"` or
//! `"*.worker_error"`.

pub mod allocator;
pub mod container;
pub mod events;
pub mod pool;
pub mod process;
pub mod state;
pub mod supervisor;
pub mod watcher;
pub mod worker;

#[cfg(test)]
mod lifecycle_tests;
#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use allocator::{Allocator, CommandAllocator};
pub use container::Container;
pub use events::{Event, EventBus, EventType};
pub use pool::{Pool, PooledWorker};
pub use process::{ChildProcess, Process};
pub use state::{State, WorkerState};
pub use supervisor::Supervisor;
pub use watcher::WorkerWatcher;
pub use worker::{Worker, WorkerInfo};
