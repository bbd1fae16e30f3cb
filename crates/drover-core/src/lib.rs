//! # drover-core
//!
//! Core types, errors, and utilities for drover.
//!
//! This crate provides:
//! - [`DroverError`] - Error type for all drover operations
//! - [`logging`] - Tracing setup and log management utilities
//! - [`config`] - YAML configuration for the pool and the worker command
//!
//! ## Example
//!
//! ```no_run
//! use drover_core::{DroverConfig, logging};
//!
//! fn main() -> drover_core::Result<()> {
//!     let _guard = logging::init_logging(None, false)?;
//!     let config = DroverConfig::load("drover.yaml")?;
//!     tracing::info!(workers = config.pool.num_workers, "configuration ready");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;

// Re-export main types for convenience
pub use config::{DroverConfig, PoolConfig, SupervisorConfig, WorkerCommandConfig};
pub use error::{DroverError, Result};
pub use logging::{LogGuard, init_logging};
