//! Taskframe
//!
//! A parallel task-execution engine with a shared-memory producer/consumer
//! pipeline.
//!
//! - [`Pool`]: a fixed set of worker threads running discrete tasks and
//!   returning results through single-use handles.
//! - [`Simulation`]: a free-running producer stepping entities in a
//!   double-buffered region while a consumer renders whole generations.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use taskframe::{Pool, TaskKind};
//!
//! fn main() -> taskframe::Result<()> {
//!     let pool = Pool::new(2)?;
//!     let handle = pool.submit(TaskKind::Fibonacci, json!(30));
//!     println!("{}", handle.wait()?);
//!     pool.terminate().wait();
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/taskframe")]
#![warn(rust_2018_idioms)]

pub mod runtime;
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use runtime::pool::{
    BuiltinExecutor, Pool, PoolConfig, PoolError, PoolState, PoolStats, TaskError, TaskExecutor,
    TaskFault, TaskHandle, TaskId, TaskKind, Termination,
};
pub use runtime::simulation::{
    Bounds, EntityRecord, FrameView, Simulation, SimulationConfig, SimulationError,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "taskframe";
