//! Error taxonomy for the worker pool.
//!
//! Task-level failures ([`TaskError`]) are delivered on the handle of the
//! task they belong to and never escalate to the pool. [`ProtocolViolation`]
//! is different: it means the dispatcher's own bookkeeping is wrong, and the
//! event loop halts loudly on it.

use thiserror::Error;

use super::task::{TaskId, TaskKind};

/// Failure raised by task logic itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskFault {
    /// The payload did not have the shape the task kind expects.
    #[error("invalid payload: expected {expected}")]
    InvalidPayload { expected: &'static str },

    /// Arithmetic result does not fit the result type.
    #[error("arithmetic overflow: {0}")]
    Overflow(String),

    /// The executor panicked while running the task.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Any other failure reported by a custom executor.
    #[error("{0}")]
    Failed(String),
}

/// Error delivered on a [`TaskHandle`](super::TaskHandle).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Submitted after teardown began, or still queued when it did.
    #[error("pool is closed")]
    PoolClosed,

    /// In-flight task abandoned by a forced shutdown.
    #[error("worker terminated before the task completed")]
    WorkerTerminated,

    /// The task's own logic failed.
    #[error("{kind} task failed: {cause}")]
    TaskExecutionFault { kind: TaskKind, cause: TaskFault },

    /// Bounded queue is at capacity.
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
}

impl TaskError {
    /// Whether resubmitting the same task later may succeed.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::QueueFull { .. })
    }
}

/// Internal consistency failure in completion routing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A completion named a slot the pool does not have.
    #[error("completion from unknown slot {slot}")]
    UnknownSlot { slot: usize },

    /// A completion arrived for a slot with nothing assigned.
    #[error("slot {slot} reported {id} but has no assigned task")]
    UnknownTask { slot: usize, id: TaskId },

    /// A completion named a different task than the slot was given.
    #[error("slot {slot} reported {got} but was assigned {expected}")]
    MismatchedTask {
        slot: usize,
        expected: TaskId,
        got: TaskId,
    },
}

/// Error constructing a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// `size` was zero.
    #[error("pool size must be at least 1")]
    ZeroWorkers,

    /// A bounded queue with no room at all.
    #[error("queue capacity must be at least 1")]
    ZeroCapacity,

    /// The OS refused to start a thread.
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
