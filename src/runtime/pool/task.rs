//! Task definitions for the worker pool.
//!
//! A [`Task`] is created on submission and owned by the queue until it is
//! dispatched. Its result travels back through a single-use channel: the
//! pool keeps the sending half ([`Completer`]) and the caller keeps the
//! receiving half ([`TaskHandle`]). Consuming `Completer::settle` is the only
//! way to deliver a result, so a handle settles at most once by construction.
//!
//! The outcome is delivered twice over: a `tokio` oneshot wakes async
//! awaiters and a one-slot crossbeam channel serves blocking waits.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, TryRecvError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use super::error::TaskError;

/// Outcome carried back to a [`TaskHandle`].
pub type TaskResult = Result<Value, TaskError>;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Thread-safe generator for task ids.
///
/// Ids are never reused for the lifetime of the generator, which is what lets
/// the dispatcher detect a stale completion for a slot that has since been
/// handed a new task.
#[derive(Debug, Default)]
pub struct TaskIdGenerator {
    next_id: AtomicU64,
}

impl TaskIdGenerator {
    /// Create a new task ID generator.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate the next task ID.
    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// The closed set of operations a worker knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Return the payload unchanged.
    Echo,
    /// Sum an array of numbers.
    Sum,
    /// `n` → the `n`th Fibonacci number.
    Fibonacci,
    /// `limit` → number of primes below `limit`.
    CountPrimes,
    /// Occupy the worker for the given number of milliseconds.
    Sleep,
    /// Sort an array of numbers ascending.
    Sort,
}

impl TaskKind {
    /// All variants, in declaration order.
    pub const ALL: [TaskKind; 6] = [
        TaskKind::Echo,
        TaskKind::Sum,
        TaskKind::Fibonacci,
        TaskKind::CountPrimes,
        TaskKind::Sleep,
        TaskKind::Sort,
    ];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Echo => "echo",
            TaskKind::Sum => "sum",
            TaskKind::Fibonacci => "fibonacci",
            TaskKind::CountPrimes => "count_primes",
            TaskKind::Sleep => "sleep",
            TaskKind::Sort => "sort",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "echo" => Ok(TaskKind::Echo),
            "sum" => Ok(TaskKind::Sum),
            "fib" | "fibonacci" => Ok(TaskKind::Fibonacci),
            "primes" | "count_primes" => Ok(TaskKind::CountPrimes),
            "sleep" => Ok(TaskKind::Sleep),
            "sort" => Ok(TaskKind::Sort),
            other => Err(format!("unknown task kind `{other}`")),
        }
    }
}

/// What a worker receives: everything but the result channel.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: Value,
}

/// Sending half of a task's result channel.
#[derive(Debug)]
pub struct Completer {
    tx: oneshot::Sender<TaskResult>,
    blocking: channel::Sender<TaskResult>,
}

impl Completer {
    /// Deliver the outcome. A caller that already dropped its handle is not
    /// an error.
    #[inline]
    pub fn settle(
        self,
        outcome: TaskResult,
    ) {
        let _ = self.blocking.try_send(outcome.clone());
        let _ = self.tx.send(outcome);
    }
}

/// A submitted unit of work.
#[derive(Debug)]
pub struct Task {
    envelope: Envelope,
    completer: Completer,
}

impl Task {
    /// Create a task together with the handle its submitter keeps.
    pub fn new(
        id: TaskId,
        kind: TaskKind,
        payload: Value,
    ) -> (Self, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        let (blocking, settled) = channel::bounded(1);
        let task = Self {
            envelope: Envelope { id, kind, payload },
            completer: Completer { tx, blocking },
        };
        (task, TaskHandle { id, rx, settled })
    }

    /// Get the task ID.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.envelope.id
    }

    /// Get the task kind.
    #[inline]
    pub fn kind(&self) -> TaskKind {
        self.envelope.kind
    }

    /// Settle the handle with an error without running the task.
    #[inline]
    pub fn reject(
        self,
        error: TaskError,
    ) {
        self.completer.settle(Err(error));
    }

    /// Split into the worker-bound envelope and the result sender.
    #[inline]
    pub fn into_parts(self) -> (Envelope, Completer) {
        (self.envelope, self.completer)
    }
}

/// Single-resolution handle to a task's result.
///
/// Await it from async code, or call [`wait`](TaskHandle::wait) from a plain
/// thread. If the pool loses the sending half without settling it the handle
/// resolves to [`TaskError::WorkerTerminated`] instead of hanging.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<TaskResult>,
    settled: channel::Receiver<TaskResult>,
}

impl TaskHandle {
    /// Id of the task this handle belongs to.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Block the current thread until the task settles.
    ///
    /// Inside an async runtime this stalls the executor thread; `.await` the
    /// handle there instead.
    pub fn wait(self) -> TaskResult {
        self.settled
            .recv()
            .unwrap_or(Err(TaskError::WorkerTerminated))
    }

    /// Block for at most `timeout`. Returns `None` if the task is still
    /// pending, in which case the handle stays usable.
    pub fn wait_timeout(
        &mut self,
        timeout: Duration,
    ) -> Option<TaskResult> {
        match self.settled.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(TaskError::WorkerTerminated)),
        }
    }

    /// Non-blocking check.
    pub fn try_result(&mut self) -> Option<TaskResult> {
        match self.settled.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(TaskError::WorkerTerminated)),
        }
    }
}

impl Future for TaskHandle {
    type Output = TaskResult;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::WorkerTerminated)))
    }
}
