//! Execution units.
//!
//! Each worker is an OS thread with its own command channel. It receives an
//! [`Envelope`] by value, runs it through the pool's [`TaskExecutor`], and
//! sends the outcome back to the dispatcher tagged with its slot index and
//! the task id. Workers share no mutable state with each other.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use super::error::{PoolError, TaskFault};
use super::task::{Envelope, TaskId, TaskKind};
use super::PoolEvent;

/// Largest `count_primes` limit the builtin executor accepts.
pub const MAX_PRIME_LIMIT: u64 = 100_000_000;

/// Runs one task. Implementations must be stateless or internally
/// synchronized: every worker calls the same instance.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        kind: TaskKind,
        payload: &Value,
    ) -> Result<Value, TaskFault>;
}

impl<F> TaskExecutor for F
where
    F: Fn(TaskKind, &Value) -> Result<Value, TaskFault> + Send + Sync + 'static,
{
    fn execute(
        &self,
        kind: TaskKind,
        payload: &Value,
    ) -> Result<Value, TaskFault> {
        self(kind, payload)
    }
}

/// Executor for the builtin [`TaskKind`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinExecutor;

impl TaskExecutor for BuiltinExecutor {
    fn execute(
        &self,
        kind: TaskKind,
        payload: &Value,
    ) -> Result<Value, TaskFault> {
        match kind {
            TaskKind::Echo => Ok(payload.clone()),
            TaskKind::Sum => sum(payload),
            TaskKind::Fibonacci => fibonacci(payload),
            TaskKind::CountPrimes => count_primes(payload),
            TaskKind::Sleep => {
                let millis = payload.as_u64().ok_or(TaskFault::InvalidPayload {
                    expected: "non-negative integer milliseconds",
                })?;
                thread::sleep(Duration::from_millis(millis));
                Ok(json!(millis))
            }
            TaskKind::Sort => sort(payload),
        }
    }
}

fn numbers(payload: &Value) -> Result<&Vec<Value>, TaskFault> {
    const EXPECTED: TaskFault = TaskFault::InvalidPayload {
        expected: "array of numbers",
    };
    let items = payload.as_array().ok_or(EXPECTED)?;
    if items.iter().all(Value::is_number) {
        Ok(items)
    } else {
        Err(EXPECTED)
    }
}

fn sum(payload: &Value) -> Result<Value, TaskFault> {
    let items = numbers(payload)?;
    if items.iter().all(|v| v.is_i64()) {
        let total = items
            .iter()
            .filter_map(Value::as_i64)
            .try_fold(0i64, i64::checked_add)
            .ok_or_else(|| TaskFault::Overflow("integer sum exceeds i64".to_string()))?;
        return Ok(json!(total));
    }
    Ok(json!(items.iter().filter_map(Value::as_f64).sum::<f64>()))
}

fn fibonacci(payload: &Value) -> Result<Value, TaskFault> {
    let n = payload.as_u64().ok_or(TaskFault::InvalidPayload {
        expected: "non-negative integer",
    })?;
    if n == 0 {
        return Ok(json!(0u64));
    }
    // Invariant: after step k, `b` is F(k + 1).
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 1..n {
        let next = a
            .checked_add(b)
            .ok_or_else(|| TaskFault::Overflow(format!("fibonacci({n}) exceeds u64")))?;
        a = b;
        b = next;
    }
    Ok(json!(b))
}

fn count_primes(payload: &Value) -> Result<Value, TaskFault> {
    let limit = payload
        .as_u64()
        .filter(|limit| *limit <= MAX_PRIME_LIMIT)
        .ok_or(TaskFault::InvalidPayload {
            expected: "integer limit no larger than 100000000",
        })? as usize;
    if limit < 3 {
        return Ok(json!(0));
    }

    let mut composite = vec![false; limit];
    let mut count = 0u64;
    for i in 2..limit {
        if composite[i] {
            continue;
        }
        count += 1;
        let mut multiple = i * i;
        while multiple < limit {
            composite[multiple] = true;
            multiple += i;
        }
    }
    Ok(json!(count))
}

fn sort(payload: &Value) -> Result<Value, TaskFault> {
    let mut items = numbers(payload)?.clone();
    items.sort_by(|a, b| {
        let a = a.as_f64().unwrap_or(f64::NAN);
        let b = b.as_f64().unwrap_or(f64::NAN);
        a.total_cmp(&b)
    });
    Ok(Value::Array(items))
}

/// Result of one task run, as reported to the dispatcher.
#[derive(Debug)]
pub struct Completion {
    pub slot: usize,
    pub id: TaskId,
    pub outcome: Result<Value, TaskFault>,
    pub elapsed: Duration,
}

#[derive(Debug)]
enum WorkerCommand {
    Run(Envelope),
    Shutdown,
}

/// Handle to one execution unit, owned by the pool's event loop.
#[derive(Debug)]
pub struct Worker {
    index: usize,
    commands: Sender<WorkerCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Start worker `index`, reporting completions on `events`.
    pub(crate) fn spawn(
        index: usize,
        executor: Arc<dyn TaskExecutor>,
        events: Sender<PoolEvent>,
    ) -> Result<Self, PoolError> {
        let (commands, inbox) = channel::unbounded();
        let name = format!("pool-worker-{}", index);

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(index, &inbox, executor.as_ref(), &events))
            .map_err(|source| PoolError::Spawn { name, source })?;

        Ok(Self {
            index,
            commands,
            thread: Some(thread),
        })
    }

    /// Slot index of this worker.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Hand a task to the worker. Fails only if the thread has exited.
    pub(crate) fn run(
        &self,
        envelope: Envelope,
    ) -> Result<(), Envelope> {
        self.commands
            .send(WorkerCommand::Run(envelope))
            .map_err(|err| match err.into_inner() {
                WorkerCommand::Run(envelope) => envelope,
                WorkerCommand::Shutdown => unreachable!("sent Run"),
            })
    }

    /// Ask the worker to exit once its current task (if any) is done.
    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
    }

    /// Wait for the thread to exit.
    pub(crate) fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("worker {} exited by panic", self.index);
            }
        }
    }

    /// Let the thread finish on its own; nothing waits for it.
    pub(crate) fn detach(mut self) {
        self.thread.take();
    }
}

fn worker_loop(
    index: usize,
    inbox: &Receiver<WorkerCommand>,
    executor: &dyn TaskExecutor,
    events: &Sender<PoolEvent>,
) {
    trace!("worker {} started", index);

    while let Ok(WorkerCommand::Run(envelope)) = inbox.recv() {
        let Envelope { id, kind, payload } = envelope;
        let start = Instant::now();
        let outcome = execute_isolated(executor, kind, &payload);
        let elapsed = start.elapsed();

        let completion = Completion {
            slot: index,
            id,
            outcome,
            elapsed,
        };
        // The event loop is gone after a forced shutdown; the result has
        // nowhere to go.
        if events.send(PoolEvent::Completed(completion)).is_err() {
            debug!("worker {} dropping result for {}: pool closed", index, id);
            break;
        }
    }

    trace!("worker {} stopped", index);
}

/// Run one task, converting a panic into a fault on that task alone.
pub fn execute_isolated(
    executor: &dyn TaskExecutor,
    kind: TaskKind,
    payload: &Value,
) -> Result<Value, TaskFault> {
    panic::catch_unwind(AssertUnwindSafe(|| executor.execute(kind, payload)))
        .unwrap_or_else(|panic| Err(TaskFault::Panicked(panic_message(panic.as_ref()))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
