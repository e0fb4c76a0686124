//! Fixed-size worker pool.
//!
//! Tasks travel by message: the payload moves into a worker, the result
//! moves back out, and nothing is shared between workers in between.
//!
//! # Architecture
//!
//! ```text
//! submit() ──► event loop (Dispatcher: TaskQueue + WorkerSlots) ──► worker N
//!                  ▲                                                  │
//!                  └──────────────── Completion { slot, id } ◄────────┘
//! ```
//!
//! The event loop is the only mutator of queue and slot state. Submissions,
//! completions and termination requests all arrive on the same channel, so
//! they are applied one at a time in arrival order.

pub mod dispatcher;
pub mod error;
pub mod queue;
pub mod task;
pub mod worker;


pub use dispatcher::{Assignment, Dispatcher, WorkerSlot};
pub use error::{PoolError, ProtocolViolation, TaskError, TaskFault};
pub use queue::TaskQueue;
pub use task::{Envelope, Task, TaskHandle, TaskId, TaskIdGenerator, TaskKind, TaskResult};
pub use worker::{BuiltinExecutor, Completion, TaskExecutor, Worker};

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads, fixed for the pool's lifetime.
    pub size: usize,
    /// Maximum number of queued (not yet dispatched) tasks. `None` is unbounded.
    pub queue_capacity: Option<usize>,
}

impl PoolConfig {
    /// `size` workers with an unbounded queue.
    #[inline]
    pub fn with_size(size: usize) -> Self {
        Self {
            size,
            queue_capacity: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self::with_size(num_cpus)
    }
}

/// Pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting submissions.
    Running,
    /// Teardown started; submissions are rejected.
    Draining,
    /// All workers released.
    Closed,
}

impl PoolState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => PoolState::Running,
            1 => PoolState::Draining,
            _ => PoolState::Closed,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            PoolState::Running => 0,
            PoolState::Draining => 1,
            PoolState::Closed => 2,
        }
    }
}

/// How in-flight work is treated on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    /// Let in-flight tasks finish, then join the workers.
    Graceful,
    /// Reject in-flight tasks with [`TaskError::WorkerTerminated`] and detach
    /// the workers.
    Abandon,
}

/// Pool statistics.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Tasks accepted by `submit`.
    pub submitted: AtomicUsize,
    /// Tasks that ran to completion, successfully or not.
    pub completed: AtomicUsize,
    /// Completed tasks whose logic faulted.
    pub faulted: AtomicUsize,
    /// Tasks rejected without running.
    pub rejected: AtomicUsize,
    /// Total execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
    /// Peak number of busy workers.
    pub peak_active: AtomicUsize,
}

impl PoolStats {
    #[inline]
    fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    fn record_rejected(
        &self,
        count: usize,
    ) {
        self.rejected.fetch_add(count, Ordering::SeqCst);
    }

    #[inline]
    fn record_completed(
        &self,
        elapsed: Duration,
        faulted: bool,
    ) {
        let duration_us = usize::try_from(elapsed.as_micros()).unwrap_or(usize::MAX);
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::SeqCst);
        if faulted {
            self.faulted.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Update peak parallelism.
    #[inline]
    fn update_peak(
        &self,
        current: usize,
    ) {
        self.peak_active.fetch_max(current, Ordering::SeqCst);
    }

    /// Completed tasks that did not fault.
    pub fn succeeded(&self) -> usize {
        self.completed
            .load(Ordering::SeqCst)
            .saturating_sub(self.faulted.load(Ordering::SeqCst))
    }
}

/// Messages into the event loop.
#[derive(Debug)]
pub(crate) enum PoolEvent {
    Submitted(Task),
    Completed(Completion),
    Terminate {
        mode: TerminateMode,
        ack: oneshot::Sender<()>,
    },
}

#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    active: AtomicUsize,
    stats: PoolStats,
    ids: TaskIdGenerator,
}

impl Shared {
    #[inline]
    fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    fn set_state(
        &self,
        state: PoolState,
    ) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// Owned handle to a running pool.
///
/// Dropping the pool performs a graceful [`terminate`](Pool::terminate) and
/// waits for it.
#[derive(Debug)]
pub struct Pool {
    config: PoolConfig,
    shared: Arc<Shared>,
    events: Sender<PoolEvent>,
    event_loop: Option<thread::JoinHandle<()>>,
}

impl Pool {
    /// Create a pool of `size` workers running the builtin task kinds.
    #[inline]
    pub fn new(size: usize) -> Result<Self, PoolError> {
        Self::with_config(PoolConfig::with_size(size))
    }

    /// Create a pool with custom configuration.
    #[inline]
    pub fn with_config(config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_executor(config, BuiltinExecutor)
    }

    /// Create a pool whose workers run `executor`.
    pub fn with_executor(
        config: PoolConfig,
        executor: impl TaskExecutor,
    ) -> Result<Self, PoolError> {
        if config.size == 0 {
            return Err(PoolError::ZeroWorkers);
        }
        if config.queue_capacity == Some(0) {
            return Err(PoolError::ZeroCapacity);
        }

        let executor: Arc<dyn TaskExecutor> = Arc::new(executor);
        let shared = Arc::new(Shared::default());
        let (events, inbox) = channel::unbounded();

        // Eager: every worker exists before the first submission.
        let mut workers = Vec::with_capacity(config.size);
        for index in 0..config.size {
            match Worker::spawn(index, executor.clone(), events.clone()) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    for worker in workers {
                        worker.shutdown();
                        worker.join();
                    }
                    return Err(err);
                }
            }
        }

        let event_loop = EventLoop {
            dispatcher: Dispatcher::new(config.size, config.queue_capacity),
            workers,
            shared: shared.clone(),
            inbox,
            acks: Vec::new(),
            draining: false,
            abandoned: false,
        };
        let name = "pool-dispatcher".to_string();
        let event_loop = thread::Builder::new()
            .name(name.clone())
            .spawn(move || event_loop.run())
            .map_err(|source| PoolError::Spawn { name, source })?;

        info!(
            "pool started with {} workers (queue capacity: {:?})",
            config.size, config.queue_capacity
        );

        Ok(Self {
            config,
            shared,
            events,
            event_loop: Some(event_loop),
        })
    }

    /// Queue a task. Never blocks.
    ///
    /// After teardown has begun the returned handle is already rejected with
    /// [`TaskError::PoolClosed`].
    pub fn submit(
        &self,
        kind: TaskKind,
        payload: Value,
    ) -> TaskHandle {
        let (task, handle) = Task::new(self.shared.ids.next(), kind, payload);

        if self.shared.state() != PoolState::Running {
            self.shared.stats.record_rejected(1);
            task.reject(TaskError::PoolClosed);
            return handle;
        }

        trace!("submit {} ({})", handle.id(), kind);
        match self.events.send(PoolEvent::Submitted(task)) {
            Ok(()) => self.shared.stats.record_submitted(),
            Err(err) => {
                // The event loop is gone even though the state still reads
                // Running.
                if let PoolEvent::Submitted(task) = err.into_inner() {
                    self.shared.stats.record_rejected(1);
                    task.reject(TaskError::PoolClosed);
                }
            }
        }
        handle
    }

    /// Stop accepting work, reject queued tasks, let in-flight tasks finish.
    #[inline]
    pub fn terminate(&self) -> Termination {
        self.begin_termination(TerminateMode::Graceful)
    }

    /// Stop accepting work and reject both queued and in-flight tasks.
    #[inline]
    pub fn terminate_now(&self) -> Termination {
        self.begin_termination(TerminateMode::Abandon)
    }

    fn begin_termination(
        &self,
        mode: TerminateMode,
    ) -> Termination {
        let (ack, done) = oneshot::channel();
        let _ = self.shared.state.compare_exchange(
            PoolState::Running.as_u8(),
            PoolState::Draining.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        // Once the loop has exited the ack is dropped with the event, which
        // resolves the termination immediately.
        let _ = self.events.send(PoolEvent::Terminate { mode, ack });
        Termination { done }
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    /// Number of workers.
    #[inline]
    pub fn size(&self) -> usize {
        self.config.size
    }

    /// Number of workers currently running a task.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Get statistics.
    #[inline]
    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    /// Get configuration.
    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.state() == PoolState::Running {
            drop(self.terminate());
        }
        if let Some(event_loop) = self.event_loop.take() {
            if event_loop.join().is_err() {
                error!("pool dispatcher exited by panic");
            }
        }
    }
}

/// Completion of a pool teardown.
///
/// Await it, or call [`wait`](Termination::wait) from a plain thread.
#[derive(Debug)]
pub struct Termination {
    done: oneshot::Receiver<()>,
}

impl Termination {
    /// Block until the pool is closed.
    pub fn wait(self) {
        let _ = self.done.blocking_recv();
    }
}

impl Future for Termination {
    type Output = ();

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        Pin::new(&mut self.done).poll(cx).map(|_| ())
    }
}

/// Single-threaded owner of the dispatcher and the workers.
struct EventLoop {
    dispatcher: Dispatcher,
    workers: Vec<Worker>,
    shared: Arc<Shared>,
    inbox: Receiver<PoolEvent>,
    acks: Vec<oneshot::Sender<()>>,
    draining: bool,
    abandoned: bool,
}

impl EventLoop {
    fn run(mut self) {
        while let Ok(event) = self.inbox.recv() {
            match event {
                PoolEvent::Submitted(task) => self.on_submitted(task),
                PoolEvent::Completed(completion) => self.on_completed(completion),
                PoolEvent::Terminate { mode, ack } => self.on_terminate(mode, ack),
            }
            self.shared
                .active
                .store(self.dispatcher.active_count(), Ordering::SeqCst);

            if self.draining && self.dispatcher.is_quiescent() {
                break;
            }
        }
        self.close();
    }

    fn on_submitted(
        &mut self,
        task: Task,
    ) {
        if self.draining {
            self.shared.stats.record_rejected(1);
            task.reject(TaskError::PoolClosed);
            return;
        }
        let id = task.id();
        if let Err(err) = self.dispatcher.enqueue(task) {
            self.shared.stats.record_rejected(1);
            debug!("rejected {}: {}", id, err);
            return;
        }
        self.pump();
    }

    fn on_completed(
        &mut self,
        completion: Completion,
    ) {
        let Completion {
            slot,
            id,
            outcome,
            elapsed,
        } = completion;

        let faulted = outcome.is_err();
        if let Err(fault) = &outcome {
            warn!("{} on worker {} faulted: {}", id, slot, fault);
        } else {
            trace!("{} on worker {} done in {:?}", id, slot, elapsed);
        }

        if let Err(violation) = self.dispatcher.complete(slot, id, outcome) {
            error!("completion routing failed: {}", violation);
            panic!("pool protocol violation: {violation}");
        }
        self.shared
            .stats
            .record_completed(elapsed, faulted);

        if !self.draining {
            self.pump();
        }
    }

    fn on_terminate(
        &mut self,
        mode: TerminateMode,
        ack: oneshot::Sender<()>,
    ) {
        self.acks.push(ack);

        if !self.draining {
            self.draining = true;
            let rejected = self.dispatcher.reject_queued(&TaskError::PoolClosed);
            self.shared.stats.record_rejected(rejected);
            info!(
                "pool draining: {} queued task(s) rejected, {} in flight",
                rejected,
                self.dispatcher.active_count()
            );
        }

        if mode == TerminateMode::Abandon && !self.abandoned {
            self.abandoned = true;
            let abandoned = self
                .dispatcher
                .abandon_in_flight(&TaskError::WorkerTerminated);
            self.shared.stats.record_rejected(abandoned);
            if abandoned > 0 {
                warn!("abandoned {} in-flight task(s)", abandoned);
            }
        }
    }

    /// Dispatch until the queue is empty or every slot is busy.
    fn pump(&mut self) {
        while let Some(Assignment { slot, envelope }) = self.dispatcher.next_assignment() {
            self.shared
                .stats
                .update_peak(self.dispatcher.active_count());
            trace!("dispatch {} to worker {}", envelope.id, slot);

            if let Err(envelope) = self.workers[slot].run(envelope) {
                error!("worker {} is gone; failing {}", slot, envelope.id);
                let fault = Err(TaskFault::Failed(format!("worker {slot} unavailable")));
                if let Err(violation) = self.dispatcher.complete(slot, envelope.id, fault) {
                    panic!("pool protocol violation: {violation}");
                }
            }
        }
    }

    fn close(self) {
        let EventLoop {
            dispatcher,
            workers,
            shared,
            inbox,
            acks,
            abandoned,
            ..
        } = self;
        // Closed before any ack goes out: once a termination resolves, every
        // later send to this loop fails.
        for event in inbox.try_iter() {
            if let PoolEvent::Submitted(task) = event {
                shared.stats.record_rejected(1);
                task.reject(TaskError::PoolClosed);
            }
        }
        drop(inbox);

        for worker in &workers {
            worker.shutdown();
        }
        for worker in workers {
            if abandoned {
                worker.detach();
            } else {
                worker.join();
            }
        }
        // Anything still here would otherwise hang its caller.
        drop(dispatcher);

        shared.active.store(0, Ordering::SeqCst);
        shared.set_state(PoolState::Closed);
        info!("pool closed");

        for ack in acks {
            let _ = ack.send(());
        }
    }
}
