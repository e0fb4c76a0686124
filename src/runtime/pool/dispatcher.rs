//! Dispatcher bookkeeping.
//!
//! Matches idle slots to queued tasks and correlates completions back to the
//! handle of the task each slot was given. All of it is plain `&mut self`
//! state: the pool drives it from a single event-loop thread, which is what
//! serializes submissions against completions.

use serde_json::Value;

use super::error::{ProtocolViolation, TaskError, TaskFault};
use super::queue::TaskQueue;
use super::task::{Completer, Envelope, Task, TaskId, TaskKind};

/// A task currently owned by a worker.
#[derive(Debug)]
struct InFlight {
    id: TaskId,
    kind: TaskKind,
    completer: Completer,
}

/// Per-worker bookkeeping. `busy` iff a task is assigned.
#[derive(Debug, Default)]
pub struct WorkerSlot {
    assigned: Option<InFlight>,
}

impl WorkerSlot {
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.assigned.is_some()
    }

    /// Id of the task this slot is running.
    #[inline]
    pub fn assigned_id(&self) -> Option<TaskId> {
        self.assigned.as_ref().map(|f| f.id)
    }
}

/// Work handed to a specific slot.
#[derive(Debug)]
pub struct Assignment {
    pub slot: usize,
    pub envelope: Envelope,
}

/// Queue and slot state for one pool.
#[derive(Debug)]
pub struct Dispatcher {
    slots: Vec<WorkerSlot>,
    queue: TaskQueue,
}

impl Dispatcher {
    /// `size` slots, all idle, with an unbounded queue unless `capacity` is given.
    pub fn new(
        size: usize,
        capacity: Option<usize>,
    ) -> Self {
        let queue = match capacity {
            Some(cap) => TaskQueue::bounded(cap),
            None => TaskQueue::new(),
        };
        Self {
            slots: (0..size).map(|_| WorkerSlot::default()).collect(),
            queue,
        }
    }

    /// Queue a task. A full bounded queue rejects it on its own handle.
    pub fn enqueue(
        &mut self,
        task: Task,
    ) -> Result<(), TaskError> {
        self.queue.push(task).map_err(|task| {
            let error = TaskError::QueueFull {
                capacity: self.queue.capacity().unwrap_or_default(),
            };
            task.reject(error.clone());
            error
        })
    }

    /// Pop the head of the queue onto the lowest-index idle slot.
    pub fn next_assignment(&mut self) -> Option<Assignment> {
        if self.queue.is_empty() {
            return None;
        }
        let slot = self.slots.iter().position(|s| !s.is_busy())?;
        let task = self.queue.pop_front()?;
        let (envelope, completer) = task.into_parts();

        self.slots[slot].assigned = Some(InFlight {
            id: envelope.id,
            kind: envelope.kind,
            completer,
        });

        Some(Assignment { slot, envelope })
    }

    /// Route a worker's result to the handle of the task `slot` was given.
    ///
    /// The reported `id` must match the slot's assignment exactly; anything
    /// else is a [`ProtocolViolation`] and nothing is settled.
    pub fn complete(
        &mut self,
        slot: usize,
        id: TaskId,
        outcome: Result<Value, TaskFault>,
    ) -> Result<(), ProtocolViolation> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or(ProtocolViolation::UnknownSlot { slot })?;

        match entry.assigned.as_ref().map(|f| f.id) {
            None => return Err(ProtocolViolation::UnknownTask { slot, id }),
            Some(expected) if expected != id => {
                return Err(ProtocolViolation::MismatchedTask {
                    slot,
                    expected,
                    got: id,
                })
            }
            Some(_) => {}
        }

        // Checked above.
        if let Some(in_flight) = entry.assigned.take() {
            let kind = in_flight.kind;
            in_flight.completer.settle(
                outcome.map_err(|cause| TaskError::TaskExecutionFault { kind, cause }),
            );
        }
        Ok(())
    }

    /// Reject every queued task with `error`. Returns how many were rejected.
    pub fn reject_queued(
        &mut self,
        error: &TaskError,
    ) -> usize {
        let mut count = 0;
        for task in self.queue.drain() {
            task.reject(error.clone());
            count += 1;
        }
        count
    }

    /// Reject every in-flight task with `error` and free its slot.
    pub fn abandon_in_flight(
        &mut self,
        error: &TaskError,
    ) -> usize {
        let mut count = 0;
        for slot in &mut self.slots {
            if let Some(in_flight) = slot.assigned.take() {
                in_flight.completer.settle(Err(error.clone()));
                count += 1;
            }
        }
        count
    }

    /// Number of busy slots.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_busy()).count()
    }

    /// Number of queued tasks.
    #[inline]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Number of slots.
    #[inline]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Slot bookkeeping, by index.
    #[inline]
    pub fn slot(
        &self,
        index: usize,
    ) -> Option<&WorkerSlot> {
        self.slots.get(index)
    }

    /// No queued and no in-flight work.
    #[inline]
    pub fn is_quiescent(&self) -> bool {
        self.queue.is_empty() && self.active_count() == 0
    }
}
