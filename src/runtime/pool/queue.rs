//! Task queue for the pool.
//!
//! Strict FIFO backlog. The queue is owned by the dispatcher and only ever
//! mutated from its event loop, so it carries no lock of its own.

use std::collections::VecDeque;

use super::task::{Task, TaskId};

/// FIFO backlog of tasks waiting for an idle worker.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: VecDeque<Task>,
    /// `None` means unbounded.
    capacity: Option<usize>,
}

impl TaskQueue {
    /// Create a new unbounded queue.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue that holds at most `capacity` tasks.
    #[inline]
    pub fn bounded(capacity: usize) -> Self {
        Self {
            inner: VecDeque::with_capacity(capacity),
            capacity: Some(capacity),
        }
    }

    /// Push a task to the back of the queue.
    ///
    /// A full bounded queue hands the task back untouched; nothing already
    /// queued is ever evicted to make room.
    #[inline]
    pub fn push(
        &mut self,
        task: Task,
    ) -> Result<(), Task> {
        if self.is_full() {
            return Err(task);
        }
        self.inner.push_back(task);
        Ok(())
    }

    /// Pop the oldest task.
    #[inline]
    pub fn pop_front(&mut self) -> Option<Task> {
        self.inner.pop_front()
    }

    /// Id of the oldest task without removing it.
    #[inline]
    pub fn peek_id(&self) -> Option<TaskId> {
        self.inner.front().map(Task::id)
    }

    /// Remove every queued task, oldest first.
    #[inline]
    pub fn drain(&mut self) -> impl Iterator<Item = Task> + '_ {
        self.inner.drain(..)
    }

    /// Get the number of tasks in the queue.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Maximum number of queued tasks, if bounded.
    #[inline]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Whether a push would be refused.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.capacity.is_some_and(|cap| self.inner.len() >= cap)
    }
}
