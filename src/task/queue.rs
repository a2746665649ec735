use std::{collections::VecDeque, time::Duration};

use parking_lot::{Condvar, Mutex};

use super::BoxedTask;
use crate::error::TaskError;

/// FIFO of pending tasks guarded by one mutex/condvar pair.
///
/// Consumers block with a timeout so that they can notice stop flags; the
/// timeout bounds shutdown latency. A closed queue refuses signalled pushes
/// under the same lock that guards the tasks, so nothing is accepted after
/// [`close`](TaskQueue::close) returns.
#[derive(Default)]
pub struct TaskQueue {
    slots: Mutex<Slots>,
    cond: Condvar,
}

#[derive(Default)]
struct Slots {
    tasks: VecDeque<BoxedTask>,
    closed: bool,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends without waking anyone. Returns the queue depth after the push.
    pub fn push(&self, task: BoxedTask) -> usize {
        let mut slots = self.slots.lock();
        slots.tasks.push_back(task);
        slots.tasks.len()
    }

    /// Appends and wakes consumers: one if the queue was empty before, all of
    /// them if more than one task is now waiting.
    ///
    /// Fails with [`TaskError::Stopped`] while the queue is closed.
    pub fn push_and_signal(
        &self,
        task: BoxedTask,
        capacity: Option<usize>,
    ) -> Result<usize, TaskError> {
        let mut slots = self.slots.lock();
        if slots.closed {
            return Err(TaskError::Stopped);
        }
        if let Some(capacity) = capacity {
            if slots.tasks.len() >= capacity {
                return Err(TaskError::QueueFull { capacity });
            }
        }
        slots.tasks.push_back(task);
        let depth = slots.tasks.len();
        self.signal(depth > 1);
        Ok(depth)
    }

    /// Refuses further [`push_and_signal`](TaskQueue::push_and_signal) calls.
    /// Tasks already queued stay queued.
    pub fn close(&self) {
        self.slots.lock().closed = true;
    }

    pub fn reopen(&self) {
        self.slots.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.slots.lock().closed
    }

    pub fn signal(&self, all: bool) {
        if all {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    pub fn pop(&self) -> Option<BoxedTask> {
        self.slots.lock().tasks.pop_front()
    }

    /// Pops the oldest task, waiting up to `timeout` if the queue is empty.
    ///
    /// A wakeup does not guarantee a task: another consumer may have taken it.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<BoxedTask> {
        let mut slots = self.slots.lock();
        if slots.tasks.is_empty() {
            self.cond.wait_for(&mut slots, timeout);
        }
        slots.tasks.pop_front()
    }

    /// Waits up to `timeout` for a signal, then removes up to `batch` tasks
    /// (all of them with `None`).
    pub fn wait_batch(&self, batch: Option<usize>, timeout: Duration) -> Vec<BoxedTask> {
        let mut slots = self.slots.lock();
        if slots.tasks.is_empty() {
            self.cond.wait_for(&mut slots, timeout);
        }
        take_front(&mut slots.tasks, batch)
    }

    /// Removes up to `batch` tasks (all of them with `None`) without waiting.
    pub fn drain(&self, batch: Option<usize>) -> Vec<BoxedTask> {
        take_front(&mut self.slots.lock().tasks, batch)
    }

    /// Drops every pending task and returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut slots = self.slots.lock();
        let discarded = slots.tasks.len();
        slots.tasks.clear();
        discarded
    }

    pub fn len(&self) -> usize {
        self.slots.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().tasks.is_empty()
    }
}

fn take_front(tasks: &mut VecDeque<BoxedTask>, batch: Option<usize>) -> Vec<BoxedTask> {
    let n = batch.map_or(tasks.len(), |b| b.min(tasks.len()));
    tasks.drain(..n).collect()
}
