//! Shared task queue and result store.
//!
//! Both are explicitly owned, lock-guarded structures handed by clone into
//! worker loops. Each pool instance gets its own independent set; there is
//! no ambient global state. A poisoned lock here means a worker panicked
//! while holding it, which is a programming invariant violation; it is the
//! one failure that is allowed to abort the process.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::task::{ProbeResult, Task};

/// Thread-safe FIFO of pending tasks.
///
/// A task lives in exactly one place at a time: this queue, in flight inside
/// the worker that popped it, or as a terminal result in the store. Workers
/// never put tasks back on their own; [`TaskQueue::requeue_front`] exists
/// solely for the explicit user-initiated cancellation flow.
#[derive(Clone, Default)]
pub struct TaskQueue {
    inner: Arc<Mutex<VecDeque<Task>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut queue = self.inner.lock().expect("task queue lock poisoned");
        queue.extend(tasks);
    }

    /// Pop the next pending task. `None` means the batch is drained and the
    /// calling worker should wind down.
    pub fn pop(&self) -> Option<Task> {
        self.inner
            .lock()
            .expect("task queue lock poisoned")
            .pop_front()
    }

    /// Return an in-flight task to the head of the queue. Cancellation flow
    /// only.
    pub fn requeue_front(&self, task: Task) {
        self.inner
            .lock()
            .expect("task queue lock poisoned")
            .push_front(task);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("task queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append-only collection of terminal results, one per task.
#[derive(Clone, Default)]
pub struct ResultStore {
    inner: Arc<Mutex<Vec<ProbeResult>>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: ProbeResult) {
        self.inner
            .lock()
            .expect("result store lock poisoned")
            .push(result);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("result store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (valid, everything else) counts.
    pub fn counts(&self) -> (usize, usize) {
        let results = self.inner.lock().expect("result store lock poisoned");
        let valid = results.iter().filter(|r| r.outcome.is_valid()).count();
        (valid, results.len() - valid)
    }

    pub fn snapshot(&self) -> Vec<ProbeResult> {
        self.inner
            .lock()
            .expect("result store lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Outcome;

    #[test]
    fn queue_is_fifo() {
        let queue = TaskQueue::new();
        queue.seed([Task::new("a@b.com"), Task::new("c@d.com")]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().email, "a@b.com");
        assert_eq!(queue.pop().unwrap().email, "c@d.com");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn requeue_front_puts_task_back_at_head() {
        let queue = TaskQueue::new();
        queue.seed([Task::new("a@b.com"), Task::new("c@d.com")]);
        let task = queue.pop().unwrap();
        queue.requeue_front(task);
        assert_eq!(queue.pop().unwrap().email, "a@b.com");
    }

    #[test]
    fn store_counts_split_valid_from_rest() {
        let store = ResultStore::new();
        store.push(ProbeResult::new(
            "a@b.com",
            Outcome::Valid {
                reason: "password_page".into(),
            },
            None,
            None,
        ));
        store.push(ProbeResult::new("b@c.com", Outcome::Timeout, None, None));
        store.push(ProbeResult::new(
            "c@d.com",
            Outcome::Error {
                message: "detected after 2 retries".into(),
            },
            None,
            None,
        ));
        assert_eq!(store.counts(), (1, 2));
    }

    #[test]
    fn clones_share_state() {
        let queue = TaskQueue::new();
        let other = queue.clone();
        queue.seed([Task::new("a@b.com")]);
        assert_eq!(other.len(), 1);
        assert!(other.pop().is_some());
        assert!(queue.is_empty());
    }
}
