//! Select tables: how a polling task parks itself on many queues.
//!
//! During the readiness scan each pollable object registers the caller
//! on the wait queues it would wake on state change. If nothing was
//! ready, the poller sleeps; any of those queues firing makes it rescan.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::sched::WaitQueue;
use crate::task::Task;

/// The set of wait queues one poll pass subscribed to.
pub struct SelectTable {
    task: Arc<Task>,
    queues: Vec<Arc<WaitQueue>>,
}

impl SelectTable {
    /// A table registering entries for `task`.
    pub fn new(task: Arc<Task>) -> Self {
        Self {
            task,
            queues: Vec::new(),
        }
    }

    /// Subscribes the polling task to `queue`.
    pub fn register(&mut self, queue: &Arc<WaitQueue>) {
        queue.enqueue_poll(self.task.clone());
        self.queues.push(queue.clone());
    }

    /// Unsubscribes from every queue (after wake-up or timeout).
    pub fn detach(&mut self) {
        for queue in self.queues.drain(..) {
            queue.remove(&self.task);
        }
    }

    /// Number of subscribed queues.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// True when no queue was registered.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

impl Drop for SelectTable {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_detach() {
        let task = Task::new(1, "poller");
        let q1 = Arc::new(WaitQueue::new());
        let q2 = Arc::new(WaitQueue::new());

        let mut table = SelectTable::new(task.clone());
        table.register(&q1);
        table.register(&q2);
        assert!(q1.contains(&task));
        assert!(q2.contains(&task));

        table.detach();
        assert!(q1.is_empty());
        assert!(q2.is_empty());
    }

    #[test]
    fn drop_detaches() {
        let task = Task::new(2, "poller");
        let q = Arc::new(WaitQueue::new());
        {
            let mut table = SelectTable::new(task.clone());
            table.register(&q);
            assert_eq!(q.len(), 1);
        }
        assert!(q.is_empty());
    }
}
