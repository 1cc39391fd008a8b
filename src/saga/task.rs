//! The saga task tree: cooperative cancellation propagated to every
//! descendant (spec §4.7's "Task tree").
//!
//! Grounded on the teacher's query-cycle bookkeeping in `DependencyGraph`
//! (a parent/children relation used to detect and report cross-task
//! cycles), reused here for ordinary parent/child tracking plus a
//! cancellation flag each descendant inherits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

/// A node in a saga's task tree.
#[derive(Clone)]
pub struct Task {
    id: Uuid,
    name: Arc<str>,
    cancelled: Arc<AtomicBool>,
    completed: Arc<AtomicBool>,
    notify: Arc<Notify>,
    children: Arc<Mutex<Vec<Task>>>,
}

impl Task {
    pub fn root(name: &str) -> Self {
        Task {
            id: Uuid::new_v4(),
            name: Arc::from(name),
            cancelled: Arc::new(AtomicBool::new(false)),
            completed: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            children: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates a child of this task and tracks it for transitive
    /// cancellation.
    pub fn child(&self, name: &str) -> Task {
        let child = Task::root(name);
        self.children.lock().push(child.clone());
        child
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Marks this task and every descendant cancelled. Idempotent;
    /// cancelling a completed task is a no-op.
    pub fn cancel(&self) {
        if self.completed.load(Ordering::SeqCst) {
            return;
        }
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
        let children: Vec<Task> = self.children.lock().clone();
        for child in children {
            child.cancel();
        }
    }

    /// Marks this task completed; has no further effect on children.
    pub fn complete(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    /// Resolves the next time this task is cancelled, or immediately if
    /// it already is — used to race cancellation against `call`/`delay`.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_to_descendants() {
        let root = Task::root("root");
        let child = root.child("child");
        let grandchild = child.child("grandchild");

        root.cancel();
        assert!(root.is_cancelled());
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn cancelling_completed_task_is_noop() {
        let task = Task::root("t");
        task.complete();
        task.cancel();
        assert!(!task.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let task = Task::root("t");
        task.cancel();
        task.cancel();
        assert!(task.is_cancelled());
    }
}
