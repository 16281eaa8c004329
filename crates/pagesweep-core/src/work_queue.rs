//! Lock-free queue handing page numbers and partition keys to workers

use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed list of work items claimed by index.
///
/// [`close()`](WorkQueue::close) stops further claims without touching items
/// already handed out, which is how deadlines and shutdown cancel pending work.
pub struct WorkQueue<S> {
    items: Vec<S>,
    cursor: AtomicUsize,
}

impl<S> WorkQueue<S> {
    pub fn new(items: Vec<S>) -> Self {
        Self {
            items,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Claim the next item, or `None` once drained or closed
    pub fn next(&self) -> Option<&S> {
        let i = self.cursor.fetch_add(1, Ordering::AcqRel);
        self.items.get(i)
    }

    /// No further item will be handed out.
    pub fn close(&self) {
        self.cursor.fetch_max(self.items.len(), Ordering::AcqRel);
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }
}
