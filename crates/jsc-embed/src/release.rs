//! Deferred unprotect queue
//!
//! Wrappers can be dropped on any thread, but unprotecting a value is an
//! engine call and engine calls only happen on the context's worker. Dropped
//! handles are therefore parked here and unprotected in batches: on the
//! worker's background tick once the queue grows past its threshold, or
//! unconditionally on teardown.
//!
//! ```
//! use jsc_embed::{DeferredReleaseQueue, NativeHandle};
//!
//! let queue = DeferredReleaseQueue::new(2);
//! queue.mark_for_release(NativeHandle::from_raw(0x10));
//! queue.mark_for_release(NativeHandle::from_raw(0x10));
//! assert_eq!(queue.len(), 1);
//! ```

use indexmap::IndexSet;
use parking_lot::Mutex;

use crate::engine::NativeHandle;

/// Set of handles waiting to be unprotected
///
/// Entries are unique and keep insertion order, so a handle marked twice is
/// still unprotected once, and drains run oldest first.
pub struct DeferredReleaseQueue {
    pending: Mutex<IndexSet<NativeHandle>>,
    threshold: usize,
}

impl DeferredReleaseQueue {
    /// Create a queue that drains once more than `threshold` handles are pending
    pub fn new(threshold: usize) -> Self {
        Self {
            pending: Mutex::new(IndexSet::new()),
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Queue `handle` for unprotect. Safe to call from any thread.
    ///
    /// Returns `false` if the handle was already pending.
    pub fn mark_for_release(&self, handle: NativeHandle) -> bool {
        if handle.is_null() {
            return false;
        }
        let mut pending = self.pending.lock();
        let inserted = pending.insert(handle);
        tracing::trace!(%handle, pending = pending.len(), inserted, "Marked for release");
        inserted
    }

    /// Withdraw a pending handle so its protect can be reused
    pub fn cancel(&self, handle: NativeHandle) -> bool {
        self.pending.lock().swap_remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Drain when more than `threshold` handles are pending.
    ///
    /// `unprotect` runs for every pending handle while the queue lock is
    /// held, so concurrent marks wait for the batch to finish. Must be called
    /// on the worker thread. Returns the number of handles released.
    pub fn drain_if_threshold(&self, unprotect: impl FnMut(NativeHandle)) -> usize {
        let mut pending = self.pending.lock();
        if pending.len() <= self.threshold {
            return 0;
        }
        Self::release_all(&mut pending, unprotect)
    }

    /// Unconditionally unprotect every pending handle
    pub fn drain(&self, unprotect: impl FnMut(NativeHandle)) -> usize {
        let mut pending = self.pending.lock();
        Self::release_all(&mut pending, unprotect)
    }

    /// Remove and return every pending handle without releasing them
    pub(crate) fn take_all(&self) -> Vec<NativeHandle> {
        self.pending.lock().drain(..).collect()
    }

    fn release_all(
        pending: &mut IndexSet<NativeHandle>,
        mut unprotect: impl FnMut(NativeHandle),
    ) -> usize {
        let count = pending.len();
        for handle in pending.drain(..) {
            unprotect(handle);
        }
        if count > 0 {
            tracing::trace!(count, "Drained release queue");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(raw: usize) -> NativeHandle {
        NativeHandle::from_raw(raw)
    }

    #[test]
    fn test_mark_is_idempotent() {
        let queue = DeferredReleaseQueue::new(1);
        assert!(queue.mark_for_release(h(1)));
        assert!(!queue.mark_for_release(h(1)));
        assert!(queue.mark_for_release(h(2)));

        let mut released = Vec::new();
        assert_eq!(queue.drain_if_threshold(|handle| released.push(handle)), 2);
        assert_eq!(released, vec![h(1), h(2)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let queue = DeferredReleaseQueue::new(2);
        queue.mark_for_release(h(1));
        queue.mark_for_release(h(2));

        let mut calls = 0;
        assert_eq!(queue.drain_if_threshold(|_| calls += 1), 0);
        assert_eq!(calls, 0);

        queue.mark_for_release(h(3));
        assert_eq!(queue.drain_if_threshold(|_| calls += 1), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_cancel() {
        let queue = DeferredReleaseQueue::new(10);
        queue.mark_for_release(h(7));
        assert_eq!(queue.len(), 1);
        assert!(queue.cancel(h(7)));
        assert!(!queue.cancel(h(7)));

        let mut released = Vec::new();
        queue.drain(|handle| released.push(handle));
        assert!(released.is_empty());
    }

    #[test]
    fn test_null_is_ignored() {
        let queue = DeferredReleaseQueue::new(1);
        assert!(!queue.mark_for_release(NativeHandle::NULL));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_releases_each_once() {
        let queue = DeferredReleaseQueue::new(100);
        for raw in [3, 1, 3, 2, 1] {
            queue.mark_for_release(h(raw));
        }
        let mut released = Vec::new();
        assert_eq!(queue.drain(|handle| released.push(handle)), 3);
        assert_eq!(released, vec![h(3), h(1), h(2)]);
        assert_eq!(queue.drain(|handle| released.push(handle)), 0);
    }

    #[test]
    fn test_zero_threshold_clamps() {
        let queue = DeferredReleaseQueue::new(0);
        assert_eq!(queue.threshold(), 1);
    }
}
