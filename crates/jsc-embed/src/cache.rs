//! Identity cache: one wrapper per live native object
//!
//! Entries map a native handle to a weak reference to its wrapper plus the
//! generation the wrapper was created with. A wrapper that is being dropped
//! can no longer be upgraded, so its entry is stale until the wrapper's
//! eviction runs; a new wrapper created in that window replaces the entry
//! and takes over the engine protect, and the late eviction sees a newer
//! generation and does nothing.
//!
//! The cache lock is never held across an engine call. It is taken before
//! the release queue's lock, never after.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::engine::NativeHandle;
use crate::release::DeferredReleaseQueue;
use crate::value::{JsObject, ObjectInner};

struct CacheEntry {
    object: Weak<ObjectInner>,
    generation: u64,
}

/// What the caller owes the engine for a wrapper returned by `insert_with`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protection {
    /// An existing live wrapper was returned
    Held,
    /// The new wrapper took over a protect the layer already holds
    Adopted,
    /// The handle must be protected before the wrapper escapes the worker
    Required,
}

pub(crate) struct IdentityCache {
    entries: Mutex<HashMap<NativeHandle, CacheEntry>>,
    generation: AtomicU64,
}

impl IdentityCache {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(capacity)),
            generation: AtomicU64::new(0),
        }
    }

    /// The live wrapper for `handle`, if any
    pub(crate) fn get(&self, handle: NativeHandle) -> Option<JsObject> {
        let entries = self.entries.lock();
        entries
            .get(&handle)
            .and_then(|entry| entry.object.upgrade())
            .map(JsObject::from_inner)
    }

    /// Return the live wrapper for `handle` or insert one built by `build`.
    ///
    /// `build` receives the new entry's generation and runs under the cache
    /// lock, so it must not call the engine.
    pub(crate) fn insert_with(
        &self,
        handle: NativeHandle,
        releases: &DeferredReleaseQueue,
        build: impl FnOnce(u64) -> Arc<ObjectInner>,
    ) -> (JsObject, Protection) {
        let mut entries = self.entries.lock();

        let stale = match entries.get(&handle) {
            Some(entry) => match entry.object.upgrade() {
                Some(live) => return (JsObject::from_inner(live), Protection::Held),
                None => true,
            },
            None => false,
        };

        let protection = if stale {
            tracing::trace!(%handle, "Replacing stale cache entry");
            Protection::Adopted
        } else if releases.cancel(handle) {
            tracing::trace!(%handle, "Reclaimed pending release");
            Protection::Adopted
        } else {
            Protection::Required
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let inner = build(generation);
        entries.insert(
            handle,
            CacheEntry {
                object: Arc::downgrade(&inner),
                generation,
            },
        );
        (JsObject::from_inner(inner), protection)
    }

    /// Called when a wrapper dies, on whatever thread dropped it.
    ///
    /// Removes the entry and queues the handle for unprotect only if the
    /// entry still belongs to that wrapper.
    pub(crate) fn evict(
        &self,
        handle: NativeHandle,
        generation: u64,
        releases: &DeferredReleaseQueue,
    ) {
        let mut entries = self.entries.lock();
        match entries.get(&handle) {
            Some(entry) if entry.generation == generation => {
                entries.remove(&handle);
                releases.mark_for_release(handle);
            }
            _ => tracing::trace!(%handle, generation, "Eviction superseded"),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
