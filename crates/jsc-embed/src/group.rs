//! Context groups
//!
//! Contexts created from one [`EmbeddingContextGroup`] live in the same
//! native group and share a single worker thread, so their engine calls are
//! serialized together.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::EmbedConfig;
use crate::context::EmbeddingContext;
use crate::engine::{NativeEngine, NativeHandle};
use crate::error::{EmbedError, EmbedResult};
use crate::queue::{QueueStatsSnapshot, SerialWorkQueue};

struct GroupInner {
    engine: Arc<dyn NativeEngine>,
    handle: NativeHandle,
    queue: Arc<SerialWorkQueue>,
    config: EmbedConfig,
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        let engine = self.engine.clone();
        let group = self.handle;
        match self.queue.run_sync(move || {
            engine.release_group(group);
            Ok(())
        }) {
            Ok(()) => debug!(group = %group, "Group released"),
            Err(e) => warn!(group = %group, error = %e, "Group release failed"),
        }
    }
}

/// Native context group plus the worker shared by its contexts
#[derive(Clone)]
pub struct EmbeddingContextGroup {
    inner: Arc<GroupInner>,
}

impl EmbeddingContextGroup {
    pub fn new(engine: Arc<dyn NativeEngine>) -> EmbedResult<Self> {
        Self::with_config(engine, EmbedConfig::default())
    }

    pub fn with_config(engine: Arc<dyn NativeEngine>, config: EmbedConfig) -> EmbedResult<Self> {
        let queue = Arc::new(SerialWorkQueue::new(&config)?);
        let creator = engine.clone();
        let handle = queue.run_sync(move || {
            creator.initialize();
            Ok(creator.create_group())
        })?;
        if handle.is_null() {
            return Err(EmbedError::context_creation("engine returned a null group"));
        }

        debug!(group = %handle, "Group created");
        Ok(Self::adopt(engine, handle, queue, config))
    }

    /// Wrap an already retained native group running on `queue`
    pub(crate) fn adopt(
        engine: Arc<dyn NativeEngine>,
        handle: NativeHandle,
        queue: Arc<SerialWorkQueue>,
        config: EmbedConfig,
    ) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                engine,
                handle,
                queue,
                config,
            }),
        }
    }

    /// Create a context in this group, running on the group's worker
    pub fn create_context(&self) -> EmbedResult<EmbeddingContext> {
        EmbeddingContext::build(
            self.inner.engine.clone(),
            self.inner.queue.clone(),
            false,
            Some(self.clone()),
            self.inner.config.clone(),
        )
    }

    pub fn handle(&self) -> NativeHandle {
        self.inner.handle
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.inner.config
    }

    /// Statistics of the shared worker
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.inner.queue.stats().snapshot()
    }
}

impl PartialEq for EmbeddingContextGroup {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for EmbeddingContextGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingContextGroup")
            .field("handle", &self.inner.handle)
            .finish()
    }
}
