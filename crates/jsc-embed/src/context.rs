//! Embedding context
//!
//! An [`EmbeddingContext`] owns one native global context and routes every
//! engine call through its [`SerialWorkQueue`]. It is a cheap handle: clones
//! share state, and the native context is released once the last clone and
//! the last object wrapper from it are gone.
//!
//! # Exception policy
//!
//! Operations that can raise a JavaScript exception (evaluation, syntax
//! checks, property access, calls, construction) return
//! [`EmbedError::Script`] unless an exception handler is installed. With a
//! handler, the error is delivered to it and the operation returns its
//! default value (`Value::Undefined` for evaluation). Errors raised on other
//! threads while the handler runs are delivered too. An exception raised
//! from inside the handler, on the thread running it, is returned to the
//! handler's caller instead of re-entering it.
//!
//! # Host functions
//!
//! [`EmbeddingContext::register_function`] exposes a Rust closure to scripts.
//! It runs on the worker in the middle of the calling script, so it may use
//! the context and its objects freely. An `Err` it returns is thrown into
//! the script; if the script does not catch it, it reaches the caller of the
//! outer operation through the exception policy like any other exception.
//!
//! # Example
//!
//! ```
//! use jsc_embed::{EmbeddingContext, MockEngine, Value};
//! use std::sync::Arc;
//!
//! let ctx = EmbeddingContext::new(Arc::new(MockEngine::new())).unwrap();
//! assert_eq!(ctx.evaluate("1 + 1").unwrap(), Value::Number(2.0));
//! ```

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::cache::{IdentityCache, Protection};
use crate::config::EmbedConfig;
use crate::engine::{HostFunction, JsType, NativeEngine, NativeHandle, NativeResult, Thrown};
use crate::error::{EmbedError, EmbedResult, ScriptError};
use crate::group::EmbeddingContextGroup;
use crate::queue::{QueueStatsSnapshot, SerialWorkQueue};
use crate::release::DeferredReleaseQueue;
use crate::value::{JsObject, ObjectInner, ObjectKind, Value};

type ExceptionHandler = Arc<dyn Fn(ScriptError) + Send + Sync>;
type HostCallback = dyn Fn(&[Value]) -> EmbedResult<Value> + Send + Sync;

/// Threads currently inside this context's exception handler
#[derive(Default)]
struct Delivering(Mutex<HashSet<ThreadId>>);

impl Delivering {
    /// Mark the current thread; `None` if it is already delivering
    fn enter(&self) -> Option<DeliveryGuard<'_>> {
        let thread = thread::current().id();
        self.0
            .lock()
            .insert(thread)
            .then(|| DeliveryGuard { owner: self, thread })
    }
}

struct DeliveryGuard<'a> {
    owner: &'a Delivering,
    thread: ThreadId,
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        self.owner.0.lock().remove(&self.thread);
    }
}

/// Options for [`EmbeddingContext::evaluate_with`]
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// `this` for the script; the global object when `None`
    pub this: Option<JsObject>,
    /// Reported in exceptions and stack traces
    pub source_url: Option<String>,
    /// Line number of the first line of the script
    pub starting_line: i32,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            this: None,
            source_url: None,
            starting_line: 1,
        }
    }
}

impl EvalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn this(mut self, this: JsObject) -> Self {
        self.this = Some(this);
        self
    }

    pub fn source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn starting_line(mut self, line: i32) -> Self {
        self.starting_line = line;
        self
    }
}

/// State shared by a context's handles and its object wrappers
pub(crate) struct ContextShared {
    pub(crate) engine: Arc<dyn NativeEngine>,
    pub(crate) handle: NativeHandle,
    pub(crate) cache: IdentityCache,
    pub(crate) releases: DeferredReleaseQueue,
    /// Shared with the implicit group and its contexts once `group()` has
    /// adopted it; the worker stops when the last holder lets go
    queue: Arc<SerialWorkQueue>,
    owns_queue: bool,
    tick_id: u64,
    handler: Mutex<Option<ExceptionHandler>>,
    delivering: Delivering,
    group: Option<EmbeddingContextGroup>,
    config: EmbedConfig,
    closed: AtomicBool,
}

impl ContextShared {
    /// Run `operation` on the worker without applying the exception policy
    pub(crate) fn run<T, F>(self: &Arc<Self>, operation: F) -> EmbedResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<ContextShared>) -> EmbedResult<T> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EmbedError::QueueClosed);
        }
        let shared = self.clone();
        self.queue.run_sync(move || {
            if shared.closed.load(Ordering::SeqCst) {
                return Err(EmbedError::QueueClosed);
            }
            operation(&shared)
        })
    }

    /// Run `operation` on the worker and apply the exception policy
    pub(crate) fn execute<T, F>(self: &Arc<Self>, operation: F) -> EmbedResult<T>
    where
        T: Default + Send + 'static,
        F: FnOnce(&Arc<ContextShared>) -> EmbedResult<T> + Send + 'static,
    {
        let result = self.run(operation);
        self.settle(result)
    }

    /// Deliver a script error to the installed handler, if any
    fn settle<T: Default>(&self, result: EmbedResult<T>) -> EmbedResult<T> {
        let error = match result {
            Err(EmbedError::Script(error)) => error,
            other => return other,
        };

        let Some(handler) = self.handler.lock().clone() else {
            return Err(EmbedError::Script(error));
        };
        let Some(_guard) = self.delivering.enter() else {
            trace!(name = %error.name, "Exception raised inside handler");
            return Err(EmbedError::Script(error));
        };

        trace!(name = %error.name, "Delivering exception to handler");
        handler(*error);
        Ok(T::default())
    }

    /// Wrapper for `handle`, through the identity cache. Worker thread only.
    pub(crate) fn resolve(self: &Arc<Self>, handle: NativeHandle, create: bool) -> Option<JsObject> {
        let handle = handle.non_null()?;
        if let Some(object) = self.cache.get(handle) {
            return Some(object);
        }
        if !create {
            return None;
        }

        let kind = self.probe_kind(handle);
        let (object, protection) = self.cache.insert_with(handle, &self.releases, |generation| {
            Arc::new(ObjectInner {
                handle,
                kind,
                generation,
                context: self.clone(),
            })
        });
        if protection == Protection::Required {
            self.engine.protect(self.handle, handle);
        }
        Some(object)
    }

    fn probe_kind(&self, handle: NativeHandle) -> ObjectKind {
        if self.engine.is_array(self.handle, handle) {
            ObjectKind::Array
        } else if self.engine.is_typed_array(self.handle, handle) {
            ObjectKind::TypedArray
        } else if self.engine.is_function(self.handle, handle) {
            ObjectKind::Function
        } else {
            ObjectKind::Object
        }
    }

    /// Convert an engine value. Worker thread only.
    pub(crate) fn value_from_handle(
        self: &Arc<Self>,
        handle: NativeHandle,
        operation: &str,
    ) -> EmbedResult<Value> {
        if handle.is_null() {
            return Err(EmbedError::engine_handle(operation));
        }
        Ok(match self.engine.value_type(self.handle, handle) {
            JsType::Undefined => Value::Undefined,
            JsType::Null => Value::Null,
            JsType::Boolean => Value::Boolean(self.engine.value_to_boolean(self.handle, handle)),
            JsType::Number => Value::Number(
                self.engine
                    .value_to_number(self.handle, handle)
                    .map_err(|thrown| self.script_error(thrown))?,
            ),
            JsType::String => Value::String(
                self.engine
                    .value_to_string(self.handle, handle)
                    .map_err(|thrown| self.script_error(thrown))?,
            ),
            JsType::Symbol => Value::Symbol,
            JsType::Object => Value::Object(
                self.resolve(handle, true)
                    .ok_or_else(|| EmbedError::engine_handle(operation))?,
            ),
        })
    }

    /// Engine handle for a value. Worker thread only.
    pub(crate) fn handle_for(self: &Arc<Self>, value: &Value) -> EmbedResult<NativeHandle> {
        let ctx = self.handle;
        Ok(match value {
            Value::Undefined => self.engine.make_undefined(ctx),
            Value::Null => self.engine.make_null(ctx),
            Value::Boolean(b) => self.engine.make_boolean(ctx, *b),
            Value::Number(n) => self.engine.make_number(ctx, *n),
            Value::String(s) => self.engine.make_string(ctx, s),
            Value::Symbol => {
                return Err(EmbedError::type_error("transferable value", "symbol"));
            }
            Value::Object(object) => {
                if !object.shares_context(self) {
                    return Err(EmbedError::type_error(
                        "object from this context",
                        "object from another context",
                    ));
                }
                object.handle()
            }
        })
    }

    /// Build a [`ScriptError`] from a thrown value. Worker thread only.
    pub(crate) fn script_error(self: &Arc<Self>, thrown: Thrown) -> EmbedError {
        let value = match self.value_from_handle(thrown.0, "exception") {
            Ok(value) => value,
            Err(err) => return err,
        };

        let error = match &value {
            Value::Object(object) => {
                let object = object.handle();
                let name = self
                    .string_property(object, "name")
                    .unwrap_or_else(|| "Error".to_string());
                let message = self.string_property(object, "message").unwrap_or_default();
                let mut error = ScriptError::new(name, message, value.clone());
                error.stack = self.string_property(object, "stack").filter(|s| !s.is_empty());
                error.source_url = self.string_property(object, "sourceURL");
                error.line = self.line_property(object, "line");
                error.column = self.line_property(object, "column");
                error
            }
            other => ScriptError::new("Error", other.to_string(), value.clone()),
        };
        error.into()
    }

    fn property(&self, object: NativeHandle, name: &str) -> Option<(NativeHandle, JsType)> {
        let value = self.engine.get_property(self.handle, object, name).ok()?;
        let value = value.non_null()?;
        match self.engine.value_type(self.handle, value) {
            JsType::Undefined | JsType::Null => None,
            kind => Some((value, kind)),
        }
    }

    fn string_property(&self, object: NativeHandle, name: &str) -> Option<String> {
        let (value, _) = self.property(object, name)?;
        self.engine.value_to_string(self.handle, value).ok()
    }

    fn line_property(&self, object: NativeHandle, name: &str) -> Option<u32> {
        match self.property(object, name)? {
            (value, JsType::Number) => {
                let n = self.engine.value_to_number(self.handle, value).ok()?;
                (n.is_finite() && n >= 0.0).then_some(n as u32)
            }
            _ => None,
        }
    }

    fn evaluate_on_worker(
        self: &Arc<Self>,
        source: &str,
        options: &EvalOptions,
    ) -> EmbedResult<Value> {
        let this = match &options.this {
            Some(this) => self.handle_for(&Value::Object(this.clone()))?,
            None => NativeHandle::NULL,
        };
        let result = self
            .engine
            .evaluate(
                self.handle,
                source,
                this,
                options.source_url.as_deref(),
                options.starting_line,
            )
            .map_err(|thrown| self.script_error(thrown))?;
        self.value_from_handle(result, "evaluate")
    }

    /// Run a registered closure for a call from script. Worker thread only.
    fn invoke_host(
        self: &Arc<Self>,
        callback: &HostCallback,
        args: &[NativeHandle],
    ) -> NativeResult<NativeHandle> {
        let result = args
            .iter()
            .map(|&arg| self.value_from_handle(arg, "host function argument"))
            .collect::<EmbedResult<Vec<_>>>()
            .and_then(|args| callback(&args))
            .and_then(|value| self.handle_for(&value));
        result.map_err(|error| Thrown(self.thrown_for(error)))
    }

    /// The value to throw into script for a failed host call
    fn thrown_for(self: &Arc<Self>, error: EmbedError) -> NativeHandle {
        if let EmbedError::Script(script) = &error {
            if let Ok(thrown) = self.handle_for(&script.thrown) {
                return thrown;
            }
        }
        trace!(error = %error, "Host function failed");
        self.engine.make_error(self.handle, &error.to_string())
    }

    /// Background drain, run from the worker's tick
    fn drain_pending(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.releases
            .drain_if_threshold(|handle| self.engine.unprotect(self.handle, handle));
    }

    /// Unprotect everything pending and release the native context
    fn teardown(&self) {
        self.queue.unregister_tick(self.tick_id);

        let pending = self.releases.take_all();
        let count = pending.len();
        let engine = self.engine.clone();
        let ctx = self.handle;
        let result = self.queue.run_sync(move || {
            for handle in pending {
                engine.unprotect(ctx, handle);
            }
            engine.release_context(ctx);
            Ok(())
        });

        match result {
            Ok(()) => debug!(context = %ctx, released = count, "Context released"),
            Err(e) => warn!(context = %ctx, error = %e, "Context teardown failed"),
        }
    }
}

impl Drop for ContextShared {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.teardown();
        }
    }
}

/// Handle to an embedded JavaScript context
///
/// `Send + Sync + Clone`. Every method that touches the engine runs as a
/// synchronous unit on the context's worker thread.
#[derive(Clone)]
pub struct EmbeddingContext {
    shared: Arc<ContextShared>,
}

impl EmbeddingContext {
    /// Create a standalone context with its own worker thread
    pub fn new(engine: Arc<dyn NativeEngine>) -> EmbedResult<Self> {
        Self::with_config(engine, EmbedConfig::default())
    }

    pub fn with_config(engine: Arc<dyn NativeEngine>, config: EmbedConfig) -> EmbedResult<Self> {
        let queue = Arc::new(SerialWorkQueue::new(&config)?);
        Self::build(engine, queue, true, None, config)
    }

    pub(crate) fn build(
        engine: Arc<dyn NativeEngine>,
        queue: Arc<SerialWorkQueue>,
        owns_queue: bool,
        group: Option<EmbeddingContextGroup>,
        config: EmbedConfig,
    ) -> EmbedResult<Self> {
        let native_group = group.as_ref().map(EmbeddingContextGroup::handle);
        let creator = engine.clone();
        let handle = queue.run_sync(move || {
            creator.initialize();
            Ok(creator.create_context(native_group))
        })?;
        if handle.is_null() {
            return Err(EmbedError::context_creation("engine returned a null context"));
        }

        let shared = Arc::new_cyclic(|weak: &Weak<ContextShared>| {
            let weak = weak.clone();
            let tick_id = queue.register_tick(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.drain_pending();
                }
                true
            });
            ContextShared {
                engine,
                handle,
                cache: IdentityCache::with_capacity(config.initial_cache_capacity),
                releases: DeferredReleaseQueue::new(config.release_threshold),
                queue,
                owns_queue,
                tick_id,
                handler: Mutex::new(None),
                delivering: Delivering::default(),
                group,
                config,
                closed: AtomicBool::new(false),
            }
        });

        debug!(context = %handle, grouped = shared.group.is_some(), "Context created");
        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<ContextShared>) -> Self {
        Self { shared }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    /// The native context handle
    pub fn handle(&self) -> NativeHandle {
        self.shared.handle
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.shared.config
    }

    /// Evaluate a script with default options
    pub fn evaluate(&self, source: &str) -> EmbedResult<Value> {
        self.evaluate_with(source, EvalOptions::default())
    }

    /// Evaluate a script with an explicit `this`, source URL and first line
    pub fn evaluate_with(&self, source: &str, options: EvalOptions) -> EmbedResult<Value> {
        let source = source.to_string();
        self.shared
            .execute(move |shared| shared.evaluate_on_worker(&source, &options))
    }

    /// Evaluate without blocking the calling task
    pub async fn evaluate_async(&self, source: impl Into<String>) -> EmbedResult<Value> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(EmbedError::QueueClosed);
        }

        let (tx, rx) = oneshot::channel();
        let shared = self.shared.clone();
        let source = source.into();
        self.shared.queue.run_async(move || {
            let result = if shared.closed.load(Ordering::SeqCst) {
                Err(EmbedError::QueueClosed)
            } else {
                shared.evaluate_on_worker(&source, &EvalOptions::default())
            };
            let _ = tx.send(result);
        })?;

        let result = rx
            .await
            .map_err(|_| EmbedError::internal("Evaluation was abandoned by the worker"))?;
        self.shared.settle(result)
    }

    /// Check a script for syntax errors without running it.
    ///
    /// `Ok(true)` when the script parses. A syntax error follows the
    /// exception policy; with a handler installed the result is `Ok(false)`.
    pub fn check_syntax(
        &self,
        source: &str,
        source_url: Option<&str>,
        starting_line: i32,
    ) -> EmbedResult<bool> {
        let source = source.to_string();
        let source_url = source_url.map(str::to_string);
        self.shared.execute(move |shared| {
            shared
                .engine
                .check_syntax(shared.handle, &source, source_url.as_deref(), starting_line)
                .map_err(|thrown| shared.script_error(thrown))?;
            Ok(true)
        })
    }

    /// The context's global object
    pub fn global_object(&self) -> EmbedResult<JsObject> {
        self.shared.run(|shared| {
            let global = shared.engine.global_object(shared.handle);
            shared
                .resolve(global, true)
                .ok_or_else(|| EmbedError::engine_handle("global_object"))
        })
    }

    /// Wrapper for a native object handle.
    ///
    /// Returns the live wrapper if one exists. Otherwise creates one when
    /// `create` is set and the handle refers to an object. The null handle
    /// always yields `None`.
    pub fn resolve(&self, handle: NativeHandle, create: bool) -> EmbedResult<Option<JsObject>> {
        if handle.is_null() {
            return Ok(None);
        }
        self.shared.run(move |shared| {
            if let Some(object) = shared.resolve(handle, false) {
                return Ok(Some(object));
            }
            if !create || shared.engine.value_type(shared.handle, handle) != JsType::Object {
                return Ok(None);
            }
            Ok(shared.resolve(handle, true))
        })
    }

    /// Expose `callback` to scripts as the global function `name`.
    ///
    /// Arguments arrive as [`Value`]s and the returned value goes back to
    /// the script. A [`EmbedError::Script`] rethrows its original value;
    /// any other error is thrown as an `Error` with the error's text.
    /// Returns the new function object.
    pub fn register_function<F>(&self, name: &str, callback: F) -> EmbedResult<JsObject>
    where
        F: Fn(&[Value]) -> EmbedResult<Value> + Send + Sync + 'static,
    {
        let name = name.to_string();
        let callback: Arc<HostCallback> = Arc::new(callback);
        self.shared.run(move |shared| {
            let context = Arc::downgrade(shared);
            let host: HostFunction = Arc::new(
                move |_ctx: NativeHandle, _this: NativeHandle, args: &[NativeHandle]| {
                    match context.upgrade() {
                        Some(shared) => shared.invoke_host(callback.as_ref(), args),
                        None => Ok(NativeHandle::NULL),
                    }
                },
            );

            let function = shared
                .engine
                .make_function(shared.handle, &name, host)
                .non_null()
                .ok_or_else(|| EmbedError::engine_handle("make_function"))?;
            let global = shared.engine.global_object(shared.handle);
            shared
                .engine
                .set_property(shared.handle, global, &name, function)
                .map_err(|thrown| shared.script_error(thrown))?;
            debug!(context = %shared.handle, function = %name, "Host function registered");
            shared
                .resolve(function, true)
                .ok_or_else(|| EmbedError::engine_handle("make_function"))
        })
    }

    /// Install the handler that receives script errors
    pub fn set_exception_handler(&self, handler: impl Fn(ScriptError) + Send + Sync + 'static) {
        *self.shared.handler.lock() = Some(Arc::new(handler));
    }

    pub fn clear_exception_handler(&self) {
        *self.shared.handler.lock() = None;
    }

    pub fn has_exception_handler(&self) -> bool {
        self.shared.handler.lock().is_some()
    }

    /// Ask the engine to collect garbage. Does not wait.
    pub fn garbage_collect(&self) -> EmbedResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(EmbedError::QueueClosed);
        }
        let shared = self.shared.clone();
        self.shared.queue.run_async(move || {
            if !shared.closed.load(Ordering::SeqCst) {
                shared.engine.garbage_collect(shared.handle);
            }
        })
    }

    /// Unprotect every pending release now; returns how many were released
    pub fn flush_releases(&self) -> EmbedResult<usize> {
        self.shared.run(|shared| {
            Ok(shared
                .releases
                .drain(|handle| shared.engine.unprotect(shared.handle, handle)))
        })
    }

    /// The group this context belongs to.
    ///
    /// Contexts created from a group return that group. For a standalone
    /// context the engine's implicit group is retained and wrapped; it
    /// shares this context's worker.
    pub fn group(&self) -> EmbedResult<Option<EmbeddingContextGroup>> {
        if let Some(group) = &self.shared.group {
            return Ok(Some(group.clone()));
        }
        let native = self.shared.run(|shared| {
            let group = shared.engine.context_group(shared.handle);
            if let Some(group) = group.non_null() {
                shared.engine.retain_group(group);
            }
            Ok(group.non_null())
        })?;
        Ok(native.map(|handle| {
            EmbeddingContextGroup::adopt(
                self.shared.engine.clone(),
                handle,
                self.shared.queue.clone(),
                self.shared.config.clone(),
            )
        }))
    }

    /// Release the native context now instead of on last drop.
    ///
    /// Later operations fail with [`EmbedError::QueueClosed`]. A standalone
    /// context also stops its worker, unless its implicit group or a
    /// context created from that group still runs there.
    pub fn shutdown(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.teardown();
        }
        if self.shared.owns_queue && Arc::strong_count(&self.shared.queue) == 1 {
            self.shared.queue.quit();
        } else if self.shared.owns_queue {
            debug!(context = %self.shared.handle, "Worker still shared, left running");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Statistics of the worker running this context
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.shared.queue.stats().snapshot()
    }

    /// Handles waiting to be unprotected
    pub fn pending_releases(&self) -> usize {
        self.shared.releases.len()
    }

    /// Entries in the identity cache, including stale ones not yet evicted
    pub fn cached_objects(&self) -> usize {
        self.shared.cache.len()
    }

    /// Name of the worker thread
    pub fn worker_name(&self) -> &str {
        self.shared.queue.name()
    }

    /// Whether both contexts run on the same worker thread
    pub fn shares_worker_with(&self, other: &EmbeddingContext) -> bool {
        Arc::ptr_eq(&self.shared.queue, &other.shared.queue)
    }
}

impl fmt::Debug for EmbeddingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingContext")
            .field("handle", &self.shared.handle)
            .field("grouped", &self.shared.group.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use std::sync::atomic::AtomicUsize;

    fn context() -> (Arc<MockEngine>, EmbeddingContext) {
        let engine = Arc::new(MockEngine::new());
        let ctx = EmbeddingContext::new(engine.clone()).unwrap();
        (engine, ctx)
    }

    #[test]
    fn test_eval_options_defaults() {
        let options = EvalOptions::new();
        assert!(options.this.is_none());
        assert_eq!(options.starting_line, 1);
        let options = options.source_url("a.js").starting_line(3);
        assert_eq!(options.source_url.as_deref(), Some("a.js"));
        assert_eq!(options.starting_line, 3);
    }

    #[test]
    fn test_handler_replaced_during_delivery_is_kept() {
        let (_engine, ctx) = context();
        let second = Arc::new(AtomicUsize::new(0));

        let inner_ctx = ctx.clone();
        let counter = second.clone();
        ctx.set_exception_handler(move |_| {
            let counter = counter.clone();
            inner_ctx.set_exception_handler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        ctx.evaluate("throw 1").unwrap();
        ctx.evaluate("throw 2").unwrap();
        assert_eq!(second.load(Ordering::SeqCst), 1);
        ctx.clear_exception_handler();
    }

    #[test]
    fn test_handler_cleared_during_delivery_stays_cleared() {
        let (_engine, ctx) = context();
        let inner_ctx = ctx.clone();
        ctx.set_exception_handler(move |_| inner_ctx.clear_exception_handler());

        assert_eq!(ctx.evaluate("throw 1").unwrap(), Value::Undefined);
        assert!(!ctx.has_exception_handler());
        assert!(ctx.evaluate("throw 1").is_err());
    }

    #[test]
    fn test_engine_handle_error_bypasses_handler() {
        let (engine, ctx) = context();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        ctx.set_exception_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        engine.return_null_results(true);
        let err = ctx.evaluate("1").unwrap_err();
        assert_eq!(err.error_type(), "EngineHandleError");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        ctx.clear_exception_handler();
    }

    #[test]
    fn test_worker_name_from_config() {
        let engine = Arc::new(MockEngine::new());
        let config = EmbedConfig::default().thread_name("ctx-worker");
        let ctx = EmbeddingContext::with_config(engine, config).unwrap();
        assert_eq!(ctx.worker_name(), "ctx-worker");
    }
}
