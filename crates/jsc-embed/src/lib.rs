//! jsc-embed - thread-safe embedding layer for JavaScriptCore.
//!
//! JavaScriptCore values are only safe to touch from one thread at a time,
//! and every value the host keeps must stay protected from the collector.
//! This crate hides both constraints behind `Send + Sync` handles:
//!
//! - **One engine thread per context** (or per context group): every engine
//!   call is a unit of work on a [`SerialWorkQueue`].
//! - **Identity-stable wrappers**: resolving the same native object twice
//!   yields the same [`JsObject`] while it is alive.
//! - **Deferred unprotect**: wrappers may be dropped on any thread; their
//!   protects are released in batches on the engine thread by a
//!   [`DeferredReleaseQueue`].
//! - **Exception policy**: script errors go to an optional per-context
//!   handler, or are returned as [`EmbedError::Script`].
//! - **Host functions**: Rust closures registered with
//!   [`EmbeddingContext::register_function`] are callable from scripts.
//!
//! # Example
//!
//! ```
//! use jsc_embed::{EmbeddingContext, MockEngine, Value};
//! use std::sync::Arc;
//!
//! let ctx = EmbeddingContext::new(Arc::new(MockEngine::new())).unwrap();
//!
//! let add = ctx.evaluate("function add(a, b) { return a + b; }; add").unwrap();
//! let add = add.as_object().unwrap();
//! assert!(add.is_function());
//! assert_eq!(add.call(None, &[2.into(), 3.into()]).unwrap(), Value::Number(5.0));
//!
//! let err = ctx.evaluate("throw new TypeError('nope')").unwrap_err();
//! assert_eq!(err.to_string(), "TypeError: nope");
//! ```
//!
//! # Engines
//!
//! The engine is anything implementing [`NativeEngine`]. [`MockEngine`] is
//! always available and runs a small JavaScript subset in-process. The
//! `system-jsc` and `bun-webkit` features add `JscEngine`, backed by
//! JavaScriptCore through `jsc-embed-sys`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ EmbeddingContext (Clone) │     │ JsObject (Clone)         │
//! │  evaluate / global / ... │     │  get / set / call / drop │
//! └────────────┬─────────────┘     └────────────┬─────────────┘
//!              │ run_sync / run_async           │ drop: evict + mark
//!              ↓                                ↓
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ SerialWorkQueue          │     │ IdentityCache            │
//! │  one worker thread, FIFO │     │  handle → Weak wrapper   │
//! │  tick hooks              │     └────────────┬─────────────┘
//! └────────────┬─────────────┘                  ↓
//!              │ tick: drain > threshold ┌──────────────────────────┐
//!              ├────────────────────────→│ DeferredReleaseQueue     │
//!              ↓                         └──────────────────────────┘
//! ┌──────────────────────────┐
//! │ NativeEngine             │
//! │  JscEngine / MockEngine  │
//! └──────────────────────────┘
//! ```

mod cache;
pub mod config;
mod context;
pub mod engine;
pub mod error;
mod group;
pub mod queue;
pub mod release;
pub mod value;

pub use config::EmbedConfig;
pub use context::{EmbeddingContext, EvalOptions};
#[cfg(any(feature = "system-jsc", feature = "bun-webkit"))]
pub use engine::JscEngine;
pub use engine::{
    HostFunction, JsType, MockEngine, NativeEngine, NativeHandle, NativeResult, Thrown,
};
pub use error::{EmbedError, EmbedResult, ScriptError};
pub use group::EmbeddingContextGroup;
pub use queue::{QueueState, QueueStats, QueueStatsSnapshot, SerialWorkQueue};
pub use release::DeferredReleaseQueue;
pub use value::{JsObject, ObjectKind, Value};

/// Common imports
pub mod prelude {
    pub use crate::{
        EmbedConfig, EmbedError, EmbedResult, EmbeddingContext, EmbeddingContextGroup,
        EvalOptions, JsObject, MockEngine, NativeEngine, ObjectKind, ScriptError, Value,
    };
}
