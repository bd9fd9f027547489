//! The native engine boundary
//!
//! Everything the embedding layer needs from a JavaScript engine is expressed
//! by [`NativeEngine`]. Values cross the boundary as [`NativeHandle`]s, opaque
//! references owned by the engine. Calls that can raise a JavaScript exception
//! return [`NativeResult`], whose error carries the thrown value's handle.
//!
//! Implementations are only ever called from a context's engine thread, but
//! the trait object is created on one thread and used on another, hence the
//! `Send + Sync` bound.

use std::fmt;
use std::sync::Arc;

#[cfg(any(feature = "system-jsc", feature = "bun-webkit"))]
mod jsc;
mod mock;

#[cfg(any(feature = "system-jsc", feature = "bun-webkit"))]
pub use jsc::JscEngine;
pub use mock::MockEngine;

/// Opaque reference to a value, context or group owned by the native engine
///
/// `0` is the null handle, which engines return where no value exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(usize);

impl NativeHandle {
    pub const NULL: Self = Self(0);

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `None` for the null handle
    pub fn non_null(self) -> Option<Self> {
        if self.is_null() { None } else { Some(self) }
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle of a value thrown by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Thrown(pub NativeHandle);

/// Result of an engine call that may throw
pub type NativeResult<T> = Result<T, Thrown>;

/// Native side of a function created by [`NativeEngine::make_function`]
///
/// Called on the engine thread with the context, `this` and the arguments.
/// A null result is read as `undefined`; an error is thrown into the caller.
pub type HostFunction =
    Arc<dyn Fn(NativeHandle, NativeHandle, &[NativeHandle]) -> NativeResult<NativeHandle> + Send + Sync>;

/// Primitive type tag of an engine value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JsType {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Symbol,
    Object,
}

/// Operations the embedding layer consumes from a JavaScript engine
pub trait NativeEngine: Send + Sync + 'static {
    /// One-time, process-wide library initialization. Must be idempotent.
    fn initialize(&self);

    fn create_group(&self) -> NativeHandle;
    fn retain_group(&self, group: NativeHandle);
    fn release_group(&self, group: NativeHandle);

    /// Create a global context, optionally inside `group`
    fn create_context(&self, group: Option<NativeHandle>) -> NativeHandle;
    /// Release a context and every host function created in it
    fn release_context(&self, ctx: NativeHandle);
    /// The group a context belongs to (not retained)
    fn context_group(&self, ctx: NativeHandle) -> NativeHandle;
    fn global_object(&self, ctx: NativeHandle) -> NativeHandle;

    fn evaluate(
        &self,
        ctx: NativeHandle,
        script: &str,
        this: NativeHandle,
        source_url: Option<&str>,
        starting_line: i32,
    ) -> NativeResult<NativeHandle>;

    fn check_syntax(
        &self,
        ctx: NativeHandle,
        script: &str,
        source_url: Option<&str>,
        starting_line: i32,
    ) -> NativeResult<()>;

    fn get_property(
        &self,
        ctx: NativeHandle,
        object: NativeHandle,
        name: &str,
    ) -> NativeResult<NativeHandle>;

    fn set_property(
        &self,
        ctx: NativeHandle,
        object: NativeHandle,
        name: &str,
        value: NativeHandle,
    ) -> NativeResult<()>;

    fn call_as_function(
        &self,
        ctx: NativeHandle,
        function: NativeHandle,
        this: NativeHandle,
        args: &[NativeHandle],
    ) -> NativeResult<NativeHandle>;

    fn call_as_constructor(
        &self,
        ctx: NativeHandle,
        constructor: NativeHandle,
        args: &[NativeHandle],
    ) -> NativeResult<NativeHandle>;

    /// Keep `value` alive regardless of reachability. Protects nest.
    fn protect(&self, ctx: NativeHandle, value: NativeHandle);
    fn unprotect(&self, ctx: NativeHandle, value: NativeHandle);

    fn value_type(&self, ctx: NativeHandle, value: NativeHandle) -> JsType;
    fn is_array(&self, ctx: NativeHandle, value: NativeHandle) -> bool;
    fn is_function(&self, ctx: NativeHandle, value: NativeHandle) -> bool;
    fn is_typed_array(&self, ctx: NativeHandle, value: NativeHandle) -> bool;

    fn value_to_boolean(&self, ctx: NativeHandle, value: NativeHandle) -> bool;
    fn value_to_number(&self, ctx: NativeHandle, value: NativeHandle) -> NativeResult<f64>;
    fn value_to_string(&self, ctx: NativeHandle, value: NativeHandle) -> NativeResult<String>;

    fn make_undefined(&self, ctx: NativeHandle) -> NativeHandle;
    fn make_null(&self, ctx: NativeHandle) -> NativeHandle;
    fn make_boolean(&self, ctx: NativeHandle, value: bool) -> NativeHandle;
    fn make_number(&self, ctx: NativeHandle, value: f64) -> NativeHandle;
    fn make_string(&self, ctx: NativeHandle, value: &str) -> NativeHandle;
    /// A new `Error` object carrying `message`
    fn make_error(&self, ctx: NativeHandle, message: &str) -> NativeHandle;
    /// A function object named `name` that runs `callback` when called.
    /// The engine must not hold its lock while the callback runs, so the
    /// callback may call back into the engine.
    fn make_function(&self, ctx: NativeHandle, name: &str, callback: HostFunction) -> NativeHandle;

    fn garbage_collect(&self, ctx: NativeHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle() {
        assert!(NativeHandle::NULL.is_null());
        assert!(NativeHandle::default().is_null());
        assert_eq!(NativeHandle::NULL.non_null(), None);

        let handle = NativeHandle::from_raw(0x2a);
        assert!(!handle.is_null());
        assert_eq!(handle.non_null(), Some(handle));
        assert_eq!(handle.to_string(), "0x2a");
    }
}
