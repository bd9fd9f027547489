//! JavaScriptCore implementation of the native boundary
//!
//! Handles are the raw JSC pointers. Strings are passed as UTF-16 so that
//! embedded NUL characters survive the round trip.
//!
//! Host functions share one C callback, [`host_dispatch`], which finds the
//! Rust closure for the called function object in a process-wide registry.

use jsc_embed_sys::*;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Once;

use super::{HostFunction, JsType, NativeEngine, NativeHandle, NativeResult, Thrown};

struct HostEntry {
    ctx: NativeHandle,
    callback: HostFunction,
}

/// Host closures by function object. Entries live until their context is
/// released.
static HOST_FUNCTIONS: Mutex<BTreeMap<usize, HostEntry>> =
    parking_lot::const_mutex(BTreeMap::new());

/// Remove the registry entries of `ctx`; the caller drops them unlocked
fn take_host_functions(ctx: NativeHandle) -> Vec<HostEntry> {
    let mut hosts = HOST_FUNCTIONS.lock();
    let functions: Vec<usize> = hosts
        .iter()
        .filter(|(_, entry)| entry.ctx == ctx)
        .map(|(function, _)| *function)
        .collect();
    functions
        .into_iter()
        .filter_map(|function| hosts.remove(&function))
        .collect()
}

/// [`NativeEngine`] backed by the linked JavaScriptCore library
#[derive(Debug, Default, Clone, Copy)]
pub struct JscEngine;

impl JscEngine {
    pub fn new() -> Self {
        Self
    }
}

fn ctx_ref(handle: NativeHandle) -> JSContextRef {
    handle.raw() as JSContextRef
}

fn value_ref(handle: NativeHandle) -> JSValueRef {
    handle.raw() as JSValueRef
}

fn object_ref(handle: NativeHandle) -> JSObjectRef {
    handle.raw() as JSObjectRef
}

fn handle_of(raw: *const c_void) -> NativeHandle {
    NativeHandle::from_raw(raw as usize)
}

fn completed<T>(value: T, exception: JSValueRef) -> NativeResult<T> {
    if exception.is_null() {
        Ok(value)
    } else {
        Err(Thrown(handle_of(exception)))
    }
}

/// JSStringRef released on drop
struct JscString(JSStringRef);

impl JscString {
    fn new(s: &str) -> Self {
        let units: Vec<JSChar> = s.encode_utf16().collect();
        // SAFETY: units outlives the call; JSC copies the characters
        Self(unsafe { JSStringCreateWithCharacters(units.as_ptr(), units.len()) })
    }

    fn optional(s: Option<&str>) -> Option<Self> {
        s.map(Self::new)
    }

    fn raw(&self) -> JSStringRef {
        self.0
    }
}

impl Drop for JscString {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // SAFETY: created by JSStringCreateWithCharacters or returned as a copy
            unsafe { JSStringRelease(self.0) };
        }
    }
}

/// Copy a JSC string into a Rust string
///
/// # Safety
/// `string` must be a valid JSStringRef.
unsafe fn js_string_to_rust(string: JSStringRef) -> String {
    // SAFETY: string is valid per caller contract
    unsafe {
        let len = JSStringGetLength(string);
        if len == 0 {
            return String::new();
        }
        let chars = std::slice::from_raw_parts(JSStringGetCharactersPtr(string), len);
        String::from_utf16_lossy(chars)
    }
}

fn optional_ref(string: &Option<JscString>) -> JSStringRef {
    string.as_ref().map_or(ptr::null_mut(), JscString::raw)
}

fn error_object(ctx: JSContextRef, message: &str) -> JSValueRef {
    let message = JscString::new(message);
    let mut exception: JSValueRef = ptr::null();
    // SAFETY: ctx is valid, the message value is live for the call
    unsafe {
        let text = JSValueMakeString(ctx, message.raw());
        JSObjectMakeError(ctx, 1, &text, &mut exception) as JSValueRef
    }
}

/// C entry point of every function created by `make_function`
unsafe extern "C" fn host_dispatch(
    ctx: JSContextRef,
    function: JSObjectRef,
    this_object: JSObjectRef,
    argument_count: usize,
    arguments: *const JSValueRef,
    exception: *mut JSValueRef,
) -> JSValueRef {
    let entry = HOST_FUNCTIONS
        .lock()
        .get(&(function as usize))
        .map(|entry| (entry.ctx, entry.callback.clone()));

    let args: Vec<NativeHandle> = if argument_count == 0 || arguments.is_null() {
        Vec::new()
    } else {
        // SAFETY: JSC passes `argument_count` live values
        unsafe { std::slice::from_raw_parts(arguments, argument_count) }
            .iter()
            .map(|value| handle_of(*value))
            .collect()
    };

    let outcome = match entry {
        Some((registered, callback)) => {
            panic::catch_unwind(AssertUnwindSafe(|| {
                callback(registered, handle_of(this_object), &args)
            }))
            .unwrap_or_else(|_| Err(Thrown(handle_of(error_object(ctx, "Host function panicked")))))
        }
        None => Err(Thrown(handle_of(error_object(ctx, "Host function is not registered")))),
    };

    match outcome {
        Ok(result) if !result.is_null() => value_ref(result),
        Ok(_) => {
            // SAFETY: ctx is valid
            unsafe { JSValueMakeUndefined(ctx) }
        }
        Err(Thrown(thrown)) => {
            if !exception.is_null() {
                // SAFETY: JSC hands us a writable exception slot
                unsafe { *exception = value_ref(thrown) };
            }
            // SAFETY: ctx is valid
            unsafe { JSValueMakeUndefined(ctx) }
        }
    }
}

impl NativeEngine for JscEngine {
    fn initialize(&self) {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            // Tune JIT tier-up for embedded workloads unless the host already did
            // SAFETY: runs before the first context exists, no engine threads yet
            unsafe {
                if std::env::var_os("JSC_useOSR").is_none() {
                    std::env::set_var("JSC_useOSR", "1");
                }
                if std::env::var_os("JSC_thresholdForJITAfterWarmUp").is_none() {
                    std::env::set_var("JSC_thresholdForJITAfterWarmUp", "10");
                }
            }
            tracing::debug!("JavaScriptCore initialized");
        });
    }

    fn create_group(&self) -> NativeHandle {
        // SAFETY: no preconditions
        handle_of(unsafe { JSContextGroupCreate() })
    }

    fn retain_group(&self, group: NativeHandle) {
        // SAFETY: group is a live group handle
        unsafe { JSContextGroupRetain(group.raw() as JSContextGroupRef) };
    }

    fn release_group(&self, group: NativeHandle) {
        // SAFETY: group was created or retained by this layer
        unsafe { JSContextGroupRelease(group.raw() as JSContextGroupRef) };
    }

    fn create_context(&self, group: Option<NativeHandle>) -> NativeHandle {
        // SAFETY: a null class creates a default global object
        let ctx = unsafe {
            match group {
                Some(group) => JSGlobalContextCreateInGroup(
                    group.raw() as JSContextGroupRef,
                    ptr::null_mut(),
                ),
                None => JSGlobalContextCreate(ptr::null_mut()),
            }
        };
        handle_of(ctx)
    }

    fn release_context(&self, ctx: NativeHandle) {
        let hosts = take_host_functions(ctx);
        // SAFETY: ctx was created by create_context
        unsafe { JSGlobalContextRelease(ctx.raw() as JSGlobalContextRef) };
        if !hosts.is_empty() {
            tracing::trace!(context = %ctx, count = hosts.len(), "Host functions dropped");
        }
    }

    fn context_group(&self, ctx: NativeHandle) -> NativeHandle {
        // SAFETY: ctx is valid
        handle_of(unsafe { JSContextGetGroup(ctx_ref(ctx)) })
    }

    fn global_object(&self, ctx: NativeHandle) -> NativeHandle {
        // SAFETY: ctx is valid
        handle_of(unsafe { JSContextGetGlobalObject(ctx_ref(ctx)) })
    }

    fn evaluate(
        &self,
        ctx: NativeHandle,
        script: &str,
        this: NativeHandle,
        source_url: Option<&str>,
        starting_line: i32,
    ) -> NativeResult<NativeHandle> {
        let script = JscString::new(script);
        let source_url = JscString::optional(source_url);
        let mut exception: JSValueRef = ptr::null();

        // SAFETY: strings are live for the call, ctx and this are valid or null
        let result = unsafe {
            JSEvaluateScript(
                ctx_ref(ctx),
                script.raw(),
                object_ref(this),
                optional_ref(&source_url),
                starting_line,
                &mut exception,
            )
        };

        completed(handle_of(result), exception)
    }

    fn check_syntax(
        &self,
        ctx: NativeHandle,
        script: &str,
        source_url: Option<&str>,
        starting_line: i32,
    ) -> NativeResult<()> {
        let script = JscString::new(script);
        let source_url = JscString::optional(source_url);
        let mut exception: JSValueRef = ptr::null();

        // SAFETY: strings are live for the call, ctx is valid
        unsafe {
            JSCheckScriptSyntax(
                ctx_ref(ctx),
                script.raw(),
                optional_ref(&source_url),
                starting_line,
                &mut exception,
            )
        };

        completed((), exception)
    }

    fn get_property(
        &self,
        ctx: NativeHandle,
        object: NativeHandle,
        name: &str,
    ) -> NativeResult<NativeHandle> {
        let name = JscString::new(name);
        let mut exception: JSValueRef = ptr::null();

        // SAFETY: ctx and object are valid, name is live
        let value = unsafe {
            JSObjectGetProperty(ctx_ref(ctx), object_ref(object), name.raw(), &mut exception)
        };

        completed(handle_of(value), exception)
    }

    fn set_property(
        &self,
        ctx: NativeHandle,
        object: NativeHandle,
        name: &str,
        value: NativeHandle,
    ) -> NativeResult<()> {
        let name = JscString::new(name);
        let mut exception: JSValueRef = ptr::null();

        // SAFETY: ctx, object and value are valid, name is live
        unsafe {
            JSObjectSetProperty(
                ctx_ref(ctx),
                object_ref(object),
                name.raw(),
                value_ref(value),
                K_JS_PROPERTY_ATTRIBUTE_NONE,
                &mut exception,
            )
        };

        completed((), exception)
    }

    fn call_as_function(
        &self,
        ctx: NativeHandle,
        function: NativeHandle,
        this: NativeHandle,
        args: &[NativeHandle],
    ) -> NativeResult<NativeHandle> {
        let args: Vec<JSValueRef> = args.iter().copied().map(value_ref).collect();
        let mut exception: JSValueRef = ptr::null();

        // SAFETY: all handles are valid values of ctx, args outlives the call
        let result = unsafe {
            JSObjectCallAsFunction(
                ctx_ref(ctx),
                object_ref(function),
                object_ref(this),
                args.len(),
                args.as_ptr(),
                &mut exception,
            )
        };

        completed(handle_of(result), exception)
    }

    fn call_as_constructor(
        &self,
        ctx: NativeHandle,
        constructor: NativeHandle,
        args: &[NativeHandle],
    ) -> NativeResult<NativeHandle> {
        let args: Vec<JSValueRef> = args.iter().copied().map(value_ref).collect();
        let mut exception: JSValueRef = ptr::null();

        // SAFETY: all handles are valid values of ctx, args outlives the call
        let result = unsafe {
            JSObjectCallAsConstructor(
                ctx_ref(ctx),
                object_ref(constructor),
                args.len(),
                args.as_ptr(),
                &mut exception,
            )
        };

        completed(handle_of(result), exception)
    }

    fn protect(&self, ctx: NativeHandle, value: NativeHandle) {
        // SAFETY: value is a live value of ctx
        unsafe { JSValueProtect(ctx_ref(ctx), value_ref(value)) };
    }

    fn unprotect(&self, ctx: NativeHandle, value: NativeHandle) {
        // SAFETY: value was protected by this layer
        unsafe { JSValueUnprotect(ctx_ref(ctx), value_ref(value)) };
    }

    fn value_type(&self, ctx: NativeHandle, value: NativeHandle) -> JsType {
        // SAFETY: value is a live value of ctx
        match unsafe { JSValueGetType(ctx_ref(ctx), value_ref(value)) } {
            K_JS_TYPE_UNDEFINED => JsType::Undefined,
            K_JS_TYPE_NULL => JsType::Null,
            K_JS_TYPE_BOOLEAN => JsType::Boolean,
            K_JS_TYPE_NUMBER => JsType::Number,
            K_JS_TYPE_STRING => JsType::String,
            K_JS_TYPE_SYMBOL => JsType::Symbol,
            K_JS_TYPE_OBJECT => JsType::Object,
            // BigInt and future primitive types
            _ => JsType::Object,
        }
    }

    fn is_array(&self, ctx: NativeHandle, value: NativeHandle) -> bool {
        // SAFETY: value is a live value of ctx
        unsafe { JSValueIsArray(ctx_ref(ctx), value_ref(value)) }
    }

    fn is_function(&self, ctx: NativeHandle, value: NativeHandle) -> bool {
        // SAFETY: value is a live value of ctx; only objects reach JSObjectIsFunction
        unsafe {
            JSValueIsObject(ctx_ref(ctx), value_ref(value))
                && JSObjectIsFunction(ctx_ref(ctx), object_ref(value))
        }
    }

    fn is_typed_array(&self, ctx: NativeHandle, value: NativeHandle) -> bool {
        let mut exception: JSValueRef = ptr::null();
        // SAFETY: value is a live value of ctx
        let kind =
            unsafe { JSValueGetTypedArrayType(ctx_ref(ctx), value_ref(value), &mut exception) };
        exception.is_null()
            && kind != K_JS_TYPED_ARRAY_TYPE_NONE
            && kind != K_JS_TYPED_ARRAY_TYPE_ARRAY_BUFFER
    }

    fn value_to_boolean(&self, ctx: NativeHandle, value: NativeHandle) -> bool {
        // SAFETY: value is a live value of ctx
        unsafe { JSValueToBoolean(ctx_ref(ctx), value_ref(value)) }
    }

    fn value_to_number(&self, ctx: NativeHandle, value: NativeHandle) -> NativeResult<f64> {
        let mut exception: JSValueRef = ptr::null();
        // SAFETY: value is a live value of ctx
        let number = unsafe { JSValueToNumber(ctx_ref(ctx), value_ref(value), &mut exception) };
        completed(number, exception)
    }

    fn value_to_string(&self, ctx: NativeHandle, value: NativeHandle) -> NativeResult<String> {
        let mut exception: JSValueRef = ptr::null();
        // SAFETY: value is a live value of ctx
        let string =
            unsafe { JSValueToStringCopy(ctx_ref(ctx), value_ref(value), &mut exception) };
        let string = JscString(string);
        completed((), exception)?;
        if string.raw().is_null() {
            return Ok(String::new());
        }
        // SAFETY: checked non-null above; released when `string` drops
        Ok(unsafe { js_string_to_rust(string.raw()) })
    }

    fn make_undefined(&self, ctx: NativeHandle) -> NativeHandle {
        // SAFETY: ctx is valid
        handle_of(unsafe { JSValueMakeUndefined(ctx_ref(ctx)) })
    }

    fn make_null(&self, ctx: NativeHandle) -> NativeHandle {
        // SAFETY: ctx is valid
        handle_of(unsafe { JSValueMakeNull(ctx_ref(ctx)) })
    }

    fn make_boolean(&self, ctx: NativeHandle, value: bool) -> NativeHandle {
        // SAFETY: ctx is valid
        handle_of(unsafe { JSValueMakeBoolean(ctx_ref(ctx), value) })
    }

    fn make_number(&self, ctx: NativeHandle, value: f64) -> NativeHandle {
        // SAFETY: ctx is valid
        handle_of(unsafe { JSValueMakeNumber(ctx_ref(ctx), value) })
    }

    fn make_string(&self, ctx: NativeHandle, value: &str) -> NativeHandle {
        let string = JscString::new(value);
        // SAFETY: ctx is valid, JSValueMakeString copies the string
        handle_of(unsafe { JSValueMakeString(ctx_ref(ctx), string.raw()) })
    }

    fn make_error(&self, ctx: NativeHandle, message: &str) -> NativeHandle {
        handle_of(error_object(ctx_ref(ctx), message))
    }

    fn make_function(&self, ctx: NativeHandle, name: &str, callback: HostFunction) -> NativeHandle {
        let name = JscString::new(name);
        // SAFETY: ctx is valid, name is live for the call
        let function = unsafe {
            JSObjectMakeFunctionWithCallback(ctx_ref(ctx), name.raw(), Some(host_dispatch))
        };
        if !function.is_null() {
            HOST_FUNCTIONS
                .lock()
                .insert(function as usize, HostEntry { ctx, callback });
        }
        handle_of(function)
    }

    fn garbage_collect(&self, ctx: NativeHandle) {
        // SAFETY: ctx is valid
        unsafe { JSGarbageCollect(ctx_ref(ctx)) };
    }
}
