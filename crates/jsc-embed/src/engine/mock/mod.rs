//! In-process engine used by tests and the default CLI build
//!
//! `MockEngine` implements [`NativeEngine`] over a small heap of its own and
//! evaluates a JavaScript subset: literals, arithmetic, arrays, object
//! literals, member access, calls, `new`, functions with `return`, variable
//! declarations, assignment and `throw`. Errors carry `name`, `message`,
//! `line`, `sourceURL` and `stack` like JavaScriptCore's. Host functions run
//! with the heap unlocked, so they may call back into the engine.
//!
//! Every call is recorded together with the calling thread so tests can
//! assert which operations reached the engine and from where. Protect counts
//! are tracked per handle.

mod interp;
mod script;

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::Duration;

use super::{HostFunction, JsType, NativeEngine, NativeHandle, NativeResult, Thrown};
use crate::value::format_number;
use interp::Interp;
use script::FunctionDef;

const UNDEFINED: usize = 1;
const NULL: usize = 2;
const TRUE: usize = 3;
const FALSE: usize = 4;
const FIRST_ALLOCATION: usize = 0x10;

fn handle(id: usize) -> NativeHandle {
    NativeHandle::from_raw(id)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TypedKind {
    Uint8,
    Int32,
    Float32,
    Float64,
}

impl TypedKind {
    fn name(self) -> &'static str {
        match self {
            Self::Uint8 => "Uint8Array",
            Self::Int32 => "Int32Array",
            Self::Float32 => "Float32Array",
            Self::Float64 => "Float64Array",
        }
    }

    fn coerce(self, n: f64) -> f64 {
        match self {
            Self::Uint8 if n.is_finite() => (n.trunc() as i64).rem_euclid(256) as f64,
            Self::Int32 if n.is_finite() => (n.trunc() as i64) as i32 as f64,
            Self::Uint8 | Self::Int32 => 0.0,
            Self::Float32 => n as f32 as f64,
            Self::Float64 => n,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Native {
    Error(&'static str),
    TypedArray(TypedKind),
}

#[derive(Debug)]
enum Class {
    Plain,
    Error,
    Array(Vec<usize>),
    TypedArray(TypedKind, Vec<f64>),
    Function(Arc<FunctionDef>),
    Native(Native),
    /// Function created by `make_function`; the closure lives in `Heap::hosts`
    Host(String),
}

#[derive(Debug)]
struct Object {
    class: Class,
    props: IndexMap<String, usize>,
}

#[derive(Debug)]
enum Slot {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Object(Object),
}

#[derive(Clone)]
enum Callable {
    Script(Arc<FunctionDef>),
    Native(Native),
    Host(HostFunction),
}

struct ContextState {
    global: usize,
    group: usize,
}

struct HostEntry {
    ctx: usize,
    callback: HostFunction,
}

struct Heap {
    next: usize,
    slots: HashMap<usize, Slot>,
    contexts: HashMap<usize, ContextState>,
    groups: HashMap<usize, usize>,
    hosts: HashMap<usize, HostEntry>,
    protects: HashMap<usize, usize>,
    unprotect_calls: HashMap<usize, usize>,
    total_unprotects: usize,
    calls: Vec<&'static str>,
    threads: Vec<ThreadId>,
}

impl Heap {
    fn new() -> Self {
        let mut slots = HashMap::new();
        slots.insert(UNDEFINED, Slot::Undefined);
        slots.insert(NULL, Slot::Null);
        slots.insert(TRUE, Slot::Boolean(true));
        slots.insert(FALSE, Slot::Boolean(false));
        Self {
            next: FIRST_ALLOCATION,
            slots,
            contexts: HashMap::new(),
            groups: HashMap::new(),
            hosts: HashMap::new(),
            protects: HashMap::new(),
            unprotect_calls: HashMap::new(),
            total_unprotects: 0,
            calls: Vec::new(),
            threads: Vec::new(),
        }
    }

    fn next_id(&mut self) -> usize {
        let id = self.next;
        self.next += 1;
        id
    }

    fn alloc(&mut self, slot: Slot) -> usize {
        let id = self.next_id();
        self.slots.insert(id, slot);
        id
    }

    fn boolean(&self, value: bool) -> usize {
        if value { TRUE } else { FALSE }
    }

    fn number(&mut self, value: f64) -> usize {
        self.alloc(Slot::Number(value))
    }

    fn string(&mut self, value: impl Into<String>) -> usize {
        self.alloc(Slot::String(value.into()))
    }

    fn object(&mut self, class: Class) -> usize {
        self.alloc(Slot::Object(Object {
            class,
            props: IndexMap::new(),
        }))
    }

    fn get_object(&self, id: usize) -> Option<&Object> {
        match self.slots.get(&id) {
            Some(Slot::Object(object)) => Some(object),
            _ => None,
        }
    }

    fn get_object_mut(&mut self, id: usize) -> Option<&mut Object> {
        match self.slots.get_mut(&id) {
            Some(Slot::Object(object)) => Some(object),
            _ => None,
        }
    }

    fn callable(&self, id: usize) -> Option<Callable> {
        match &self.get_object(id)?.class {
            Class::Function(def) => Some(Callable::Script(def.clone())),
            Class::Native(native) => Some(Callable::Native(*native)),
            Class::Host(_) => self
                .hosts
                .get(&id)
                .map(|entry| Callable::Host(entry.callback.clone())),
            _ => None,
        }
    }

    fn is_object(&self, id: usize) -> bool {
        self.get_object(id).is_some()
    }

    fn global_of(&self, ctx: usize) -> usize {
        self.contexts.get(&ctx).map_or(UNDEFINED, |c| c.global)
    }

    fn value_type(&self, id: usize) -> JsType {
        match self.slots.get(&id) {
            None | Some(Slot::Undefined) => JsType::Undefined,
            Some(Slot::Null) => JsType::Null,
            Some(Slot::Boolean(_)) => JsType::Boolean,
            Some(Slot::Number(_)) => JsType::Number,
            Some(Slot::String(_)) => JsType::String,
            Some(Slot::Object(_)) => JsType::Object,
        }
    }

    fn type_name(&self, id: usize) -> &'static str {
        match self.value_type(id) {
            JsType::Undefined => "undefined",
            JsType::Null => "null",
            JsType::Boolean => "boolean",
            JsType::Number => "number",
            JsType::String => "string",
            JsType::Symbol => "symbol",
            JsType::Object if self.callable(id).is_some() => "function",
            JsType::Object => "object",
        }
    }

    fn to_boolean(&self, id: usize) -> bool {
        match self.slots.get(&id) {
            None | Some(Slot::Undefined) | Some(Slot::Null) => false,
            Some(Slot::Boolean(b)) => *b,
            Some(Slot::Number(n)) => *n != 0.0 && !n.is_nan(),
            Some(Slot::String(s)) => !s.is_empty(),
            Some(Slot::Object(_)) => true,
        }
    }

    fn to_number(&self, id: usize) -> f64 {
        match self.slots.get(&id) {
            None | Some(Slot::Undefined) => f64::NAN,
            Some(Slot::Null) => 0.0,
            Some(Slot::Boolean(b)) => f64::from(u8::from(*b)),
            Some(Slot::Number(n)) => *n,
            Some(Slot::String(s)) => parse_number(s),
            Some(Slot::Object(object)) => match &object.class {
                Class::Array(items) if items.is_empty() => 0.0,
                Class::Array(items) if items.len() == 1 => self.to_number(items[0]),
                _ => parse_number(&self.to_string(id)),
            },
        }
    }

    fn to_string(&self, id: usize) -> String {
        match self.slots.get(&id) {
            None | Some(Slot::Undefined) => "undefined".into(),
            Some(Slot::Null) => "null".into(),
            Some(Slot::Boolean(b)) => b.to_string(),
            Some(Slot::Number(n)) => format_number(*n),
            Some(Slot::String(s)) => s.clone(),
            Some(Slot::Object(object)) => match &object.class {
                Class::Plain => "[object Object]".into(),
                Class::Error => {
                    let prop = |key: &str| {
                        object
                            .props
                            .get(key)
                            .map(|v| self.to_string(*v))
                            .unwrap_or_default()
                    };
                    let (name, message) = (prop("name"), prop("message"));
                    if message.is_empty() {
                        name
                    } else {
                        format!("{}: {}", name, message)
                    }
                }
                Class::Array(items) => items
                    .iter()
                    .map(|item| match self.value_type(*item) {
                        JsType::Undefined | JsType::Null => String::new(),
                        _ => self.to_string(*item),
                    })
                    .collect::<Vec<_>>()
                    .join(","),
                Class::TypedArray(_, data) => data
                    .iter()
                    .map(|n| format_number(*n))
                    .collect::<Vec<_>>()
                    .join(","),
                Class::Function(def) => format!(
                    "function {}({}) {{ ... }}",
                    def.name.as_deref().unwrap_or(""),
                    def.params.join(", ")
                ),
                Class::Native(Native::Error(name)) => {
                    format!("function {}() {{\n    [native code]\n}}", name)
                }
                Class::Native(Native::TypedArray(kind)) => {
                    format!("function {}() {{\n    [native code]\n}}", kind.name())
                }
                Class::Host(name) => format!("function {}() {{\n    [native code]\n}}", name),
            },
        }
    }

    /// Allocate an error object the way the engine reports exceptions
    fn error(
        &mut self,
        name: &str,
        message: &str,
        source_url: Option<&str>,
        line: Option<i32>,
    ) -> usize {
        let mut props = IndexMap::new();
        props.insert("name".to_string(), self.string(name));
        props.insert("message".to_string(), self.string(message));
        if let Some(line) = line {
            props.insert("line".to_string(), self.number(f64::from(line)));
        }
        if let Some(url) = source_url {
            props.insert("sourceURL".to_string(), self.string(url));
        }
        let stack = format!(
            "global code@{}:{}",
            source_url.unwrap_or(""),
            line.map(|l| l.to_string()).unwrap_or_default()
        );
        props.insert("stack".to_string(), self.string(stack));
        self.alloc(Slot::Object(Object {
            class: Class::Error,
            props,
        }))
    }

    fn create_global(&mut self) -> usize {
        let global = self.object(Class::Plain);
        let constructors = [
            Native::Error("Error"),
            Native::Error("TypeError"),
            Native::Error("RangeError"),
            Native::Error("SyntaxError"),
            Native::Error("ReferenceError"),
            Native::TypedArray(TypedKind::Uint8),
            Native::TypedArray(TypedKind::Int32),
            Native::TypedArray(TypedKind::Float32),
            Native::TypedArray(TypedKind::Float64),
        ];
        for native in constructors {
            let name = match native {
                Native::Error(name) => name,
                Native::TypedArray(kind) => kind.name(),
            };
            let ctor = self.object(Class::Native(native));
            if let Some(object) = self.get_object_mut(global) {
                object.props.insert(name.to_string(), ctor);
            }
        }
        if let Some(object) = self.get_object_mut(global) {
            object.props.insert("globalThis".to_string(), global);
        }
        global
    }

    fn release_group(&mut self, group: usize) {
        if let Some(retains) = self.groups.get_mut(&group) {
            *retains -= 1;
            if *retains == 0 {
                self.groups.remove(&group);
            }
        }
    }
}

fn parse_number(text: &str) -> f64 {
    let text = text.trim();
    match text {
        "" => 0.0,
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => match text.parse::<f64>() {
            Ok(n) if n.is_finite() => n,
            _ => f64::NAN,
        },
    }
}

/// Pure-Rust [`NativeEngine`] with call recording
///
/// ```
/// use jsc_embed::MockEngine;
/// use std::sync::Arc;
///
/// let engine = Arc::new(MockEngine::new());
/// assert_eq!(engine.live_contexts(), 0);
/// ```
pub struct MockEngine {
    heap: Mutex<Heap>,
    initializations: AtomicUsize,
    gc_requests: AtomicUsize,
    gc_delay: Duration,
    refuse_contexts: AtomicBool,
    null_results: AtomicBool,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::new()),
            initializations: AtomicUsize::new(0),
            gc_requests: AtomicUsize::new(0),
            gc_delay: Duration::ZERO,
            refuse_contexts: AtomicBool::new(false),
            null_results: AtomicBool::new(false),
        }
    }

    /// Make every garbage collection take `delay` on the engine thread
    pub fn with_gc_delay(mut self, delay: Duration) -> Self {
        self.gc_delay = delay;
        self
    }

    /// Fail context creation by returning the null handle
    pub fn refuse_contexts(&self, refuse: bool) {
        self.refuse_contexts.store(refuse, Ordering::SeqCst);
    }

    /// Make `evaluate` return the null handle instead of a value
    pub fn return_null_results(&self, enabled: bool) {
        self.null_results.store(enabled, Ordering::SeqCst);
    }

    /// Names of the engine operations called so far, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.heap.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.heap
            .lock()
            .calls
            .iter()
            .filter(|call| **call == operation)
            .count()
    }

    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }

    /// Distinct threads that have called into the engine
    pub fn threads_seen(&self) -> Vec<ThreadId> {
        self.heap.lock().threads.clone()
    }

    /// Outstanding protects on `value`
    pub fn protect_count(&self, value: NativeHandle) -> usize {
        self.heap
            .lock()
            .protects
            .get(&value.raw())
            .copied()
            .unwrap_or(0)
    }

    /// Total unprotect calls ever made for `value`
    pub fn unprotect_calls(&self, value: NativeHandle) -> usize {
        self.heap
            .lock()
            .unprotect_calls
            .get(&value.raw())
            .copied()
            .unwrap_or(0)
    }

    pub fn total_unprotects(&self) -> usize {
        self.heap.lock().total_unprotects
    }

    /// Sum of all outstanding protects
    pub fn total_protects(&self) -> usize {
        self.heap.lock().protects.values().sum()
    }

    pub fn gc_requests(&self) -> usize {
        self.gc_requests.load(Ordering::SeqCst)
    }

    pub fn live_contexts(&self) -> usize {
        self.heap.lock().contexts.len()
    }

    pub fn live_groups(&self) -> usize {
        self.heap.lock().groups.len()
    }

    /// Lock the heap and record the call
    fn enter(&self, operation: &'static str) -> MutexGuard<'_, Heap> {
        let mut heap = self.heap.lock();
        heap.calls.push(operation);
        let current = std::thread::current().id();
        if !heap.threads.contains(&current) {
            heap.threads.push(current);
        }
        heap
    }
}

impl NativeEngine for MockEngine {
    fn initialize(&self) {
        drop(self.enter("initialize"));
        self.initializations.fetch_add(1, Ordering::SeqCst);
    }

    fn create_group(&self) -> NativeHandle {
        let mut heap = self.enter("create_group");
        let group = heap.next_id();
        heap.groups.insert(group, 1);
        handle(group)
    }

    fn retain_group(&self, group: NativeHandle) {
        let mut heap = self.enter("retain_group");
        if let Some(retains) = heap.groups.get_mut(&group.raw()) {
            *retains += 1;
        }
    }

    fn release_group(&self, group: NativeHandle) {
        self.enter("release_group").release_group(group.raw());
    }

    fn create_context(&self, group: Option<NativeHandle>) -> NativeHandle {
        let mut heap = self.enter("create_context");
        if self.refuse_contexts.load(Ordering::SeqCst) {
            return NativeHandle::NULL;
        }
        let group = match group {
            Some(group) => match heap.groups.get_mut(&group.raw()) {
                Some(retains) => {
                    *retains += 1;
                    group.raw()
                }
                None => return NativeHandle::NULL,
            },
            None => {
                let group = heap.next_id();
                heap.groups.insert(group, 1);
                group
            }
        };
        let ctx = heap.next_id();
        let global = heap.create_global();
        heap.contexts.insert(ctx, ContextState { global, group });
        handle(ctx)
    }

    fn release_context(&self, ctx: NativeHandle) {
        let mut heap = self.enter("release_context");
        let Some(state) = heap.contexts.remove(&ctx.raw()) else {
            return;
        };
        heap.release_group(state.group);

        let functions: Vec<usize> = heap
            .hosts
            .iter()
            .filter(|(_, entry)| entry.ctx == ctx.raw())
            .map(|(function, _)| *function)
            .collect();
        let released: Vec<HostEntry> = functions
            .iter()
            .filter_map(|function| heap.hosts.remove(function))
            .collect();
        // Closures may own contexts whose teardown calls back in
        drop(heap);
        drop(released);
    }

    fn context_group(&self, ctx: NativeHandle) -> NativeHandle {
        let heap = self.enter("context_group");
        heap.contexts
            .get(&ctx.raw())
            .map_or(NativeHandle::NULL, |state| handle(state.group))
    }

    fn global_object(&self, ctx: NativeHandle) -> NativeHandle {
        let heap = self.enter("global_object");
        heap.contexts
            .get(&ctx.raw())
            .map_or(NativeHandle::NULL, |state| handle(state.global))
    }

    fn evaluate(
        &self,
        ctx: NativeHandle,
        script: &str,
        this: NativeHandle,
        source_url: Option<&str>,
        starting_line: i32,
    ) -> NativeResult<NativeHandle> {
        let mut heap = self.enter("evaluate");
        let body = match script::parse(script, starting_line) {
            Ok(body) => body,
            Err(err) => {
                let error = heap.error("SyntaxError", &err.message, source_url, Some(err.line));
                return Err(Thrown(handle(error)));
            }
        };
        let this = match this.non_null() {
            Some(this) => this.raw(),
            None => heap.global_of(ctx.raw()),
        };
        let result = Interp::new(&mut heap, ctx.raw(), source_url).run_script(&body, this)?;
        if self.null_results.load(Ordering::SeqCst) {
            return Ok(NativeHandle::NULL);
        }
        Ok(handle(result))
    }

    fn check_syntax(
        &self,
        _ctx: NativeHandle,
        script: &str,
        source_url: Option<&str>,
        starting_line: i32,
    ) -> NativeResult<()> {
        let mut heap = self.enter("check_syntax");
        match script::parse(script, starting_line) {
            Ok(_) => Ok(()),
            Err(err) => {
                let error = heap.error("SyntaxError", &err.message, source_url, Some(err.line));
                Err(Thrown(handle(error)))
            }
        }
    }

    fn get_property(
        &self,
        ctx: NativeHandle,
        object: NativeHandle,
        name: &str,
    ) -> NativeResult<NativeHandle> {
        let mut heap = self.enter("get_property");
        Interp::new(&mut heap, ctx.raw(), None)
            .get(object.raw(), name)
            .map(handle)
    }

    fn set_property(
        &self,
        ctx: NativeHandle,
        object: NativeHandle,
        name: &str,
        value: NativeHandle,
    ) -> NativeResult<()> {
        let mut heap = self.enter("set_property");
        Interp::new(&mut heap, ctx.raw(), None).set(object.raw(), name, value.raw())
    }

    fn call_as_function(
        &self,
        ctx: NativeHandle,
        function: NativeHandle,
        this: NativeHandle,
        args: &[NativeHandle],
    ) -> NativeResult<NativeHandle> {
        let mut heap = self.enter("call_as_function");
        let this = this.non_null().map_or(UNDEFINED, NativeHandle::raw);
        let args: Vec<usize> = args.iter().map(|arg| arg.raw()).collect();
        Interp::new(&mut heap, ctx.raw(), None)
            .call(function.raw(), this, &args, "value")
            .map(handle)
    }

    fn call_as_constructor(
        &self,
        ctx: NativeHandle,
        constructor: NativeHandle,
        args: &[NativeHandle],
    ) -> NativeResult<NativeHandle> {
        let mut heap = self.enter("call_as_constructor");
        let args: Vec<usize> = args.iter().map(|arg| arg.raw()).collect();
        Interp::new(&mut heap, ctx.raw(), None)
            .construct(constructor.raw(), &args, "value")
            .map(handle)
    }

    fn protect(&self, _ctx: NativeHandle, value: NativeHandle) {
        let mut heap = self.enter("protect");
        *heap.protects.entry(value.raw()).or_insert(0) += 1;
    }

    fn unprotect(&self, _ctx: NativeHandle, value: NativeHandle) {
        let mut heap = self.enter("unprotect");
        heap.total_unprotects += 1;
        *heap.unprotect_calls.entry(value.raw()).or_insert(0) += 1;
        if let Some(count) = heap.protects.get_mut(&value.raw()) {
            *count -= 1;
            if *count == 0 {
                heap.protects.remove(&value.raw());
            }
        }
    }

    fn value_type(&self, _ctx: NativeHandle, value: NativeHandle) -> JsType {
        self.enter("value_type").value_type(value.raw())
    }

    fn is_array(&self, _ctx: NativeHandle, value: NativeHandle) -> bool {
        let heap = self.enter("is_array");
        matches!(
            heap.get_object(value.raw()).map(|o| &o.class),
            Some(Class::Array(_))
        )
    }

    fn is_function(&self, _ctx: NativeHandle, value: NativeHandle) -> bool {
        self.enter("is_function").callable(value.raw()).is_some()
    }

    fn is_typed_array(&self, _ctx: NativeHandle, value: NativeHandle) -> bool {
        let heap = self.enter("is_typed_array");
        matches!(
            heap.get_object(value.raw()).map(|o| &o.class),
            Some(Class::TypedArray(..))
        )
    }

    fn value_to_boolean(&self, _ctx: NativeHandle, value: NativeHandle) -> bool {
        self.enter("value_to_boolean").to_boolean(value.raw())
    }

    fn value_to_number(&self, _ctx: NativeHandle, value: NativeHandle) -> NativeResult<f64> {
        Ok(self.enter("value_to_number").to_number(value.raw()))
    }

    fn value_to_string(&self, _ctx: NativeHandle, value: NativeHandle) -> NativeResult<String> {
        Ok(self.enter("value_to_string").to_string(value.raw()))
    }

    fn make_undefined(&self, _ctx: NativeHandle) -> NativeHandle {
        drop(self.enter("make_undefined"));
        handle(UNDEFINED)
    }

    fn make_null(&self, _ctx: NativeHandle) -> NativeHandle {
        drop(self.enter("make_null"));
        handle(NULL)
    }

    fn make_boolean(&self, _ctx: NativeHandle, value: bool) -> NativeHandle {
        handle(self.enter("make_boolean").boolean(value))
    }

    fn make_number(&self, _ctx: NativeHandle, value: f64) -> NativeHandle {
        handle(self.enter("make_number").number(value))
    }

    fn make_string(&self, _ctx: NativeHandle, value: &str) -> NativeHandle {
        handle(self.enter("make_string").string(value))
    }

    fn make_error(&self, _ctx: NativeHandle, message: &str) -> NativeHandle {
        handle(self.enter("make_error").error("Error", message, None, None))
    }

    fn make_function(&self, ctx: NativeHandle, name: &str, callback: HostFunction) -> NativeHandle {
        let mut heap = self.enter("make_function");
        if !heap.contexts.contains_key(&ctx.raw()) {
            return NativeHandle::NULL;
        }
        let function = heap.object(Class::Host(name.to_string()));
        heap.hosts.insert(
            function,
            HostEntry {
                ctx: ctx.raw(),
                callback,
            },
        );
        handle(function)
    }

    fn garbage_collect(&self, _ctx: NativeHandle) {
        drop(self.enter("garbage_collect"));
        if !self.gc_delay.is_zero() {
            std::thread::sleep(self.gc_delay);
        }
        self.gc_requests.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(engine: &MockEngine) -> NativeHandle {
        engine.initialize();
        engine.create_context(None)
    }

    fn eval(engine: &MockEngine, ctx: NativeHandle, source: &str) -> NativeResult<NativeHandle> {
        engine.evaluate(ctx, source, NativeHandle::NULL, None, 1)
    }

    fn eval_string(engine: &MockEngine, ctx: NativeHandle, source: &str) -> String {
        let value = eval(engine, ctx, source).unwrap();
        engine.value_to_string(ctx, value).unwrap()
    }

    fn thrown_prop(engine: &MockEngine, ctx: NativeHandle, thrown: Thrown, name: &str) -> String {
        let value = engine.get_property(ctx, thrown.0, name).unwrap();
        engine.value_to_string(ctx, value).unwrap()
    }

    #[test]
    fn test_arithmetic_and_strings() {
        let engine = MockEngine::new();
        let ctx = context(&engine);
        assert_eq!(eval_string(&engine, ctx, "1 + 1"), "2");
        assert_eq!(eval_string(&engine, ctx, "(1 + 2) * 3 - 4 / 2"), "7");
        assert_eq!(eval_string(&engine, ctx, "'a' + 1"), "a1");
        assert_eq!(eval_string(&engine, ctx, "1 / 0"), "Infinity");
        assert_eq!(eval_string(&engine, ctx, "-'x' * 2"), "NaN");
        assert_eq!(eval_string(&engine, ctx, "[1, 2] + ''"), "1,2");
    }

    #[test]
    fn test_functions_and_objects() {
        let engine = MockEngine::new();
        let ctx = context(&engine);
        eval(&engine, ctx, "function add(a, b) { return a + b; }").unwrap();
        assert_eq!(eval_string(&engine, ctx, "add(2, 3)"), "5");

        eval(&engine, ctx, "var o = { items: [1, 2, 3] }; o.extra = 'x'").unwrap();
        assert_eq!(eval_string(&engine, ctx, "o.items.length"), "3");
        assert_eq!(eval_string(&engine, ctx, "o.items[1]"), "2");
        assert_eq!(eval_string(&engine, ctx, "o.extra"), "x");
        assert_eq!(eval_string(&engine, ctx, "o"), "[object Object]");
    }

    #[test]
    fn test_globals_keep_identity() {
        let engine = MockEngine::new();
        let ctx = context(&engine);
        let first = eval(&engine, ctx, "var o = {}; o").unwrap();
        let second = eval(&engine, ctx, "o").unwrap();
        assert_eq!(first, second);
        let fresh = eval(&engine, ctx, "({})").unwrap();
        assert_ne!(first, fresh);
    }

    #[test]
    fn test_throw_carries_location() {
        let engine = MockEngine::new();
        let ctx = context(&engine);
        let thrown = engine
            .evaluate(ctx, "1;\nthrow new TypeError('bad')", NativeHandle::NULL, Some("a.js"), 10)
            .unwrap_err();
        assert_eq!(thrown_prop(&engine, ctx, thrown, "name"), "TypeError");
        assert_eq!(thrown_prop(&engine, ctx, thrown, "message"), "bad");
        assert_eq!(thrown_prop(&engine, ctx, thrown, "line"), "11");
        assert_eq!(thrown_prop(&engine, ctx, thrown, "sourceURL"), "a.js");
    }

    #[test]
    fn test_reference_and_syntax_errors() {
        let engine = MockEngine::new();
        let ctx = context(&engine);
        let thrown = eval(&engine, ctx, "missing + 1").unwrap_err();
        assert_eq!(thrown_prop(&engine, ctx, thrown, "name"), "ReferenceError");

        let thrown = eval(&engine, ctx, "1 +").unwrap_err();
        assert_eq!(thrown_prop(&engine, ctx, thrown, "name"), "SyntaxError");

        assert!(engine.check_syntax(ctx, "var x = 1", None, 1).is_ok());
        assert!(engine.check_syntax(ctx, "var = 1", None, 1).is_err());
    }

    #[test]
    fn test_kinds() {
        let engine = MockEngine::new();
        let ctx = context(&engine);
        let array = eval(&engine, ctx, "[1, 2]").unwrap();
        let typed = eval(&engine, ctx, "new Uint8Array([1, 300])").unwrap();
        let function = eval(&engine, ctx, "function f() {}; f").unwrap();
        assert!(engine.is_array(ctx, array));
        assert!(engine.is_typed_array(ctx, typed));
        assert!(!engine.is_array(ctx, typed));
        assert!(engine.is_function(ctx, function));
        assert_eq!(engine.value_to_string(ctx, typed).unwrap(), "1,44");
    }

    #[test]
    fn test_protect_counts() {
        let engine = MockEngine::new();
        let ctx = context(&engine);
        let value = eval(&engine, ctx, "({})").unwrap();
        engine.protect(ctx, value);
        engine.protect(ctx, value);
        assert_eq!(engine.protect_count(value), 2);
        engine.unprotect(ctx, value);
        assert_eq!(engine.protect_count(value), 1);
        assert_eq!(engine.unprotect_calls(value), 1);
        assert_eq!(engine.total_unprotects(), 1);
    }

    #[test]
    fn test_context_and_group_lifetimes() {
        let engine = MockEngine::new();
        let group = engine.create_group();
        let ctx = engine.create_context(Some(group));
        assert_eq!(engine.context_group(ctx), group);
        assert_eq!(engine.live_groups(), 1);

        engine.release_group(group);
        assert_eq!(engine.live_groups(), 1);
        engine.release_context(ctx);
        assert_eq!(engine.live_contexts(), 0);
        assert_eq!(engine.live_groups(), 0);

        engine.refuse_contexts(true);
        assert!(engine.create_context(None).is_null());
    }

    #[test]
    fn test_host_function_can_reenter_engine() {
        let engine = Arc::new(MockEngine::new());
        let ctx = context(&engine);
        let inner = Arc::downgrade(&engine);
        let callback: HostFunction = Arc::new(move |ctx: NativeHandle, _this: NativeHandle, args: &[NativeHandle]| {
            let engine = inner.upgrade().expect("engine alive");
            let sum = args
                .iter()
                .map(|arg| engine.value_to_number(ctx, *arg))
                .sum::<NativeResult<f64>>()?;
            Ok(engine.make_number(ctx, sum))
        });

        let function = engine.make_function(ctx, "sum", callback);
        let global = engine.global_object(ctx);
        engine.set_property(ctx, global, "sum", function).unwrap();

        assert_eq!(eval_string(&engine, ctx, "sum(1, 2, 3)"), "6");
        assert_eq!(eval_string(&engine, ctx, "sum.name"), "sum");
        assert!(engine.is_function(ctx, function));
        let thrown = eval(&engine, ctx, "new sum()").unwrap_err();
        assert_eq!(thrown_prop(&engine, ctx, thrown, "name"), "TypeError");
    }

    #[test]
    fn test_host_function_errors_are_thrown() {
        let engine = MockEngine::new();
        let ctx = context(&engine);
        let error = engine.make_error(ctx, "from host");
        let callback: HostFunction = Arc::new(move |_: NativeHandle, _: NativeHandle, _: &[NativeHandle]| Err(Thrown(error)));
        let function = engine.make_function(ctx, "fail", callback);
        let global = engine.global_object(ctx);
        engine.set_property(ctx, global, "fail", function).unwrap();

        let thrown = eval(&engine, ctx, "fail()").unwrap_err();
        assert_eq!(thrown, Thrown(error));
        assert_eq!(thrown_prop(&engine, ctx, thrown, "message"), "from host");
    }

    #[test]
    fn test_host_functions_released_with_context() {
        let engine = MockEngine::new();
        let ctx = context(&engine);
        let marker = Arc::new(());
        let held = marker.clone();
        let callback: HostFunction = Arc::new(move |_: NativeHandle, _: NativeHandle, _: &[NativeHandle]| {
            let _ = &held;
            Ok(NativeHandle::NULL)
        });
        let function = engine.make_function(ctx, "noop", callback);
        assert!(!function.is_null());
        assert_eq!(Arc::strong_count(&marker), 2);

        engine.release_context(ctx);
        assert_eq!(Arc::strong_count(&marker), 1);
        let late: HostFunction =
            Arc::new(|_: NativeHandle, _: NativeHandle, _: &[NativeHandle]| Ok(NativeHandle::NULL));
        assert!(engine.make_function(ctx, "late", late).is_null());
    }
}
