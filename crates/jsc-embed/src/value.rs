//! JavaScript values as seen from Rust
//!
//! Primitives are copied out of the engine on the worker thread. Objects are
//! [`JsObject`] wrappers: one shared wrapper per live native object, holding
//! the engine protect that keeps the object alive. Dropping the last clone of
//! a wrapper, on any thread, queues that protect for release.

use std::fmt;
use std::sync::Arc;

use crate::context::{ContextShared, EmbeddingContext};
use crate::engine::NativeHandle;
use crate::error::{EmbedError, EmbedResult};

/// Format a number the way JavaScript's `String(n)` does
pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{:.0}", n)
    } else {
        format!("{}", n)
    }
}

/// A JavaScript value
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    /// A symbol. Its description is not copied out of the engine.
    Symbol,
    Object(JsObject),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// `undefined` or `null`
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&JsObject> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<JsObject> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    /// `typeof`-style name of the value
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Symbol => "symbol",
            Self::Object(object) if object.is_function() => "function",
            Self::Object(_) => "object",
        }
    }

    /// Convert to JSON.
    ///
    /// Primitives map directly (`undefined` and non-finite numbers become
    /// `null`, as in `JSON.stringify`). Arrays are read element by element.
    /// Other objects and symbols are a type error.
    pub fn to_json(&self) -> EmbedResult<serde_json::Value> {
        Ok(match self {
            Self::Undefined | Self::Null => serde_json::Value::Null,
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Object(object) if object.is_array() => {
                let length = object.length()?;
                let mut items = Vec::with_capacity(length);
                for index in 0..length {
                    items.push(object.get_index(index)?.to_json()?);
                }
                serde_json::Value::Array(items)
            }
            other => {
                return Err(EmbedError::type_error("primitive or array", other.type_name()));
            }
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Number(n) => f.write_str(&format_number(*n)),
            Self::String(s) => f.write_str(s),
            Self::Symbol => f.write_str("Symbol()"),
            Self::Object(object) => write!(f, "[object {}]", object.kind()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<JsObject> for Value {
    fn from(value: JsObject) -> Self {
        Self::Object(value)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::Undefined
    }
}

/// Which wrapper variant an object got when it was first resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Object,
    Array,
    TypedArray,
    Function,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Object => "Object",
            Self::Array => "Array",
            Self::TypedArray => "TypedArray",
            Self::Function => "Function",
        })
    }
}

pub(crate) struct ObjectInner {
    pub(crate) handle: NativeHandle,
    pub(crate) kind: ObjectKind,
    pub(crate) generation: u64,
    pub(crate) context: Arc<ContextShared>,
}

impl Drop for ObjectInner {
    fn drop(&mut self) {
        self.context
            .cache
            .evict(self.handle, self.generation, &self.context.releases);
    }
}

/// Handle to a JavaScript object owned by an [`EmbeddingContext`]
///
/// Clones share one wrapper; resolving the same native object again while
/// any clone is alive yields that same wrapper. Every method is a
/// synchronous unit on the context's worker and follows the context's
/// exception policy.
#[derive(Clone)]
pub struct JsObject {
    inner: Arc<ObjectInner>,
}

impl JsObject {
    pub(crate) fn from_inner(inner: Arc<ObjectInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn shares_context(&self, context: &Arc<ContextShared>) -> bool {
        Arc::ptr_eq(&self.inner.context, context)
    }

    /// The native handle this wrapper protects
    pub fn handle(&self) -> NativeHandle {
        self.inner.handle
    }

    pub fn kind(&self) -> ObjectKind {
        self.inner.kind
    }

    pub fn is_array(&self) -> bool {
        self.inner.kind == ObjectKind::Array
    }

    pub fn is_typed_array(&self) -> bool {
        self.inner.kind == ObjectKind::TypedArray
    }

    pub fn is_function(&self) -> bool {
        self.inner.kind == ObjectKind::Function
    }

    /// The context this object lives in
    pub fn context(&self) -> EmbeddingContext {
        EmbeddingContext::from_shared(self.inner.context.clone())
    }

    /// Read a property
    pub fn get(&self, name: &str) -> EmbedResult<Value> {
        let object = self.handle();
        let name = name.to_string();
        self.inner.context.execute(move |shared| {
            let value = shared
                .engine
                .get_property(shared.handle, object, &name)
                .map_err(|thrown| shared.script_error(thrown))?;
            shared.value_from_handle(value, "get_property")
        })
    }

    /// Read an indexed element
    pub fn get_index(&self, index: usize) -> EmbedResult<Value> {
        self.get(&index.to_string())
    }

    /// Write a property
    pub fn set(&self, name: &str, value: impl Into<Value>) -> EmbedResult<()> {
        let object = self.handle();
        let name = name.to_string();
        let value = value.into();
        self.inner.context.execute(move |shared| {
            let value = shared.handle_for(&value)?;
            shared
                .engine
                .set_property(shared.handle, object, &name, value)
                .map_err(|thrown| shared.script_error(thrown))
        })
    }

    /// Call this object as a function. `this` defaults to the global object.
    pub fn call(&self, this: Option<&JsObject>, args: &[Value]) -> EmbedResult<Value> {
        let function = self.handle();
        let this = this.cloned().map(Value::Object);
        let args = args.to_vec();
        self.inner.context.execute(move |shared| {
            let this = match &this {
                Some(this) => shared.handle_for(this)?,
                None => NativeHandle::NULL,
            };
            let args = args
                .iter()
                .map(|arg| shared.handle_for(arg))
                .collect::<EmbedResult<Vec<_>>>()?;
            let result = shared
                .engine
                .call_as_function(shared.handle, function, this, &args)
                .map_err(|thrown| shared.script_error(thrown))?;
            shared.value_from_handle(result, "call_as_function")
        })
    }

    /// Call this object with `new`
    pub fn construct(&self, args: &[Value]) -> EmbedResult<Value> {
        let constructor = self.handle();
        let args = args.to_vec();
        self.inner.context.execute(move |shared| {
            let args = args
                .iter()
                .map(|arg| shared.handle_for(arg))
                .collect::<EmbedResult<Vec<_>>>()?;
            let result = shared
                .engine
                .call_as_constructor(shared.handle, constructor, &args)
                .map_err(|thrown| shared.script_error(thrown))?;
            shared.value_from_handle(result, "call_as_constructor")
        })
    }

    /// Element count of an array or typed array
    pub fn length(&self) -> EmbedResult<usize> {
        if !matches!(self.kind(), ObjectKind::Array | ObjectKind::TypedArray) {
            return Err(EmbedError::type_error("array", self.kind().to_string()));
        }
        Ok(match self.get("length")? {
            Value::Number(n) if n >= 0.0 => n as usize,
            _ => 0,
        })
    }
}

impl PartialEq for JsObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for JsObject {}

impl fmt::Debug for JsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsObject")
            .field("handle", &self.inner.handle)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(2.0), "2");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(format_number(1e20), "100000000000000000000");
    }

    #[test]
    fn test_primitive_equality() {
        assert_eq!(Value::from(1), Value::Number(1.0));
        assert_eq!(Value::from("a"), Value::String("a".into()));
        assert_ne!(Value::Null, Value::Undefined);
        assert_ne!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_ne!(Value::Symbol, Value::Symbol);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Undefined.to_string(), "undefined");
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Boolean(true).to_string(), "true");
        assert_eq!(Value::from("hi").to_string(), "hi");
    }

    #[test]
    fn test_primitive_json() {
        assert_eq!(Value::Number(1.5).to_json().unwrap(), serde_json::json!(1.5));
        assert_eq!(Value::Number(f64::INFINITY).to_json().unwrap(), serde_json::Value::Null);
        assert_eq!(Value::Undefined.to_json().unwrap(), serde_json::Value::Null);
        assert_eq!(Value::from("x").to_json().unwrap(), serde_json::json!("x"));
        assert!(Value::Symbol.to_json().is_err());
    }

    #[test]
    fn test_accessors() {
        let value = Value::from(true);
        assert_eq!(value.as_bool(), Some(true));
        assert_eq!(value.as_f64(), None);
        assert!(Value::Null.is_nullish());
        assert_eq!(Value::default(), Value::Undefined);
        assert_eq!(Value::from(()).type_name(), "undefined");
    }
}
