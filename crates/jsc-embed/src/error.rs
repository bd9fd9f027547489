//! Error types for the embedding layer
//!
//! Errors fall into three groups. Script errors are JavaScript exceptions and
//! may be routed to a context's exception handler. Engine handle errors mean
//! the native engine broke its contract by returning a null value. Queue
//! errors mean the context's worker no longer accepts work. Only script errors
//! are ever delivered to an exception handler.

use thiserror::Error;

use crate::value::Value;

/// Result type alias for embedding operations
pub type EmbedResult<T> = Result<T, EmbedError>;

/// A JavaScript exception raised by evaluated or called code
///
/// Carries the thrown value itself plus the details that could be read from
/// it on the engine thread.
#[derive(Debug, Clone, Error)]
#[error("{name}: {message}")]
pub struct ScriptError {
    /// Error type name, e.g. `TypeError`. `Error` for thrown primitives.
    pub name: String,
    pub message: String,
    pub source_url: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub stack: Option<String>,
    /// The value passed to `throw`
    pub thrown: Value,
}

impl ScriptError {
    pub fn new(name: impl Into<String>, message: impl Into<String>, thrown: Value) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            source_url: None,
            line: None,
            column: None,
            stack: None,
            thrown,
        }
    }

    /// Source location as `(url, line, column)` when any part is known
    pub fn location(&self) -> Option<(Option<&str>, Option<u32>, Option<u32>)> {
        if self.source_url.is_none() && self.line.is_none() && self.column.is_none() {
            return None;
        }
        Some((self.source_url.as_deref(), self.line, self.column))
    }
}

/// Errors that can occur while driving an embedded engine
#[derive(Debug, Error)]
pub enum EmbedError {
    /// JavaScript exception
    #[error(transparent)]
    Script(Box<ScriptError>),

    /// The engine returned a null handle where a value was required
    #[error("Engine returned a null handle from {operation}")]
    EngineHandle { operation: String },

    /// Work submitted after the queue (or the context) was shut down
    #[error("Work queue is closed")]
    QueueClosed,

    /// A unit of work panicked on the engine thread
    #[error("Unit of work panicked: {0}")]
    WorkerPanicked(String),

    /// The engine could not create a context or group
    #[error("Context creation failed: {message}")]
    ContextCreation { message: String },

    /// Type conversion error
    #[error("Type error: expected {expected}, got {actual}")]
    TypeError { expected: String, actual: String },

    /// Configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// Internal/unexpected error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ScriptError> for EmbedError {
    fn from(error: ScriptError) -> Self {
        Self::Script(Box::new(error))
    }
}

impl EmbedError {
    /// Create a null-handle error for the named engine operation
    pub fn engine_handle(operation: impl Into<String>) -> Self {
        Self::EngineHandle {
            operation: operation.into(),
        }
    }

    /// Create a context creation error
    pub fn context_creation(message: impl Into<String>) -> Self {
        Self::ContextCreation {
            message: message.into(),
        }
    }

    /// Create a type error
    pub fn type_error(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::TypeError {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this is a JavaScript exception
    pub fn is_script_error(&self) -> bool {
        matches!(self, Self::Script(_))
    }

    /// The script error, if this is one
    pub fn as_script_error(&self) -> Option<&ScriptError> {
        match self {
            Self::Script(error) => Some(error),
            _ => None,
        }
    }

    /// Get the error type name (e.g., "TypeError", "QueueClosed")
    pub fn error_type(&self) -> &str {
        match self {
            Self::Script(error) => &error.name,
            Self::EngineHandle { .. } => "EngineHandleError",
            Self::QueueClosed => "QueueClosedError",
            Self::WorkerPanicked(_) => "WorkerPanic",
            Self::ContextCreation { .. } => "ContextError",
            Self::TypeError { .. } => "TypeError",
            Self::Config(_) => "ConfigError",
            Self::Internal(_) => "InternalError",
        }
    }
}
