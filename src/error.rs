//! Error types for the Lua sandbox.

use std::os::raw::c_int;

use thiserror::Error;

/// Errors that can occur while driving a sandboxed interpreter.
///
/// Every variant carries the message that explains it. For guest-originated
/// failures this is the text the interpreter left on its stack; for value
/// conversion failures it is built host-side from the offending type name.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    /// The chunk did not compile.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// The memory budget refused an allocation the interpreter needed.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The chunk file could not be opened or read.
    #[error("file error: {0}")]
    File(String),

    /// Guest code raised an error that no handler caught.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The guest error handler itself failed.
    #[error("error in error handler: {0}")]
    ErrorHandler(String),

    /// A value could not be converted between host and guest.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// The interpreter reported a status this crate does not model.
    #[error("interpreter fault (status {code}): {message}")]
    InterpreterFault {
        /// Raw status code returned by the interpreter.
        code: i32,
        /// The interpreter's message, if one could be captured.
        message: String,
    },

    /// The stack did not hold what the operation needed.
    #[error("stack error: {0}")]
    Stack(String),
}

/// The failure kinds a host can react to, without their messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`SandboxError::Syntax`].
    Syntax,
    /// See [`SandboxError::OutOfMemory`].
    OutOfMemory,
    /// See [`SandboxError::File`].
    File,
    /// See [`SandboxError::Runtime`].
    Runtime,
    /// See [`SandboxError::ErrorHandler`].
    ErrorHandler,
    /// See [`SandboxError::TypeMismatch`].
    TypeMismatch,
    /// See [`SandboxError::InterpreterFault`].
    InterpreterFault,
    /// See [`SandboxError::Stack`].
    Stack,
}

impl SandboxError {
    /// Map a failing interpreter status code and its captured message to an error.
    ///
    /// Status codes without a dedicated variant (including a stray `LUA_OK`)
    /// become [`SandboxError::InterpreterFault`].
    pub(crate) fn from_status(code: c_int, message: String) -> Self {
        use mlua_sys as ffi;

        match code {
            ffi::LUA_ERRSYNTAX => SandboxError::Syntax(message),
            ffi::LUA_ERRMEM => SandboxError::OutOfMemory(message),
            ffi::LUA_ERRFILE => SandboxError::File(message),
            ffi::LUA_ERRRUN => SandboxError::Runtime(message),
            ffi::LUA_ERRERR => SandboxError::ErrorHandler(message),
            code => SandboxError::InterpreterFault { code, message },
        }
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Syntax(_) => ErrorKind::Syntax,
            SandboxError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            SandboxError::File(_) => ErrorKind::File,
            SandboxError::Runtime(_) => ErrorKind::Runtime,
            SandboxError::ErrorHandler(_) => ErrorKind::ErrorHandler,
            SandboxError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            SandboxError::InterpreterFault { .. } => ErrorKind::InterpreterFault,
            SandboxError::Stack(_) => ErrorKind::Stack,
        }
    }

    /// The message attached to this error.
    pub fn message(&self) -> &str {
        match self {
            SandboxError::Syntax(m)
            | SandboxError::OutOfMemory(m)
            | SandboxError::File(m)
            | SandboxError::Runtime(m)
            | SandboxError::ErrorHandler(m)
            | SandboxError::TypeMismatch(m)
            | SandboxError::Stack(m) => m,
            SandboxError::InterpreterFault { message, .. } => message,
        }
    }

    /// Check if this error represents memory pressure.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, SandboxError::OutOfMemory(_))
    }

    /// Check if this error represents a compile failure.
    pub fn is_syntax(&self) -> bool {
        matches!(self, SandboxError::Syntax(_))
    }

    /// Check if this error represents an uncaught guest error.
    pub fn is_runtime(&self) -> bool {
        matches!(self, SandboxError::Runtime(_))
    }

    /// Check if this error represents a failed value conversion.
    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, SandboxError::TypeMismatch(_))
    }

    /// Check if this error represents a stack precondition failure.
    pub fn is_stack(&self) -> bool {
        matches!(self, SandboxError::Stack(_))
    }

    /// Check if retrying the same operation later may succeed.
    ///
    /// Memory pressure is transient: the sandbox stays usable and frees
    /// garbage on the next collection. Compile and conversion failures are
    /// deterministic for the same input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SandboxError::OutOfMemory(_) | SandboxError::Runtime(_) | SandboxError::ErrorHandler(_)
        )
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
