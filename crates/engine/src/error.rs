//! Error types for script execution and upload handling.

use std::fmt;

/// Why a script was rejected or a periodic invocation stopped.
///
/// Every variant carries the human-readable message that is reported to the
/// uploading client (or logged, for periodic ticks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// The source failed to parse.
    Compile(String),
    /// The script raised an error or returned a value of the wrong shape.
    Runtime(String),
    /// An allocation would have exceeded the sandbox memory cap.
    ResourceExceeded(String),
}

impl ScriptError {
    /// The message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            ScriptError::Compile(msg) => msg,
            ScriptError::Runtime(msg) => msg,
            ScriptError::ResourceExceeded(msg) => msg,
        }
    }

    /// Classify an mlua error raised while running a chunk.
    ///
    /// Memory errors can arrive wrapped in callback errors when the cap is hit
    /// inside a helper, so the chain is walked before falling back to the
    /// runtime category.
    pub(crate) fn from_lua(error: &mlua::Error) -> Self {
        if is_memory_error(error) {
            return ScriptError::ResourceExceeded(format!(
                "memory limit exceeded: {}",
                format_lua_error(error)
            ));
        }
        match error {
            mlua::Error::SyntaxError { .. } => ScriptError::Compile(format_lua_error(error)),
            _ => ScriptError::Runtime(format_lua_error(error)),
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::Compile(msg) => write!(f, "Compile error: {}", msg),
            ScriptError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
            ScriptError::ResourceExceeded(msg) => write!(f, "Resource exceeded: {}", msg),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Terminal errors for an upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// The accumulated message would exceed the upload cap.
    TooLarge { limit: usize, attempted: usize },
    /// The session was already rejected; no more chunks are accepted.
    Closed,
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::TooLarge { limit, attempted } => {
                write!(f, "Upload too large: {} bytes (limit {})", attempted, limit)
            }
            UploadError::Closed => write!(f, "Upload session closed"),
        }
    }
}

impl std::error::Error for UploadError {}

fn is_memory_error(error: &mlua::Error) -> bool {
    match error {
        mlua::Error::MemoryError(_) => true,
        mlua::Error::CallbackError { cause, .. } => is_memory_error(cause),
        mlua::Error::WithContext { cause, .. } => is_memory_error(cause),
        _ => false,
    }
}

/// Format a Lua error for display to a client.
pub(crate) fn format_lua_error(error: &mlua::Error) -> String {
    match error {
        mlua::Error::SyntaxError { message, .. } => {
            // Strip the "[string \"...\"]:1: " prefix if present
            if let Some(idx) = message.find("]:") {
                message[idx + 2..].to_string()
            } else {
                message.clone()
            }
        }
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::MemoryError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        mlua::Error::WithContext { cause, .. } => format_lua_error(cause),
        _ => error.to_string(),
    }
}
