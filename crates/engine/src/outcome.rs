//! Value types flowing out of the sandbox.
//!
//! Script return values are dynamically typed; they are checked once at the
//! sandbox boundary and converted into these closed types. Nothing past
//! [`crate::Sandbox::execute`] ever looks at a raw Lua value except the
//! opaque state, which is only handed back to the interpreter.

use std::fmt;
use std::time::Duration;

use crate::error::ScriptError;

/// Sentinel a script returns (as `DELAY_FOREVER`) to run once and stop.
pub const DELAY_FOREVER_SENTINEL: i64 = -1;

/// Cadence requested by a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delay {
    /// Re-run the program after this many milliseconds.
    Millis(u64),
    /// Execute once, then leave the program slot empty.
    Forever,
}

impl Delay {
    pub fn is_forever(&self) -> bool {
        matches!(self, Delay::Forever)
    }

    /// The finite sleep duration, or `None` for [`Delay::Forever`].
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Delay::Millis(ms) => Some(Duration::from_millis(*ms)),
            Delay::Forever => None,
        }
    }

    /// Convert the raw integer a script returned.
    pub fn from_script(raw: i64) -> Result<Self, ScriptError> {
        if raw == DELAY_FOREVER_SENTINEL {
            Ok(Delay::Forever)
        } else if raw >= 0 {
            Ok(Delay::Millis(raw as u64))
        } else {
            Err(ScriptError::Runtime(format!(
                "delay must be a non-negative integer or DELAY_FOREVER, got {}",
                raw
            )))
        }
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delay::Millis(ms) => write!(f, "{}ms", ms),
            Delay::Forever => write!(f, "forever"),
        }
    }
}

/// One frame of color bytes, exactly `pixel_count * 3` long.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame").field("len", &self.0.len()).finish()
    }
}

/// Interpreter-owned value threaded between invocations of one program.
///
/// Only meaningful to the sandbox that produced it. Dropping it releases the
/// registry reference, so the value becomes collectable.
#[derive(Clone)]
pub struct OpaqueState(pub(crate) mlua::Value);

impl fmt::Debug for OpaqueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueState({})", self.0.type_name())
    }
}

/// A compiled upload: source text plus the loaded chunk.
#[derive(Clone)]
pub struct Script {
    source: String,
    pub(crate) chunk: mlua::Function,
}

impl Script {
    pub(crate) fn new(source: String, chunk: mlua::Function) -> Self {
        Self { source, chunk }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script").field("len", &self.source.len()).finish()
    }
}

/// Result of one invocation.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Success {
        frame: Frame,
        delay: Delay,
        next_state: Option<OpaqueState>,
    },
    Failure(ScriptError),
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// The failure message, if any.
    pub fn failure(&self) -> Option<&ScriptError> {
        match self {
            ExecutionOutcome::Failure(err) => Some(err),
            ExecutionOutcome::Success { .. } => None,
        }
    }
}
