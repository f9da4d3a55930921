//! Resource-bounded Lua interpreter.
//!
//! # Architecture Notes
//!
//! One `Sandbox` owns one `mlua::Lua` state. It is not safe to enter from two
//! threads at once; callers reach it only through the engine lock (see
//! [`crate::Engine::lock`]).
//!
//! Every allocation the interpreter makes (standard libraries, bootstrap
//! code, compiled chunks, frames under construction, retained opaque state)
//! counts against a single cap. The cap is set once, after library and
//! bootstrap initialization, to `baseline + memory_budget` so the fixed
//! overhead does not eat into the budget users see.
//!
//! Scripts are invoked as `chunk(counter, state)` and must return
//! `frame, delay, state`. Return values are checked here and nowhere else.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mlua::{HookTriggers, Lua, MultiValue, Table, Value, VmState};

use crate::error::{format_lua_error, ScriptError};
use crate::helpers;
use crate::outcome::{Delay, ExecutionOutcome, Frame, OpaqueState, Script, DELAY_FOREVER_SENTINEL};

/// Default pixel count of the strip.
pub const PIX_NUM: usize = 300;

/// Default memory available to user scripts, above the bootstrap baseline.
pub const DEFAULT_MEMORY_BUDGET: usize = 4 * 1024 * 1024;

/// How often to check the instruction budget (every N instructions).
pub const INSTRUCTION_HOOK_INTERVAL: u32 = 10_000;

/// Globals removed before any user code runs.
const REMOVED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "debug",
    "package",
    "require",
    "loadfile",
    "dofile",
    "load",
    "collectgarbage",
];

/// Library tables each program gets its own copy of.
const PROGRAM_LIBRARIES: &[&str] = &["string", "table", "math", "utf8", "coroutine"];

/// Chunk name used in error messages for uploaded code.
const UPLOAD_CHUNK_NAME: &str = "upload";

/// Configuration for a new sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Pixels on the strip; a frame is three bytes per pixel.
    pub pixel_count: usize,
    /// Bytes available to user scripts above the post-bootstrap baseline.
    pub memory_budget: usize,
    /// Instructions per invocation before it is aborted. 0 disables the check.
    pub instruction_limit: u64,
    /// Trusted Lua run once in the global environment before sandboxing.
    pub bootstrap: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            pixel_count: PIX_NUM,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            instruction_limit: 0,
            bootstrap: None,
        }
    }
}

/// The interpreter wrapper.
pub struct Sandbox {
    lua: Lua,
    frame_len: usize,
    instruction_limit: u64,
    memory_limit: usize,
}

impl Sandbox {
    /// Create a sandbox: libraries, helpers, bootstrap, then the memory cap.
    ///
    /// A failing bootstrap script is reported as the error it raised.
    pub fn new(config: SandboxConfig) -> Result<Self, ScriptError> {
        let lua = Lua::new();
        let frame_len = config.pixel_count * 3;

        Self::install_globals(&lua, config.pixel_count, frame_len)
            .map_err(|e| ScriptError::Runtime(format!("sandbox setup failed: {}", format_lua_error(&e))))?;

        if let Some(bootstrap) = &config.bootstrap {
            lua.load(bootstrap.as_str())
                .set_name("bootstrap")
                .exec()
                .map_err(|e| ScriptError::from_lua(&e))?;
        }

        // Strings share one metatable; keep it out of reach of uploads
        lua.load("getmetatable('').__metatable = false")
            .set_name("sandbox")
            .exec()
            .map_err(|e| ScriptError::Runtime(format!("sandbox setup failed: {}", format_lua_error(&e))))?;

        let globals = lua.globals();
        for name in REMOVED_GLOBALS {
            globals
                .set(*name, Value::Nil)
                .map_err(|e| ScriptError::Runtime(format_lua_error(&e)))?;
        }

        lua.gc_collect().map_err(|e| ScriptError::from_lua(&e))?;
        let baseline = lua.used_memory();
        let memory_limit = baseline + config.memory_budget;
        lua.set_memory_limit(memory_limit)
            .map_err(|e| ScriptError::Runtime(format!("cannot set memory limit: {}", e)))?;

        log::debug!(
            "Sandbox ready: baseline {} bytes, limit {} bytes, frame {} bytes",
            baseline,
            memory_limit,
            frame_len
        );

        Ok(Self {
            lua,
            frame_len,
            instruction_limit: config.instruction_limit,
            memory_limit,
        })
    }

    fn install_globals(lua: &Lua, pixel_count: usize, frame_len: usize) -> mlua::Result<()> {
        helpers::install(lua, Instant::now())?;
        let globals = lua.globals();
        globals.set("PIX_NUM", pixel_count as i64)?;
        globals.set("FRAME_LEN", frame_len as i64)?;
        globals.set("DELAY_FOREVER", DELAY_FOREVER_SENTINEL)?;
        Ok(())
    }

    /// Number of bytes in one frame.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Bytes currently allocated by the interpreter.
    pub fn used_memory(&self) -> usize {
        self.lua.used_memory()
    }

    /// The hard allocation ceiling.
    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    /// Compile source into a callable chunk.
    ///
    /// Each chunk gets its own environment table that reads through to the
    /// shared globals, so globals a program assigns stay with that program.
    /// The environment's metatable is hidden and the library tables are
    /// per-program copies, so neither path reaches the shared state.
    pub fn compile(&self, source: &str) -> Result<Script, ScriptError> {
        let env = self.program_env().map_err(|e| ScriptError::from_lua(&e))?;
        let chunk = self
            .lua
            .load(source)
            .set_name(UPLOAD_CHUNK_NAME)
            .set_environment(env)
            .into_function()
            .map_err(|e| match ScriptError::from_lua(&e) {
                ScriptError::Runtime(msg) => ScriptError::Compile(msg),
                other => other,
            })?;
        Ok(Script::new(source.to_string(), chunk))
    }

    fn program_env(&self) -> mlua::Result<Table> {
        let globals = self.lua.globals();
        let env = self.lua.create_table()?;
        env.raw_set("_G", env.clone())?;
        for name in PROGRAM_LIBRARIES {
            if let Value::Table(lib) = globals.raw_get::<Value>(*name)? {
                let copy = self.lua.create_table()?;
                for pair in lib.pairs::<Value, Value>() {
                    let (key, value) = pair?;
                    copy.raw_set(key, value)?;
                }
                env.raw_set(*name, copy)?;
            }
        }

        let meta = self.lua.create_table()?;
        meta.set("__index", globals)?;
        meta.set("__metatable", false)?;
        env.set_metatable(Some(meta));
        Ok(env)
    }

    /// Invoke a compiled script with the counter and the prior opaque state.
    pub fn execute(&self, script: &Script, counter: u32, state: Option<&OpaqueState>) -> ExecutionOutcome {
        let prior = state.map(|s| s.0.clone()).unwrap_or(Value::Nil);

        let budget = self.arm_instruction_budget();
        let result = script.chunk.call::<MultiValue>((counter as i64, prior));
        if budget.is_some() {
            self.lua.remove_hook();
        }

        let outcome = match result {
            Ok(values) => match self.read_outcome(values) {
                Ok(outcome) => outcome,
                Err(err) => ExecutionOutcome::Failure(err),
            },
            Err(err) => ExecutionOutcome::Failure(ScriptError::from_lua(&err)),
        };

        if !outcome.is_success() {
            // Release whatever the failed invocation left behind
            if let Err(e) = self.lua.gc_collect() {
                log::warn!("Garbage collection after failure failed: {}", e);
            }
        }
        outcome
    }

    fn arm_instruction_budget(&self) -> Option<Arc<AtomicI64>> {
        if self.instruction_limit == 0 {
            return None;
        }
        let limit = self.instruction_limit;
        let budget = Arc::new(AtomicI64::new(limit.min(i64::MAX as u64) as i64));
        let remaining = budget.clone();
        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(INSTRUCTION_HOOK_INTERVAL),
            move |_lua, _debug| {
                let left = remaining.fetch_sub(INSTRUCTION_HOOK_INTERVAL as i64, Ordering::Relaxed);
                if left <= 0 {
                    Err(mlua::Error::RuntimeError(format!(
                        "instruction limit exceeded ({} instructions)",
                        limit
                    )))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );
        Some(budget)
    }

    fn read_outcome(&self, values: MultiValue) -> Result<ExecutionOutcome, ScriptError> {
        let mut values = values.into_iter();

        let frame = match values.next() {
            Some(Value::Table(table)) => self.read_frame(&table)?,
            other => {
                return Err(ScriptError::Runtime(format!(
                    "script must return a frame table first, got {}",
                    other.as_ref().map(Value::type_name).unwrap_or("nothing")
                )));
            }
        };

        let delay = match values.next().unwrap_or(Value::Nil) {
            Value::Nil => Delay::Forever,
            Value::Integer(ms) => Delay::from_script(ms)?,
            Value::Number(ms) if ms.is_finite() && ms.fract() == 0.0 => Delay::from_script(ms as i64)?,
            other => {
                return Err(ScriptError::Runtime(format!(
                    "delay must be an integer number of milliseconds, got {}",
                    other.type_name()
                )));
            }
        };

        let next_state = match values.next() {
            None | Some(Value::Nil) => None,
            Some(value) => Some(OpaqueState(value)),
        };

        Ok(ExecutionOutcome::Success { frame, delay, next_state })
    }

    fn read_frame(&self, table: &Table) -> Result<Frame, ScriptError> {
        let len = table.raw_len();
        if len != self.frame_len {
            return Err(ScriptError::Runtime(format!(
                "frame must contain exactly {} values, got {}",
                self.frame_len, len
            )));
        }

        let mut bytes = Vec::with_capacity(len);
        for i in 1..=len {
            let value: Value = table.raw_get(i).map_err(|e| ScriptError::from_lua(&e))?;
            let byte = match value {
                Value::Integer(v) => v.clamp(0, 255) as u8,
                Value::Number(v) if !v.is_nan() => v.floor().clamp(0.0, 255.0) as u8,
                other => {
                    return Err(ScriptError::Runtime(format!(
                        "frame value #{} must be a number, got {}",
                        i,
                        other.type_name()
                    )));
                }
            };
            bytes.push(byte);
        }
        Ok(Frame::new(bytes))
    }

    #[cfg(test)]
    pub(crate) fn lua(&self) -> &Lua {
        &self.lua
    }
}
