//! Sandboxed Lua frame engine for addressable LED strips.
//!
//! Uploads are compiled and run once by an [`UploadSession`]; accepted
//! programs are then re-run by the [`Scheduler`] on the cadence they return.
//! Both paths go through one shared [`Engine`] handle.

pub mod engine;
pub mod error;
pub mod helpers;
pub mod outcome;
pub mod sandbox;
pub mod scheduler;
pub mod session;
pub mod sink;

pub use engine::{Engine, EngineMetrics, ExecutionGuard, MetricsSnapshot, ResetSignal};
pub use error::{ScriptError, UploadError};
pub use outcome::{Delay, ExecutionOutcome, Frame, DELAY_FOREVER_SENTINEL};
pub use sandbox::{Sandbox, SandboxConfig, DEFAULT_MEMORY_BUDGET, PIX_NUM};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
pub use session::{Outbox, UploadSession, LUA_CODE_LEN, OUTBOX_DEPTH};
pub use sink::{DiscardSink, FrameSink, HardwareError, RecordingSink, SerialSink, DEFAULT_BAUD};
