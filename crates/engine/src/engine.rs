//! Shared engine state: the execution lock, the program slot and the reset
//! signal.
//!
//! # Concurrency
//!
//! One mutex (`Engine::lock`) guards the interpreter, the program slot and
//! the frame sink together. The upload path and the scheduler both hold it
//! for the whole compile/execute/publish sequence, so the interpreter is
//! never entered twice and the slot is never seen half-replaced.
//!
//! The reset signal lives outside the lock. Raising it is a single atomic
//! store and never waits on a running script or a sleeping scheduler; only
//! draining it happens under the lock.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::ScriptError;
use crate::outcome::{Delay, ExecutionOutcome, Frame, OpaqueState, Script};
use crate::sandbox::Sandbox;
use crate::sink::FrameSink;

/// The current periodic program together with its threaded state.
pub struct Program {
    pub script: Script,
    pub state: Option<OpaqueState>,
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("len", &self.script.len())
            .field("state", &self.state)
            .finish()
    }
}

/// At most one program system-wide. Mutated only through [`Core`].
#[derive(Debug, Default)]
pub struct ProgramSlot {
    program: Option<Program>,
}

impl ProgramSlot {
    pub fn is_empty(&self) -> bool {
        self.program.is_none()
    }

    pub fn source(&self) -> Option<&str> {
        self.program.as_ref().map(|p| p.script.source())
    }

    /// Replace the whole program (source, chunk and state) in one move.
    fn replace(&mut self, program: Program) {
        self.program = Some(program);
    }

    fn clear(&mut self) {
        self.program = None;
    }
}

const NO_RESET: i64 = i64::MIN;
const RESET_FOREVER: i64 = -1;

/// Pending "abandon the current sleep, adopt this cadence" request.
#[derive(Debug)]
pub struct ResetSignal {
    pending: AtomicI64,
}

impl ResetSignal {
    pub fn new() -> Self {
        Self { pending: AtomicI64::new(NO_RESET) }
    }

    /// Publish a new cadence. A later raise overwrites an undrained one.
    pub fn raise(&self, delay: Delay) {
        let raw = match delay {
            Delay::Forever => RESET_FOREVER,
            Delay::Millis(ms) => ms.min(i64::MAX as u64) as i64,
        };
        self.pending.store(raw, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst) != NO_RESET
    }

    /// Take the pending request, leaving none.
    pub fn take(&self) -> Option<Delay> {
        match self.pending.swap(NO_RESET, Ordering::SeqCst) {
            NO_RESET => None,
            RESET_FOREVER => Some(Delay::Forever),
            ms => Some(Delay::Millis(ms as u64)),
        }
    }
}

impl Default for ResetSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Operational counters. Relaxed ordering; for monitoring only.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub compiles: AtomicU64,
    pub uploads_accepted: AtomicU64,
    pub uploads_rejected: AtomicU64,
    pub periodic_runs: AtomicU64,
    pub periodic_failures: AtomicU64,
    pub frames_written: AtomicU64,
    pub sink_errors: AtomicU64,
    pub resets_adopted: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub compiles: u64,
    pub uploads_accepted: u64,
    pub uploads_rejected: u64,
    pub periodic_runs: u64,
    pub periodic_failures: u64,
    pub frames_written: u64,
    pub sink_errors: u64,
    pub resets_adopted: u64,
}

impl EngineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            compiles: self.compiles.load(Ordering::Relaxed),
            uploads_accepted: self.uploads_accepted.load(Ordering::Relaxed),
            uploads_rejected: self.uploads_rejected.load(Ordering::Relaxed),
            periodic_runs: self.periodic_runs.load(Ordering::Relaxed),
            periodic_failures: self.periodic_failures.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
            resets_adopted: self.resets_adopted.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything behind the execution lock.
pub struct Core {
    sandbox: Sandbox,
    slot: ProgramSlot,
    sink: Box<dyn FrameSink>,
}

/// Result of one periodic invocation of the slot.
#[derive(Debug)]
pub enum PeriodicRun {
    /// The slot was empty.
    Idle,
    /// The frame was emitted; the program asked for this delay next.
    Ran(Delay),
    /// The program failed and was removed from the slot.
    Failed(ScriptError),
}

impl Core {
    pub fn slot(&self) -> &ProgramSlot {
        &self.slot
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    fn emit(&mut self, frame: &Frame, metrics: &EngineMetrics) {
        match self.sink.write_frame(frame.as_bytes()) {
            Ok(()) => EngineMetrics::bump(&metrics.frames_written),
            Err(e) => {
                // Fire-and-forget: a failed write does not stop the program
                EngineMetrics::bump(&metrics.sink_errors);
                log::warn!("Frame write failed: {}", e);
            }
        }
    }

    /// Run the slot's program once with `counter`, threading its state.
    fn run_periodic(&mut self, counter: u32, metrics: &EngineMetrics) -> PeriodicRun {
        let Some(program) = self.slot.program.as_mut() else {
            return PeriodicRun::Idle;
        };
        EngineMetrics::bump(&metrics.periodic_runs);

        match self.sandbox.execute(&program.script, counter, program.state.as_ref()) {
            ExecutionOutcome::Success { frame, delay, next_state } => {
                program.state = next_state;
                if delay.is_forever() {
                    self.slot.clear();
                }
                self.emit(&frame, metrics);
                PeriodicRun::Ran(delay)
            }
            ExecutionOutcome::Failure(err) => {
                // Fail-stop: a periodic program that errors is not retried
                self.slot.clear();
                EngineMetrics::bump(&metrics.periodic_failures);
                PeriodicRun::Failed(err)
            }
        }
    }
}

struct Shared {
    core: Mutex<Core>,
    reset: ResetSignal,
    metrics: EngineMetrics,
}

/// Cloneable handle to the shared engine.
///
/// Handed to every upload session and to the scheduler at construction.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

/// Execution-lock guard.
pub type ExecutionGuard<'a> = MutexGuard<'a, Core>;

impl Engine {
    pub fn new(sandbox: Sandbox, sink: Box<dyn FrameSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    sandbox,
                    slot: ProgramSlot::default(),
                    sink,
                }),
                reset: ResetSignal::new(),
                metrics: EngineMetrics::default(),
            }),
        }
    }

    /// Acquire the execution lock.
    pub fn lock(&self) -> ExecutionGuard<'_> {
        self.shared.core.lock()
    }

    pub fn reset_signal(&self) -> &ResetSignal {
        &self.shared.reset
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.shared.metrics
    }

    /// Snapshot of the current program's source, taken under the lock.
    pub fn current_source(&self) -> Option<String> {
        self.lock().slot().source().map(str::to_string)
    }

    /// Whether a periodic program is installed.
    pub fn is_running_program(&self) -> bool {
        !self.lock().slot().is_empty()
    }

    /// Compile and run an upload; publish it on success.
    ///
    /// On success the first frame is emitted, the slot is replaced (or
    /// cleared for `DELAY_FOREVER`) and a reset request carrying the returned
    /// delay is raised. On failure nothing shared is touched.
    pub fn submit(&self, source: &str) -> Result<Delay, ScriptError> {
        let metrics = &self.shared.metrics;
        let mut core = self.lock();

        EngineMetrics::bump(&metrics.compiles);
        let script = match core.sandbox.compile(source) {
            Ok(script) => script,
            Err(err) => {
                EngineMetrics::bump(&metrics.uploads_rejected);
                return Err(err);
            }
        };

        // Interactive runs always start from the fresh state
        match core.sandbox.execute(&script, 0, None) {
            ExecutionOutcome::Success { frame, delay, next_state } => {
                core.emit(&frame, metrics);
                if delay.is_forever() {
                    core.slot.clear();
                } else {
                    core.slot.replace(Program { script, state: next_state });
                }
                // Raising needs no lock; doing it before release keeps the
                // scheduler from ticking the new program on a stale counter.
                self.shared.reset.raise(delay);
                EngineMetrics::bump(&metrics.uploads_accepted);
                Ok(delay)
            }
            ExecutionOutcome::Failure(err) => {
                EngineMetrics::bump(&metrics.uploads_rejected);
                Err(err)
            }
        }
    }

    /// One periodic invocation under the lock. Used by the scheduler.
    pub(crate) fn run_periodic(&self, core: &mut Core, counter: u32) -> PeriodicRun {
        core.run_periodic(counter, &self.shared.metrics)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("reset_pending", &self.shared.reset.is_pending())
            .field("metrics", &self.shared.metrics.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxConfig;
    use crate::sink::RecordingSink;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn engine_with(pixels: usize) -> (Engine, RecordingSink) {
        let sink = RecordingSink::new();
        let sandbox = Sandbox::new(SandboxConfig {
            pixel_count: pixels,
            ..Default::default()
        })
        .unwrap();
        (Engine::new(sandbox, Box::new(sink.clone())), sink)
    }

    fn fill_script(value: u8, delay: &str) -> String {
        format!(
            "local f = {{}} for i = 1, FRAME_LEN do f[i] = {} end return f, {}",
            value, delay
        )
    }

    #[test]
    fn test_reset_signal_take_once() {
        let signal = ResetSignal::new();
        assert!(signal.take().is_none());
        signal.raise(Delay::Millis(500));
        assert!(signal.is_pending());
        assert_eq!(signal.take(), Some(Delay::Millis(500)));
        assert!(!signal.is_pending());
        assert!(signal.take().is_none());

        signal.raise(Delay::Forever);
        assert_eq!(signal.take(), Some(Delay::Forever));
    }

    #[test]
    fn test_reset_signal_latest_wins() {
        let signal = ResetSignal::new();
        signal.raise(Delay::Millis(10));
        signal.raise(Delay::Millis(0));
        assert_eq!(signal.take(), Some(Delay::Millis(0)));
    }

    #[test]
    fn test_submit_publishes_program() {
        let (engine, sink) = engine_with(2);
        let source = fill_script(7, "1000");
        assert_eq!(engine.submit(&source).unwrap(), Delay::Millis(1000));

        assert_eq!(engine.current_source().as_deref(), Some(source.as_str()));
        assert_eq!(engine.reset_signal().take(), Some(Delay::Millis(1000)));
        assert_eq!(sink.frames(), vec![vec![7; 6]]);

        let m = engine.metrics().snapshot();
        assert_eq!(m.uploads_accepted, 1);
        assert_eq!(m.frames_written, 1);
    }

    #[test]
    fn test_submit_forever_clears_slot() {
        let (engine, sink) = engine_with(2);
        engine.submit(&fill_script(1, "1000")).unwrap();
        engine.reset_signal().take();

        assert_eq!(engine.submit(&fill_script(2, "DELAY_FOREVER")).unwrap(), Delay::Forever);
        assert!(!engine.is_running_program());
        assert_eq!(engine.reset_signal().take(), Some(Delay::Forever));
        assert_eq!(sink.last(), Some(vec![2; 6]));
    }

    #[test]
    fn test_failed_submit_leaves_state_untouched() {
        let (engine, sink) = engine_with(2);
        let good = fill_script(3, "100");
        engine.submit(&good).unwrap();
        engine.reset_signal().take();

        assert!(matches!(engine.submit("if then"), Err(ScriptError::Compile(_))));
        assert!(matches!(engine.submit("error('nope')"), Err(ScriptError::Runtime(_))));
        assert!(matches!(engine.submit("return {1}, 10"), Err(ScriptError::Runtime(_))));

        assert_eq!(engine.current_source().as_deref(), Some(good.as_str()));
        assert!(!engine.reset_signal().is_pending());
        assert_eq!(sink.count(), 1);
        assert_eq!(engine.metrics().snapshot().uploads_rejected, 3);
    }

    #[test]
    fn test_periodic_failure_clears_slot() {
        let (engine, _sink) = engine_with(1);
        engine
            .submit("local c = ... if c > 0 then error('tick failed') end return {0, 0, 0}, 10")
            .unwrap();

        let mut core = engine.lock();
        let run = engine.run_periodic(&mut core, 1);
        assert!(matches!(run, PeriodicRun::Failed(ScriptError::Runtime(_))));
        assert!(core.slot().is_empty());
        assert!(matches!(engine.run_periodic(&mut core, 2), PeriodicRun::Idle));
    }

    #[test]
    fn test_periodic_state_threads_from_upload() {
        let (engine, sink) = engine_with(1);
        engine
            .submit(
                r#"
                local counter, state = ...
                local n = (state or 0) + 1
                return {n, counter, 0}, 10, n
            "#,
            )
            .unwrap();

        let mut core = engine.lock();
        for counter in 1..=4 {
            assert!(matches!(engine.run_periodic(&mut core, counter), PeriodicRun::Ran(Delay::Millis(10))));
        }
        drop(core);

        let seen: Vec<u8> = sink.frames().iter().map(|f| f[0]).collect();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_interpreter_never_entered_concurrently() {
        let (engine, _sink) = engine_with(1);
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        {
            let core = engine.lock();
            let lua = core.sandbox().lua();
            let (a, o) = (active.clone(), overlaps.clone());
            let enter = lua
                .create_function(move |_, ()| {
                    if a.fetch_add(1, Ordering::SeqCst) != 0 {
                        o.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                })
                .unwrap();
            let a = active.clone();
            let leave = lua
                .create_function(move |_, ()| {
                    a.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            lua.globals().set("probe_enter", enter).unwrap();
            lua.globals().set("probe_leave", leave).unwrap();
        }

        let script = "probe_enter() local x = 0 for i = 1, 20000 do x = x + i end probe_leave() return {0, 0, 0}, 1";
        let mut handles = Vec::new();
        for _ in 0..4 {
            let engine = engine.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    engine.submit(script).unwrap();
                }
            }));
        }
        let periodic = {
            let engine = engine.clone();
            thread::spawn(move || {
                for counter in 0..100 {
                    let mut core = engine.lock();
                    engine.run_periodic(&mut core, counter);
                }
            })
        };
        for h in handles {
            h.join().unwrap();
        }
        periodic.join().unwrap();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(engine.metrics().snapshot().uploads_accepted, 100);
    }
}
