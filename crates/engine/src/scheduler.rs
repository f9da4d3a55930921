//! Periodic scheduler: re-runs the current program on its own cadence.
//!
//! Per cycle, under the execution lock:
//! 1. a pending reset request wins: adopt its delay, restart the counter;
//! 2. otherwise run the program slot once (if any) and emit its frame.
//!
//! Then sleep for the delay, sliced into quanta so a new reset request is
//! noticed within one quantum no matter how long the old cadence was.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::engine::{Engine, EngineMetrics, PeriodicRun};
use crate::error::ScriptError;
use crate::outcome::Delay;

/// Default sleep slice.
pub const DEFAULT_QUANTUM: Duration = Duration::from_millis(20);

/// Counter value after adopting a reset (the upload run used 0).
pub const COUNTER_START: u32 = 1;

/// The invocation counter wraps to 0 here.
pub const COUNTER_MODULUS: u32 = 0x10000;

/// Delay used before any program has been uploaded.
pub const DEFAULT_INITIAL_DELAY: Delay = Delay::Millis(1000);

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub quantum: Duration,
    pub initial_delay: Delay,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quantum: DEFAULT_QUANTUM,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }
}

/// What one cycle did.
#[derive(Debug)]
pub enum CycleEvent {
    /// A reset request was drained; nothing was executed.
    Adopted(Delay),
    /// The program ran with `counter` and asked for `delay` next.
    Executed { counter: u32, delay: Delay },
    /// The program failed and was dropped from the slot.
    Failed(ScriptError),
    /// No program installed.
    Idle,
}

/// How a sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Elapsed,
    Preempted,
    Stopped,
}

pub fn next_counter(counter: u32) -> u32 {
    (counter + 1) % COUNTER_MODULUS
}

/// Scheduler state machine. Runs on its own thread via [`SchedulerHandle`].
pub struct Scheduler {
    engine: Engine,
    delay: Delay,
    counter: u32,
    quantum: Duration,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(engine: Engine, config: SchedulerConfig, running: Arc<AtomicBool>) -> Self {
        Self {
            engine,
            delay: config.initial_delay,
            counter: COUNTER_START,
            quantum: config.quantum.max(Duration::from_millis(1)),
            running,
        }
    }

    pub fn delay(&self) -> Delay {
        self.delay
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// One cycle: drain a reset request, or run the slot once.
    pub fn cycle(&mut self) -> CycleEvent {
        let engine = self.engine.clone();
        let mut core = engine.lock();

        if let Some(delay) = self.engine.reset_signal().take() {
            self.delay = delay;
            self.counter = COUNTER_START;
            EngineMetrics::bump(&self.engine.metrics().resets_adopted);
            log::debug!("Scheduler adopted new cadence: {}", delay);
            return CycleEvent::Adopted(delay);
        }

        match self.engine.run_periodic(&mut core, self.counter) {
            PeriodicRun::Idle => {
                self.idle_floor();
                CycleEvent::Idle
            }
            PeriodicRun::Ran(delay) => {
                let counter = self.counter;
                self.delay = delay;
                self.counter = next_counter(counter);
                if delay.is_forever() {
                    log::debug!("Periodic program finished with DELAY_FOREVER");
                }
                CycleEvent::Executed { counter, delay }
            }
            PeriodicRun::Failed(err) => {
                log::warn!("Periodic program removed after failure: {}", err);
                self.idle_floor();
                CycleEvent::Failed(err)
            }
        }
    }

    /// With nothing to run, wait at least one quantum between cycles.
    fn idle_floor(&mut self) {
        let floor = self.quantum.as_millis() as u64;
        if let Delay::Millis(ms) = self.delay {
            if ms < floor {
                self.delay = Delay::Millis(floor);
            }
        }
    }

    /// Sleep for the current delay in quantum slices.
    pub fn sleep(&self) -> SleepOutcome {
        let mut remaining = self.delay.as_duration();
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return SleepOutcome::Stopped;
            }
            if self.engine.reset_signal().is_pending() {
                return SleepOutcome::Preempted;
            }
            let step = match remaining {
                Some(left) if left.is_zero() => return SleepOutcome::Elapsed,
                Some(left) => left.min(self.quantum),
                None => self.quantum,
            };
            thread::sleep(step);
            if let Some(left) = remaining.as_mut() {
                *left -= step;
            }
        }
    }

    /// Cycle and sleep until the running flag is cleared.
    pub fn run(mut self) {
        log::info!("Scheduler started (quantum {:?})", self.quantum);
        while self.running.load(Ordering::SeqCst) {
            self.cycle();
            if self.sleep() == SleepOutcome::Stopped {
                break;
            }
        }
        log::info!("Scheduler stopped");
    }
}

/// Owns the scheduler thread; stopping joins it.
pub struct SchedulerHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn spawn(engine: Engine, config: SchedulerConfig) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let scheduler = Scheduler::new(engine, config, running.clone());
        let thread = thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || scheduler.run())?;
        Ok(Self { running, thread: Some(thread) })
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.running.load(Ordering::SeqCst)
    }

    /// Clear the running flag and wait for the thread to exit.
    ///
    /// Returns after at most one quantum plus any in-flight execution.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Scheduler thread panicked");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{Sandbox, SandboxConfig};
    use crate::sink::RecordingSink;
    use std::time::Instant;

    fn engine() -> (Engine, RecordingSink) {
        let sink = RecordingSink::new();
        let sandbox = Sandbox::new(SandboxConfig { pixel_count: 1, ..Default::default() }).unwrap();
        (Engine::new(sandbox, Box::new(sink.clone())), sink)
    }

    fn scheduler(engine: &Engine) -> Scheduler {
        Scheduler::new(engine.clone(), SchedulerConfig::default(), Arc::new(AtomicBool::new(true)))
    }

    #[test]
    fn test_counter_wraps() {
        assert_eq!(next_counter(1), 2);
        assert_eq!(next_counter(COUNTER_MODULUS - 1), 0);
    }

    #[test]
    fn test_idle_without_program() {
        let (engine, sink) = engine();
        let mut s = scheduler(&engine);
        assert!(matches!(s.cycle(), CycleEvent::Idle));
        assert_eq!(s.delay(), DEFAULT_INITIAL_DELAY);
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_reset_has_priority_over_execution() {
        let (engine, sink) = engine();
        engine.submit("local c = ... return {c, 0, 0}, 50").unwrap();
        let mut s = scheduler(&engine);

        assert!(matches!(s.cycle(), CycleEvent::Adopted(Delay::Millis(50))));
        assert_eq!(s.counter(), COUNTER_START);
        assert_eq!(sink.count(), 1);

        assert!(matches!(s.cycle(), CycleEvent::Executed { counter: 1, delay: Delay::Millis(50) }));
        assert!(matches!(s.cycle(), CycleEvent::Executed { counter: 2, .. }));
        let firsts: Vec<u8> = sink.frames().iter().map(|f| f[0]).collect();
        assert_eq!(firsts, vec![0, 1, 2]);
    }

    #[test]
    fn test_new_upload_restarts_counter() {
        let (engine, _sink) = engine();
        let mut s = scheduler(&engine);
        engine.submit("return {0, 0, 0}, 5").unwrap();
        s.cycle();
        s.cycle();
        s.cycle();
        assert_eq!(s.counter(), 3);

        engine.submit("return {1, 1, 1}, 7").unwrap();
        assert!(matches!(s.cycle(), CycleEvent::Adopted(Delay::Millis(7))));
        assert_eq!(s.counter(), COUNTER_START);
    }

    #[test]
    fn test_forever_upload_leaves_scheduler_idle() {
        let (engine, sink) = engine();
        let mut s = scheduler(&engine);
        engine.submit("return {9, 9, 9}, DELAY_FOREVER").unwrap();
        assert!(matches!(s.cycle(), CycleEvent::Adopted(Delay::Forever)));
        for _ in 0..3 {
            assert!(matches!(s.cycle(), CycleEvent::Idle));
        }
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_periodic_failure_is_fail_stop() {
        let (engine, sink) = engine();
        let mut s = scheduler(&engine);
        engine
            .submit("local c = ... if c == 2 then error('bad tick') end return {c, 0, 0}, 5")
            .unwrap();
        s.cycle();
        assert!(matches!(s.cycle(), CycleEvent::Executed { counter: 1, .. }));
        assert!(matches!(s.cycle(), CycleEvent::Failed(ScriptError::Runtime(_))));
        assert!(matches!(s.cycle(), CycleEvent::Idle));
        assert_eq!(sink.count(), 2);
        assert_eq!(engine.metrics().snapshot().periodic_failures, 1);
    }

    #[test]
    fn test_zero_delay_failure_does_not_spin() {
        let (engine, _sink) = engine();
        let mut s = scheduler(&engine);
        engine
            .submit("local c = ... if c == 2 then error('bad tick') end return {0, 0, 0}, 0")
            .unwrap();
        s.cycle();
        assert!(matches!(s.cycle(), CycleEvent::Executed { counter: 1, delay: Delay::Millis(0) }));
        assert!(matches!(s.cycle(), CycleEvent::Failed(_)));
        assert_eq!(s.delay(), Delay::Millis(DEFAULT_QUANTUM.as_millis() as u64));

        let started = Instant::now();
        assert_eq!(s.sleep(), SleepOutcome::Elapsed);
        assert!(started.elapsed() >= DEFAULT_QUANTUM);
        assert!(matches!(s.cycle(), CycleEvent::Idle));
        assert_eq!(s.delay(), Delay::Millis(DEFAULT_QUANTUM.as_millis() as u64));
    }

    #[test]
    fn test_sleep_preempted_within_quantum() {
        let (engine, _sink) = engine();
        engine.submit("return {0, 0, 0}, 1000").unwrap();
        let mut s = scheduler(&engine);
        s.cycle();
        assert_eq!(s.delay(), Delay::Millis(1000));

        let raiser = {
            let engine = engine.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                engine.reset_signal().raise(Delay::Millis(40));
                Instant::now()
            })
        };
        let outcome = s.sleep();
        let woke = Instant::now();
        let raised = raiser.join().unwrap();

        assert_eq!(outcome, SleepOutcome::Preempted);
        // One quantum plus scheduling slack, far below the 700ms left
        assert!(woke.duration_since(raised) < Duration::from_millis(150));
        assert!(matches!(s.cycle(), CycleEvent::Adopted(Delay::Millis(40))));
    }

    #[test]
    fn test_sleep_forever_until_stopped() {
        let (engine, _sink) = engine();
        let running = Arc::new(AtomicBool::new(true));
        let mut s = Scheduler::new(engine.clone(), SchedulerConfig::default(), running.clone());
        engine.submit("return {0, 0, 0}").unwrap();
        s.cycle();
        assert_eq!(s.delay(), Delay::Forever);

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            running.store(false, Ordering::SeqCst);
        });
        assert_eq!(s.sleep(), SleepOutcome::Stopped);
        stopper.join().unwrap();
    }

    #[test]
    fn test_sleep_elapses() {
        let (engine, _sink) = engine();
        let s = Scheduler::new(
            engine,
            SchedulerConfig { quantum: DEFAULT_QUANTUM, initial_delay: Delay::Millis(45) },
            Arc::new(AtomicBool::new(true)),
        );
        let start = Instant::now();
        assert_eq!(s.sleep(), SleepOutcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_handle_drives_frames_and_stops() {
        let (engine, sink) = engine();
        let mut handle = SchedulerHandle::spawn(
            engine.clone(),
            SchedulerConfig { quantum: Duration::from_millis(5), initial_delay: Delay::Millis(10) },
        )
        .unwrap();
        engine.submit("return {255, 0, 0}, 10").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.count() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
        assert!(!handle.is_running());
        assert!(sink.count() >= 4);
        assert!(sink.frames().iter().all(|f| f == &vec![255, 0, 0]));

        let after = sink.count();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.count(), after);
    }
}
