// Process-wide running flag, cleared by SIGINT/SIGTERM

use std::sync::atomic::AtomicBool;

static RUNNING: AtomicBool = AtomicBool::new(true);

/// Install the handlers and return the flag they clear.
pub fn install() -> &'static AtomicBool {
    #[cfg(unix)]
    {
        extern "C" fn on_signal(_signal: libc::c_int) {
            // Only an atomic store; async-signal-safe
            RUNNING.store(false, std::sync::atomic::Ordering::SeqCst);
        }

        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler only performs an atomic store.
        unsafe {
            libc::signal(libc::SIGINT, handler);
            libc::signal(libc::SIGTERM, handler);
        }
    }
    &RUNNING
}
