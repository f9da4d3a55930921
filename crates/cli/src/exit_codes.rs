//! Exit Code Registry
//!
//! Single source of truth for every process exit code of `ledsand`.
//! Service supervisors (systemd, runit) key restart policy off these.
//!
//! # Exit Code Ranges
//!
//! | Range   | Domain        | Description                               |
//! |---------|---------------|-------------------------------------------|
//! | 0       | Universal     | Clean shutdown                            |
//! | 1       | Universal     | General error (unspecified)               |
//! | 2       | Universal     | CLI usage error (clap)                    |
//! | 10-19   | config        | Settings file and overrides               |
//! | 20-29   | startup       | Frame device, bootstrap, interpreter      |
//! | 30-39   | network       | Listener                                  |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant in the appropriate range
//! 2. Document what triggers it
//! 3. Update the table above

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Clean shutdown after SIGINT/SIGTERM.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure (e.g. the scheduler thread could not
/// be spawned). Prefer a specific code.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments. Emitted by clap itself.
#[allow(dead_code)]
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Config (10-19)
// =============================================================================

/// Settings file unreadable, unparsable, or values out of range.
pub const EXIT_CONFIG: u8 = 10;

// =============================================================================
// Startup (20-29)
// =============================================================================

/// Frame device could not be opened or configured.
pub const EXIT_HARDWARE: u8 = 20;

/// Bootstrap script could not be read, or raised an error.
pub const EXIT_BOOTSTRAP: u8 = 21;

/// Interpreter could not be created (no bootstrap involved).
pub const EXIT_INTERPRETER: u8 = 22;

// =============================================================================
// Network (30-39)
// =============================================================================

/// Listening socket could not be bound.
pub const EXIT_BIND: u8 = 30;
