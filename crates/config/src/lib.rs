// Configuration loading

pub mod settings;

pub use settings::{ConfigError, Settings, MIN_MEMORY_BUDGET};
