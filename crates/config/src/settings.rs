// Server settings
// Loaded from ~/.config/ledsand/settings.toml, or an explicit --config path

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest memory budget accepted for user scripts.
pub const MIN_MEMORY_BUDGET: usize = 64 * 1024;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, message: String },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "cannot read {}: {}", path.display(), source),
            ConfigError::Parse { path, message } => write!(f, "invalid {}: {}", path.display(), message),
            ConfigError::Invalid(msg) => write!(f, "invalid settings: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Pixels on the strip (frame = 3 bytes per pixel)
    pub pixel_count: usize,

    /// Bytes available to scripts above the bootstrap baseline
    pub memory_budget: usize,

    /// Maximum upload size in bytes
    pub max_upload: usize,

    /// Scheduler sleep slice
    pub quantum_ms: u64,

    /// Scheduler delay before the first upload
    pub initial_delay_ms: u64,

    /// Per-connection reply queue depth
    pub outbox_depth: usize,

    /// Concurrent WebSocket connections
    pub max_clients: usize,

    /// Serial line speed
    pub baud: u32,

    /// Directory listed by the examples endpoint
    pub examples_dir: PathBuf,

    /// Lua file run once before sandboxing
    pub bootstrap: Option<PathBuf>,

    /// Instructions per invocation, 0 = unlimited
    pub instruction_limit: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pixel_count: 300,
            memory_budget: 4 * 1024 * 1024,
            max_upload: 1024 * 1024,
            quantum_ms: 20,
            initial_delay_ms: 1000,
            outbox_depth: 20,
            max_clients: 8,
            baud: 115_200,
            examples_dir: PathBuf::from("scripts"),
            bootstrap: None,
            instruction_limit: 0,
        }
    }
}

impl Settings {
    /// Default settings file path, if the platform has a config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ledsand").join("settings.toml"))
    }

    /// Load from an explicit path, or the default path if it exists, or
    /// fall back to built-in defaults. The result is validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = match explicit {
            Some(path) => Self::load_from(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from(&path)?,
                _ => {
                    log::debug!("No settings file found, using defaults");
                    Self::default()
                }
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a TOML settings file. Missing keys take their defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let settings = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse { path: path.to_path_buf(), message: e.to_string() })?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pixel_count == 0 {
            return Err(ConfigError::Invalid("pixel_count must be at least 1".into()));
        }
        if self.quantum_ms == 0 {
            return Err(ConfigError::Invalid("quantum_ms must be at least 1".into()));
        }
        if self.outbox_depth == 0 {
            return Err(ConfigError::Invalid("outbox_depth must be at least 1".into()));
        }
        if self.max_upload == 0 {
            return Err(ConfigError::Invalid("max_upload must be at least 1".into()));
        }
        if self.memory_budget < MIN_MEMORY_BUDGET {
            return Err(ConfigError::Invalid(format!(
                "memory_budget must be at least {} bytes, got {}",
                MIN_MEMORY_BUDGET, self.memory_budget
            )));
        }
        Ok(())
    }

    pub fn quantum(&self) -> Duration {
        Duration::from_millis(self.quantum_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_settings(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.pixel_count, 300);
        assert_eq!(settings.max_upload, 1_048_576);
        assert_eq!(settings.quantum(), Duration::from_millis(20));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_settings("pixel_count = 60\nbootstrap = \"init.lua\"\n");
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.pixel_count, 60);
        assert_eq!(settings.bootstrap, Some(PathBuf::from("init.lua")));
        assert_eq!(settings.outbox_depth, 20);
        assert_eq!(settings.examples_dir, PathBuf::from("scripts"));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_unknown_key_is_parse_error() {
        let file = write_settings("pixel_cuont = 60\n");
        let err = Settings::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("pixel_cuont"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let file = write_settings("quantum_ms = 0\n");
        assert!(matches!(Settings::load(Some(file.path())), Err(ConfigError::Invalid(_))));

        let settings = Settings { memory_budget: 1024, ..Default::default() };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("memory_budget"));

        let settings = Settings { pixel_count: 0, ..Default::default() };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let settings = Settings { max_clients: 2, instruction_limit: 5_000_000, ..Default::default() };
        let text = toml::to_string(&settings).unwrap();
        let file = write_settings(&text);
        assert_eq!(Settings::load_from(file.path()).unwrap(), settings);
    }
}
