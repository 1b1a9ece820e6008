//! Driver configuration: TOML-based, platform-aware paths.

use std::fmt;
use std::path::{Path, PathBuf};

use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::driver::DriverOptions;
use crate::protocol::INIT_TIMEOUT_MS;

/// Header comment prepended to saved config files.
const CONFIG_HEADER: &str = "# kinect-motor configuration\n\n";

// ── Log verbosity bitmask ──

pub const DEBUG_LEVEL_CRITICAL: u32 = 0x01;
pub const DEBUG_LEVEL_ERROR: u32 = 0x03;
pub const DEBUG_LEVEL_WARN: u32 = 0x07;
pub const DEBUG_LEVEL_INFO: u32 = 0x0F;
pub const DEBUG_LEVEL_DEBUG: u32 = 0x1F;

/// Longest accepted attach-time transfer timeout.
const MAX_INIT_TIMEOUT_MS: u64 = 60_000;

/// Shortest accepted hotplug polling interval.
const MIN_HOTPLUG_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Log verbosity bitmask. Default: 0x0F (info).
    #[serde(default = "default_debug_level")]
    pub debug_level: u32,

    /// Log function entry at trace level.
    #[serde(default)]
    pub debug_trace: bool,

    /// Arm the limit-switch feedback loop when the unit supports it.
    #[serde(default = "default_true")]
    pub feedback: bool,

    /// Allow only one open handle per unit at a time.
    #[serde(default)]
    pub exclusive_open: bool,

    /// Timeout for each attach-time control transfer, in milliseconds.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,

    /// How often `watch` rescans the bus, in milliseconds.
    #[serde(default = "default_hotplug_interval_ms")]
    pub hotplug_interval_ms: u64,

    /// Preferred device serial number. Empty = first device found.
    #[serde(default)]
    pub device_serial: String,
}

fn default_debug_level() -> u32 {
    DEBUG_LEVEL_INFO
}

fn default_true() -> bool {
    true
}

fn default_init_timeout_ms() -> u64 {
    INIT_TIMEOUT_MS
}

fn default_hotplug_interval_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug_level: default_debug_level(),
            debug_trace: false,
            feedback: true,
            exclusive_open: false,
            init_timeout_ms: default_init_timeout_ms(),
            hotplug_interval_ms: default_hotplug_interval_ms(),
            device_serial: String::new(),
        }
    }
}

/// Validation errors that [`Config::validate`] can return.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// `debug_level` has bits outside the known mask.
    InvalidDebugLevel(u32),
    /// A millisecond field is out of range.
    InvalidDuration { field: &'static str, reason: String },
    /// `device_serial` contains whitespace or control characters.
    InvalidSerial(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidDebugLevel(v) => {
                write!(f, "Invalid debug_level 0x{v:02x} (allowed bits: 0x1f)")
            }
            ValidationError::InvalidDuration { field, reason } => {
                write!(f, "Invalid {field}: {reason}")
            }
            ValidationError::InvalidSerial(s) => write!(f, "Invalid device_serial: {s:?}"),
        }
    }
}

impl Config {
    /// Platform-specific config directory.
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("kinect-motor"))
    }

    /// Full path to config file.
    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    /// Save config to an arbitrary path atomically (write to temp file, then rename).
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        let contents = format!("{CONFIG_HEADER}{serialized}");
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, &contents)?;
        match std::fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Rename can fail across filesystems; fall back to direct write + cleanup
                let result = std::fs::write(path, &contents);
                let _ = std::fs::remove_file(&tmp);
                result
            }
        }
    }

    /// Save config to the default platform path.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No config directory",
            ));
        };
        self.save_to(&path)
    }

    /// Load config from an arbitrary path, returning the config and any parse warnings.
    ///
    /// Returns `(defaults, [])` if the file doesn't exist.
    /// Returns `(defaults, [warning])` if the file exists but can't be parsed.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, vec![]),
                Err(e) => {
                    let warning = format!(
                        "config parse error ({}), using defaults: {e}",
                        path.display()
                    );
                    (Self::default(), vec![warning])
                }
            },
            Err(_) => (Self::default(), vec![]),
        }
    }

    /// Load config from the default path, returning the config and any parse warnings.
    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    /// Map the verbosity bitmask onto a `log` filter.
    ///
    /// `debug_trace` forces `Trace`. Otherwise a class is enabled only when
    /// every bit of its mask is set, and the widest enabled class wins:
    /// 0x1F debug, 0x0F info, 0x07 warn, 0x03 or 0x01 error, else off.
    pub fn log_level(&self) -> LevelFilter {
        if self.debug_trace {
            return LevelFilter::Trace;
        }
        let enabled = |mask: u32| self.debug_level & mask == mask;
        if enabled(DEBUG_LEVEL_DEBUG) {
            LevelFilter::Debug
        } else if enabled(DEBUG_LEVEL_INFO) {
            LevelFilter::Info
        } else if enabled(DEBUG_LEVEL_WARN) {
            LevelFilter::Warn
        } else if enabled(DEBUG_LEVEL_CRITICAL) {
            // 0x03 adds plain errors to critical; both map to `Error`.
            LevelFilter::Error
        } else {
            LevelFilter::Off
        }
    }

    /// Options for a [`MotorDriver`](crate::driver::MotorDriver) built from this config.
    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions::from(self)
    }

    /// Validate all fields.
    ///
    /// Returns `Ok(())` if valid, or `Err(Vec<ValidationError>)` with all problems found.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.debug_level & !DEBUG_LEVEL_DEBUG != 0 {
            errors.push(ValidationError::InvalidDebugLevel(self.debug_level));
        }

        if self.init_timeout_ms == 0 {
            errors.push(ValidationError::InvalidDuration {
                field: "init_timeout_ms",
                reason: "must be greater than 0".into(),
            });
        } else if self.init_timeout_ms > MAX_INIT_TIMEOUT_MS {
            errors.push(ValidationError::InvalidDuration {
                field: "init_timeout_ms",
                reason: format!("{} exceeds {MAX_INIT_TIMEOUT_MS}", self.init_timeout_ms),
            });
        }

        if self.hotplug_interval_ms < MIN_HOTPLUG_INTERVAL_MS {
            errors.push(ValidationError::InvalidDuration {
                field: "hotplug_interval_ms",
                reason: format!(
                    "{} is below the {MIN_HOTPLUG_INTERVAL_MS} ms minimum",
                    self.hotplug_interval_ms
                ),
            });
        }

        if self
            .device_serial
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            errors.push(ValidationError::InvalidSerial(self.device_serial.clone()));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
