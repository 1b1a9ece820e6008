//! CLI subcommands: listing, tilt control and hotplug watching.

mod config_cmd;
mod devices;
mod sweep;
mod tilt;
mod watch;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Subcommand;
use serde::Serialize;

pub(super) use crate::RUNNING;
pub(super) use kinect_motor_lib::config::Config;
pub(super) use kinect_motor_lib::driver::MotorDriver;
pub(super) use kinect_motor_lib::error::{MotorError, Result};
pub(super) use kinect_motor_lib::hotplug::{DeviceInfo, HotplugWatcher};
pub(super) use kinect_motor_lib::node::MotorNode;
pub(super) use kinect_motor_lib::protocol::{TiltCommand, node_name};
pub(super) use kinect_motor_lib::usb::{self, PlatformSource, PlatformTransport};

/// Settings shared by every subcommand.
pub struct Context {
    pub config: Config,
    /// `--config` override, if given.
    pub config_path: Option<PathBuf>,
    pub json: bool,
}

/// Load the config from `path` (or the default location) and collect
/// everything worth warning about.
pub fn load_config(path: Option<&Path>) -> (Config, Vec<String>) {
    let (config, mut warnings) = match path {
        Some(p) => {
            let loaded = Config::load_from(p);
            if !p.exists() {
                let mut w = loaded.1;
                w.push(format!("config file {} not found, using defaults", p.display()));
                (loaded.0, w)
            } else {
                loaded
            }
        }
        None => Config::load_with_warnings(),
    };
    if let Err(errors) = config.validate() {
        warnings.extend(errors.iter().map(|e| format!("config: {e}")));
    }
    (config, warnings)
}

const PADDING: usize = 2;

/// Compute alignment width for a command's key-value output.
/// Ensures at least PADDING spaces after the longest key in either level,
/// with top-level and indent values aligned to the same column.
pub(super) fn kv_width(top: &[&str], indent: &[&str]) -> usize {
    let top_max = top.iter().map(|k| k.len()).max().unwrap_or(0);
    let indent_max = indent.iter().map(|k| k.len()).max().unwrap_or(0);
    let top_need = if top.is_empty() { 0 } else { top_max + PADDING };
    // Indent keys lose 2 chars of inner width to the "  " prefix
    let indent_need = if indent.is_empty() {
        0
    } else {
        indent_max + PADDING + 2
    };
    top_need.max(indent_need)
}

pub(super) fn format_kv(key: &str, value: impl std::fmt::Display, w: usize) -> String {
    format!("{key:<width$}{value}", width = w)
}

pub(super) fn kv(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("{}", format_kv(key, value, w));
}

pub(super) fn kv_indent(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("  {key:<width$}{value}", width = w - 2);
}

pub(super) fn print_json(value: &impl Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    println!("{text}");
    Ok(())
}

/// Sleep for `duration`, waking early on Ctrl+C. Returns `false` if
/// interrupted.
pub(super) fn pause(duration: Duration) -> bool {
    const TICK: Duration = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < duration {
        if !RUNNING.load(Ordering::SeqCst) {
            return false;
        }
        let step = TICK.min(duration - waited);
        std::thread::sleep(step);
        waited += step;
    }
    RUNNING.load(Ordering::SeqCst)
}

// ── Session ──

/// One unit attached and opened for the duration of a command.
pub(super) struct Session {
    pub device: DeviceInfo,
    pub minor: u32,
    pub node: MotorNode<PlatformTransport>,
    driver: MotorDriver<PlatformTransport>,
}

impl Session {
    pub fn open(config: &Config) -> Result<Self> {
        let (device, transport) = usb::open_transport(&config.device_serial)?;
        let driver = MotorDriver::new(config.driver_options());
        let minor = driver.attach(transport)?;
        let node = MotorNode::open(&driver, minor)?;
        Ok(Session {
            device,
            minor,
            node,
            driver,
        })
    }

    pub fn close(self) -> Result<()> {
        let Session {
            node,
            driver,
            minor,
            ..
        } = self;
        let released = node.release();
        driver.detach(minor);
        released
    }
}

// ── JSON output structs ──

#[derive(Serialize)]
pub(super) struct DevicesOutput {
    pub count: usize,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Serialize)]
pub(super) struct TiltOutput {
    pub device: String,
    pub node: String,
    pub command: i8,
    pub feedback: String,
}

#[derive(Serialize)]
pub(super) struct ConfigOutput {
    pub config_file: Option<String>,
    pub config_file_exists: bool,
    pub log_level: String,
    pub settings: Config,
    pub problems: Vec<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// List connected Kinect motor units
    Devices,

    /// Send one tilt command (-128..=127; positive tilts up, 0 holds)
    Tilt {
        /// Signed tilt value
        #[arg(allow_hyphen_values = true)]
        value: i32,
        /// How long to keep the device open after sending, in milliseconds
        #[arg(long, default_value_t = 500)]
        hold_ms: u64,
    },

    /// Run the demo sweep: 0, +45, 0, -45, shrinking each round
    Sweep {
        /// Number of rounds
        #[arg(long, default_value_t = sweep::DEFAULT_ROUNDS)]
        rounds: u32,
        /// Pause between steps, in milliseconds
        #[arg(long, default_value_t = 1000)]
        pause_ms: u64,
    },

    /// Attach units as they are plugged in and report hotplug events until Ctrl+C
    Watch,

    /// Show current configuration and file paths
    Config {
        /// Write a default config file instead of showing the current one
        #[arg(long)]
        init: bool,
        /// With --init, overwrite an existing file
        #[arg(long, requires = "init")]
        force: bool,
    },
}

/// Warn if `--json` was passed to a command that doesn't support it.
fn warn_json_unsupported(cmd_name: &str) {
    log::warn!("--json is not supported for `{cmd_name}` (ignored)");
}

pub fn run(cmd: Command, ctx: &Context) -> Result<()> {
    match cmd {
        Command::Devices => devices::cmd_devices(ctx.json),
        Command::Tilt { value, hold_ms } => tilt::cmd_tilt(ctx, value, hold_ms),
        Command::Sweep { rounds, pause_ms } => {
            if ctx.json {
                warn_json_unsupported("sweep");
            }
            sweep::cmd_sweep(ctx, rounds, Duration::from_millis(pause_ms))
        }
        Command::Watch => watch::cmd_watch(ctx),
        Command::Config { init: true, force } => config_cmd::cmd_config_init(ctx, force),
        Command::Config { .. } => config_cmd::cmd_config(ctx),
    }
}

#[cfg(test)]
mod format_tests {
    use super::*;

    #[test]
    fn kv_width_top_only() {
        let w = kv_width(&["Short:", "Longer key:"], &[]);
        // "Longer key:" = 11 + PADDING = 13
        assert_eq!(w, 13);
    }

    #[test]
    fn kv_width_indent_drives_width() {
        let w = kv_width(&["A:"], &["hotplug_interval_ms:"]);
        // 20 + PADDING + 2 = 24
        assert_eq!(w, 24);
    }

    #[test]
    fn kv_width_empty_both() {
        assert_eq!(kv_width(&[], &[]), 0);
    }

    #[test]
    fn values_align_across_levels() {
        let w = kv_width(&["Top:"], &["Indent:"]);
        let top = format_kv("Top:", "V", w);
        let indent = format!("  {:<width$}{}", "Indent:", "V", width = w - 2);
        assert_eq!(top.find('V'), indent.find('V'));
    }

    #[test]
    fn format_kv_longer_than_width() {
        assert_eq!(format_kv("ExactWidth:", "val", 10), "ExactWidth:val");
    }
}
