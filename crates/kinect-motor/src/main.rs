//! kinect-motor-cli: command-line control for the Kinect tilt motor.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use log::LevelFilter;

mod cli;

/// Shared shutdown flag, cleared by the Ctrl+C handler.
pub static RUNNING: AtomicBool = AtomicBool::new(true);

#[derive(Parser)]
#[command(
    name = "kinect-motor-cli",
    version,
    about = "Tilt control for the Kinect motor/accelerometer USB device"
)]
struct Args {
    /// Output as JSON (for devices, tilt, watch, config)
    #[arg(long, global = true)]
    json: bool,

    /// Log at debug level regardless of the configured debug_level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Read configuration from this file instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: cli::Command,
}

fn main() {
    let args = Args::parse();
    let (config, warnings) = cli::load_config(args.config.as_deref());

    let level = if args.verbose {
        LevelFilter::Debug.max(config.log_level())
    } else {
        config.log_level()
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .format_target(false)
        .init();

    for w in &warnings {
        log::warn!("{w}");
    }

    ctrlc::set_handler(move || {
        RUNNING.store(false, Ordering::SeqCst);
    })
    .ok();

    let ctx = cli::Context {
        config,
        config_path: args.config,
        json: args.json,
    };
    if let Err(e) = cli::run(args.command, &ctx) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
