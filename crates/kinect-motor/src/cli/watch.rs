//! `watch` subcommand: attach units as they appear and report hotplug events.

use std::time::Duration;

use super::{Context, HotplugWatcher, MotorDriver, PlatformSource, RUNNING, Result};

pub(super) fn cmd_watch(ctx: &Context) -> Result<()> {
    let driver = MotorDriver::new(ctx.config.driver_options());
    let mut watcher = HotplugWatcher::new(PlatformSource::default(), &ctx.config.device_serial);
    let interval = Duration::from_millis(ctx.config.hotplug_interval_ms);

    if !ctx.json {
        println!("Watching for Kinect motor units (Ctrl+C to stop)...");
    }

    watcher.run(&driver, interval, &RUNNING, |event| {
        if ctx.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(e) => log::warn!("event serialization failed: {e}"),
            }
        } else {
            println!("{event}");
        }
    });

    if !ctx.json {
        println!("Stopped.");
    }
    Ok(())
}
