//! `devices` subcommand: list connected motor units.

use super::{DevicesOutput, Result, print_json, usb};

pub(super) fn cmd_devices(json: bool) -> Result<()> {
    let devices = usb::enumerate_devices();

    if json {
        return print_json(&DevicesOutput {
            count: devices.len(),
            devices,
        });
    }

    if devices.is_empty() {
        println!("No Kinect motor units found.");
        return Ok(());
    }

    println!(
        "Found {} Kinect motor unit{}:",
        devices.len(),
        if devices.len() == 1 { "" } else { "s" }
    );
    println!();

    for (i, dev) in devices.iter().enumerate() {
        println!("  [{}] usb:{}", i + 1, dev.address);
        if let Some(ref serial) = dev.serial {
            println!("      Serial: {serial}");
        }
    }

    Ok(())
}
