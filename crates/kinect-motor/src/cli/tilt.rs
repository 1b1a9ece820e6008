//! `tilt` subcommand: send one command and hold the device open briefly.

use std::time::Duration;

use super::{
    Context, Result, Session, TiltCommand, TiltOutput, kv, kv_width, node_name, pause, print_json,
};

pub(super) fn cmd_tilt(ctx: &Context, value: i32, hold_ms: u64) -> Result<()> {
    // Reject out-of-range values before touching the bus.
    let command = TiltCommand::new(value)?;

    let session = Session::open(&ctx.config)?;
    session.node.write_raw(value)?;
    log::debug!("{}: sent {command}", node_name(session.minor));

    // Releasing cancels an in-flight write, so give it time to land.
    if !pause(Duration::from_millis(hold_ms)) {
        log::info!("interrupted");
    }

    let feedback = session
        .node
        .instance()
        .map(|i| i.feedback_state().to_string())
        .unwrap_or_default();

    if ctx.json {
        print_json(&TiltOutput {
            device: format!("usb:{}", session.device.address),
            node: node_name(session.minor),
            command: command.value(),
            feedback,
        })?;
    } else {
        let w = kv_width(&["Device:", "Node:", "Command:", "Feedback:"], &[]);
        kv("Device:", format_args!("usb:{}", session.device.address), w);
        kv("Node:", node_name(session.minor), w);
        kv("Command:", command, w);
        kv("Feedback:", feedback, w);
    }

    session.close()
}
