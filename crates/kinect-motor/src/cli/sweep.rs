//! `sweep` subcommand: the demo tilt pattern.

use std::time::Duration;

use super::{Context, Result, Session, TiltCommand, pause};

pub(super) const DEFAULT_ROUNDS: u32 = 4;

/// Up, level, down, level; each round scaled by `(rounds - round) / rounds`.
const PATTERN: [i32; 4] = [0, 45, 0, -45];

/// Commands sent over `rounds` rounds. The amplitude shrinks linearly and
/// reaches zero on the last round.
pub(super) fn sweep_steps(rounds: u32) -> Vec<i32> {
    let span = rounds.saturating_sub(1).max(1) as i32;
    (0..rounds as i32)
        .flat_map(|round| PATTERN.iter().map(move |cmd| cmd * (span - round) / span))
        .collect()
}

pub(super) fn cmd_sweep(ctx: &Context, rounds: u32, step_pause: Duration) -> Result<()> {
    let steps = sweep_steps(rounds);
    let session = Session::open(&ctx.config)?;
    println!(
        "Sweeping {} over {rounds} round{} (Ctrl+C to stop)...",
        session.device.address,
        if rounds == 1 { "" } else { "s" }
    );

    for value in steps {
        session.node.write_raw(value)?;
        println!("  {}", TiltCommand::from(value as i8));
        if !pause(step_pause) {
            println!("Interrupted.");
            break;
        }
    }

    session.node.write_raw(0)?;
    pause(Duration::from_millis(250));
    session.close()
}
