//! `webshell play`: write a recording to stdout.

use anyhow::{Context, Result};
use std::io::{self, Write};
use std::path::Path;
use tracing::debug;
use webshell_core::ttyrec::Replayer;

pub fn run(file: &Path, speed: i64, frame: Option<usize>, no_delay: bool) -> Result<()> {
    let mut replayer = Replayer::open(file)
        .with_context(|| format!("failed to open recording {}", file.display()))?;
    replayer.set_speed(if no_delay { 0 } else { speed });
    debug!(frames = replayer.frame_count(), speed = replayer.speed(), "loaded recording");

    let stdout = io::stdout();
    let mut out = stdout.lock();

    match frame {
        Some(index) => replayer
            .play_frame(&mut out, index, false)
            .with_context(|| format!("cannot render frame {index}"))?,
        None => replayer.play(&mut out).context("playback failed")?,
    }

    out.flush().context("failed to flush stdout")?;
    Ok(())
}
