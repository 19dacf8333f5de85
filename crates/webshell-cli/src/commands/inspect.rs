//! `webshell inspect`: summarize a recording.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use webshell_core::ttyrec::{Header, Replayer};

#[derive(Debug, Serialize)]
struct Summary {
    header: Header,
    timings: usize,
    duration_ms: i64,
    decoded_length: u64,
}

pub fn run(file: &Path, json: bool) -> Result<()> {
    let replayer = Replayer::open(file)
        .with_context(|| format!("failed to open recording {}", file.display()))?;
    let recording = replayer.recording();

    let summary = Summary {
        header: recording.header,
        timings: recording.timings.len(),
        duration_ms: recording.duration_ms(),
        decoded_length: recording.audit_len(),
    };

    if json {
        let out = serde_json::to_string_pretty(&summary).context("failed to encode summary")?;
        println!("{out}");
        return Ok(());
    }

    let h = &summary.header;
    println!("{:<20} {}", "FILE", file.display());
    println!("{:<20} {:#010x}", "MAGIC", h.magic);
    println!("{:<20} {}", "VERSION", h.version);
    println!("{:<20} {:?}", "AUDIT COMPRESSION", h.audit_compression);
    println!("{:<20} {:?}", "TIMING COMPRESSION", h.timing_compression);
    println!("{:<20} {} (+{})", "AUDIT", h.audit_offset, h.audit_length);
    println!("{:<20} {} (+{})", "TIMING", h.timing_offset, h.timing_length);
    println!("{:<20} {}", "TIMINGS", summary.timings);
    println!("{:<20} {} ms", "DURATION", summary.duration_ms);
    println!("{:<20} {} bytes", "DECODED", summary.decoded_length);
    Ok(())
}
