//! Command auditing via strace.
//!
//! Attaches `strace` to a shell and turns its `execve` trace lines into
//! `Audit: [PID <pid>] <command>` lines on an [`AuditSink`].

use super::AuditSink;
use regex::Regex;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use webshell_core::{WebshellError, WebshellResult};

const SYSCALL_EXECVE: &str = "execve";

static EXECVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[pid\s+(\d+)\]\s+([\d\.]+)\s+execve\((.+)\)\s+=\s+\d+")
        .expect("execve pattern is valid")
});

/// One traced `execve` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecEvent {
    pub pid: u32,
    pub timestamp: SystemTime,
    /// Raw argument list as printed by strace.
    pub command: String,
}

impl ExecEvent {
    pub fn audit_line(&self) -> String {
        format!("Audit: [PID {}] {}\n", self.pid, self.command)
    }
}

/// Cheap pre-filter applied before the regex.
pub fn filter(line: &str) -> bool {
    line.contains(SYSCALL_EXECVE)
}

/// Parse a successful `execve` line. Anything else yields `None`.
pub fn parse(line: &str) -> Option<ExecEvent> {
    let caps = EXECVE_RE.captures(line)?;
    let pid = caps[1].parse().ok()?;
    let (secs, micros) = caps[2].split_once('.')?;
    let secs: u64 = secs.parse().ok()?;
    let micros: u64 = micros.parse().ok()?;

    Some(ExecEvent {
        pid,
        timestamp: UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_micros(micros),
        command: caps[3].to_string(),
    })
}

fn find_strace() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join("strace"))
        .find(|candidate| candidate.is_file())
}

/// A running strace attached to one process.
pub struct ExecAuditor {
    child: Child,
    pid: u32,
}

impl ExecAuditor {
    /// Attach to `pid`. Returns `Ok(None)` when strace is not installed.
    pub fn attach(pid: u32, sink: AuditSink) -> WebshellResult<Option<Self>> {
        let Some(strace) = find_strace() else {
            warn!("strace is not installed, command auditing is disabled");
            return Ok(None);
        };

        let mut child = Command::new(strace)
            .args(["-fttt", "-qqq", "-s", "2048", "-e", "trace=execve", "-p"])
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WebshellError::Spawn(format!("strace: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WebshellError::Spawn("strace stderr unavailable".into()))?;

        std::thread::Builder::new()
            .name(format!("strace-{pid}"))
            .spawn(move || forward(BufReader::new(stderr), sink))?;

        info!(pid, "exec auditor attached");
        Ok(Some(Self { child, pid }))
    }

    /// Kill and reap the tracer.
    pub fn stop(mut self) {
        if let Err(e) = self.child.kill() {
            debug!(pid = self.pid, error = %e, "strace already gone");
        }
        if let Err(e) = self.child.wait() {
            warn!(pid = self.pid, error = %e, "failed to reap strace");
        }
        debug!(pid = self.pid, "exec auditor stopped");
    }
}

fn forward<R: BufRead>(reader: R, sink: AuditSink) {
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if !filter(&line) {
            continue;
        }
        let Some(event) = parse(&line) else { continue };
        let Ok(mut sink) = sink.lock() else { break };
        if let Err(e) = sink.write_all(event.audit_line().as_bytes()) {
            warn!(error = %e, "failed to write audit line");
        }
    }
}
