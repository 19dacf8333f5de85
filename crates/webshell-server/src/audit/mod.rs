//! Exec auditing sinks and the strace-based auditor.

pub mod strace;

pub use strace::ExecAuditor;

use std::fs::OpenOptions;
use std::io::{self, LineWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Shared line-oriented destination for audit lines.
pub type AuditSink = Arc<Mutex<dyn Write + Send>>;

/// Name of the exec audit log inside the audit directory.
pub const EXEC_LOG_NAME: &str = "exec-audit.log";

/// Emits one tracing event per complete line written to it.
#[derive(Debug, Default)]
pub struct TracingWriter {
    buf: Vec<u8>,
}

impl Write for TracingWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        for &b in data {
            if b == b'\n' {
                let line = String::from_utf8_lossy(&self.buf);
                info!(target: "webshell::audit", "{}", line.trim_end_matches('\r'));
                self.buf.clear();
            } else {
                self.buf.push(b);
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that logs audit lines through tracing.
pub fn tracing_sink() -> AuditSink {
    Arc::new(Mutex::new(TracingWriter::default()))
}

/// Sink that appends audit lines to `<dir>/exec-audit.log`.
pub fn file_sink(dir: &Path) -> io::Result<AuditSink> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(EXEC_LOG_NAME))?;
    Ok(Arc::new(Mutex::new(LineWriter::new(file))))
}
