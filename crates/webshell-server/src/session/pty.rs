//! PTY process wrapper.
//!
//! Opens a pseudo-terminal with nix, spawns the shell on its slave side and
//! exposes read/write/resize plus an idempotent `kill`. When recording is on,
//! output read through [`PtyReader`] is teed into the recorder.
//!
//! Readers also watch a wake pipe whose write end `kill` closes, so a reader
//! ends even while a detached grandchild keeps the slave side open.

use crate::audit::{AuditSink, ExecAuditor};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe2, Pid, User};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use webshell_core::ttyrec::RecorderHandle;
use webshell_core::{WebshellError, WebshellResult};

/// Credentials of the user a shell runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAs {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl RunAs {
    /// Resolve a user name from the system user database.
    pub fn lookup(name: &str) -> WebshellResult<Self> {
        let user = User::from_name(name)
            .map_err(|e| WebshellError::Config(format!("user lookup {name}: {e}")))?
            .ok_or_else(|| WebshellError::Config(format!("unknown user {name}")))?;
        Ok(Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        })
    }
}

/// Everything needed to start a shell.
#[derive(Clone)]
pub struct SpawnOptions {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// `KEY=value` pairs, already filtered.
    pub env: Vec<String>,
    pub run_as: Option<RunAs>,
    pub cols: u16,
    pub rows: u16,
    pub recorder: RecorderHandle,
    /// Attach an exec auditor writing to this sink.
    pub audit: Option<AuditSink>,
}

impl SpawnOptions {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            env: Vec::new(),
            run_as: None,
            cols: 80,
            rows: 24,
            recorder: RecorderHandle::Disabled,
            audit: None,
        }
    }
}

/// A shell running on its own pseudo-terminal.
pub struct PtyProcess {
    pid: u32,
    master: Mutex<Option<File>>,
    child: Mutex<Child>,
    recorder: RecorderHandle,
    auditor: Mutex<Option<ExecAuditor>>,
    /// Write end of the wake pipe; dropped by `kill`.
    wake_tx: Mutex<Option<OwnedFd>>,
    wake_rx: OwnedFd,
    killed: AtomicBool,
}

impl PtyProcess {
    /// Spawn `options.program` attached to a fresh PTY.
    pub fn spawn(options: SpawnOptions) -> WebshellResult<Self> {
        let size = Winsize {
            ws_row: options.rows,
            ws_col: options.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&size), None)
            .map_err(|e| WebshellError::Spawn(format!("openpty: {e}")))?;
        // Close-on-exec so the shell never holds the write end open.
        let (wake_rx, wake_tx) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| WebshellError::Spawn(format!("wake pipe: {e}")))?;

        let mut cmd = Command::new(&options.program);
        cmd.args(&options.args)
            .current_dir(&options.cwd)
            .env_clear()
            .stdin(stdio_from(&pty.slave)?)
            .stdout(stdio_from(&pty.slave)?)
            .stderr(stdio_from(&pty.slave)?);

        let mut env = options.env.clone();
        if let Some(user) = &options.run_as {
            cmd.uid(user.uid).gid(user.gid);
            super::env::set_var(&mut env, "HOME", &user.home.to_string_lossy());
            super::env::set_var(&mut env, "USER", &user.name);
        }
        if !env.iter().any(|p| p.starts_with("TERM=")) {
            env.push("TERM=xterm-256color".into());
        }
        for pair in &env {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }

        // SAFETY: only async-signal-safe calls run between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| WebshellError::Spawn(format!("{}: {e}", options.program)))?;
        drop(cmd);
        drop(pty.slave);

        let pid = child.id();
        info!(
            pid,
            program = %options.program,
            cols = options.cols,
            rows = options.rows,
            recording = options.recorder.is_active(),
            "shell spawned"
        );

        let auditor = match options.audit {
            Some(sink) => ExecAuditor::attach(pid, sink).unwrap_or_else(|e| {
                warn!(pid, error = %e, "exec auditor failed to start");
                None
            }),
            None => None,
        };

        Ok(Self {
            pid,
            master: Mutex::new(Some(File::from(pty.master))),
            child: Mutex::new(child),
            recorder: options.recorder,
            auditor: Mutex::new(auditor),
            wake_tx: Mutex::new(Some(wake_tx)),
            wake_rx,
            killed: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn recorder(&self) -> &RecorderHandle {
        &self.recorder
    }

    /// A blocking reader over the PTY output, teed into the recorder.
    pub fn take_reader(&self) -> io::Result<PtyReader> {
        let file = self.with_master(|m| m.try_clone())?;
        Ok(PtyReader {
            file,
            wake: self.wake_rx.try_clone()?,
            recorder: self.recorder.clone(),
        })
    }

    /// Write input to the shell.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.with_master(|mut m| {
            m.write_all(data)?;
            Ok(data.len())
        })
    }

    /// Update the terminal window size.
    pub fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        self.with_master(|m| {
            // SAFETY: the descriptor is open for the duration of the closure.
            let rc = unsafe { libc::ioctl(m.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }
            debug!(pid = self.pid, cols, rows, "PTY resized");
            Ok(())
        })
    }

    /// Non-blocking exit check.
    pub fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| io::Error::other("child lock poisoned"))?;
        child.try_wait()
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Terminate the shell and release everything it holds. Only the first
    /// call does any work; returns whether this call performed the teardown.
    pub fn kill(&self) -> bool {
        if self.killed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Ok(Some(auditor)) = self.auditor.lock().map(|mut a| a.take()) {
            auditor.stop();
        }

        match self.child.lock() {
            Ok(mut child) => {
                if let Ok(None) = child.try_wait() {
                    if let Err(e) = killpg(Pid::from_raw(self.pid as i32), Signal::SIGHUP) {
                        debug!(pid = self.pid, error = %e, "SIGHUP to process group failed");
                    }
                    if let Err(e) = child.kill() {
                        warn!(pid = self.pid, error = %e, "failed to kill shell");
                    }
                }
                match child.wait() {
                    Ok(status) => debug!(pid = self.pid, %status, "shell reaped"),
                    Err(e) => warn!(pid = self.pid, error = %e, "failed to reap shell"),
                }
            }
            Err(_) => warn!(pid = self.pid, "child lock poisoned"),
        }

        match self.master.lock() {
            Ok(mut master) => drop(master.take()),
            Err(_) => warn!(pid = self.pid, "master lock poisoned"),
        }
        match self.wake_tx.lock() {
            Ok(mut wake) => drop(wake.take()),
            Err(_) => warn!(pid = self.pid, "wake lock poisoned"),
        }

        if let Err(e) = self.recorder.save() {
            warn!(pid = self.pid, error = %e, "failed to save recording");
        }

        info!(pid = self.pid, "shell terminated");
        true
    }

    fn with_master<T>(&self, f: impl FnOnce(&File) -> io::Result<T>) -> io::Result<T> {
        let master = self
            .master
            .lock()
            .map_err(|_| io::Error::other("master lock poisoned"))?;
        match master.as_ref() {
            Some(m) => f(m),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "pty closed")),
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn stdio_from(fd: &OwnedFd) -> WebshellResult<Stdio> {
    let dup = fd
        .try_clone()
        .map_err(|e| WebshellError::Spawn(format!("dup pty slave: {e}")))?;
    Ok(Stdio::from(dup))
}

/// Reads shell output; every chunk is also appended to the recording.
/// Reports end of stream once the process has been killed.
pub struct PtyReader {
    file: File,
    wake: OwnedFd,
    recorder: RecorderHandle,
}

impl PtyReader {
    /// Block until output is readable. Returns false once the wake pipe closes.
    fn wait_readable(&self) -> io::Result<bool> {
        loop {
            let mut fds = [
                PollFd::new(self.file.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.wake.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
            if fds[1].revents().is_some_and(|r| !r.is_empty()) {
                return Ok(false);
            }
            if fds[0].revents().is_some_and(|r| !r.is_empty()) {
                return Ok(true);
            }
        }
    }
}

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.wait_readable()? {
            return Ok(0);
        }
        let n = self.file.read(buf)?;
        if n > 0 {
            if let Err(e) = self.recorder.write(&buf[..n]) {
                debug!(error = %e, "recorder write failed");
            }
        }
        Ok(n)
    }
}
