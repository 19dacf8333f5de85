//! Process-wide state, built once in `main` and shared as `Arc<AppContext>`.

use crate::audit::{self, AuditSink};
use crate::config::ServerConfig;
use crate::session::env::{current_env, filter_env};
use crate::session::{PtyProcess, SessionManager, SpawnOptions};
use crate::timeout::Activity;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use webshell_core::ttyrec::{Recorder, RecorderHandle};
use webshell_core::WebshellResult;

/// In once mode, remembers the single session key that may be served.
#[derive(Debug, Default)]
pub struct OnceGate {
    enabled: bool,
    key: Mutex<Option<String>>,
}

impl OnceGate {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            key: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `key` may be served. The first key admitted locks the gate.
    pub fn admit(&self, key: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let Ok(mut slot) = self.key.lock() else {
            return false;
        };
        match slot.as_deref() {
            None => {
                *slot = Some(key.to_string());
                true
            }
            Some(admitted) => admitted == key,
        }
    }
}

pub struct AppContext {
    pub config: ServerConfig,
    pub sessions: Arc<SessionManager>,
    pub shutdown: CancellationToken,
    pub activity: Activity,
    pub once: OnceGate,
    connections: AtomicUsize,
    exec_sink: Option<AuditSink>,
}

impl AppContext {
    /// Must be called inside a tokio runtime when once mode is on.
    pub fn new(config: ServerConfig, shutdown: CancellationToken) -> Arc<Self> {
        let activity = if config.once {
            Activity::start(config.grace, shutdown.clone())
        } else {
            Activity::Noop
        };

        let exec_sink = config.audit_exec.then(|| {
            audit::file_sink(&config.audit_path).unwrap_or_else(|e| {
                warn!(path = %config.audit_path.display(), error = %e, "cannot open exec audit log, logging instead");
                audit::tracing_sink()
            })
        });

        Arc::new(Self {
            sessions: Arc::new(SessionManager::new(config.session_ttl)),
            once: OnceGate::new(config.once),
            connections: AtomicUsize::new(0),
            shutdown,
            activity,
            exec_sink,
            config,
        })
    }

    /// Count a live connection until the guard is dropped.
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        let live = self.connections.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(live, "connection opened");
        ConnectionGuard { app: self.clone() }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Start the shell for a new session under `key`.
    pub fn spawn_shell(&self, key: &str) -> WebshellResult<PtyProcess> {
        let cfg = &self.config;

        let recorder = if cfg.audit_tty {
            let path = cfg.recording_path(key);
            let recorder = Recorder::create(&path, cfg.recorder_options())?;
            info!(path = %path.display(), "recording session");
            RecorderHandle::new(recorder)
        } else {
            RecorderHandle::Disabled
        };

        if let Some(user) = &cfg.run_as {
            info!(shell = %cfg.shell, user = %user.name, "running shell as user");
        }

        let mut options = SpawnOptions::new(cfg.shell.clone());
        options.cwd = cfg.home_dir.clone();
        options.env = filter_env(current_env(), &cfg.restricted_env);
        options.run_as = cfg.run_as.clone();
        options.recorder = recorder.clone();
        options.audit = self.exec_sink.clone();

        PtyProcess::spawn(options).inspect_err(|_| {
            // Finalize the empty recording so it is still a valid file.
            let _ = recorder.save();
        })
    }
}

/// Decrements the live connection count on drop.
pub struct ConnectionGuard {
    app: Arc<AppContext>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.app.connections.fetch_sub(1, Ordering::AcqRel);
    }
}
