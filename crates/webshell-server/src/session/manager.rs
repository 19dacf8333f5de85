//! Session registry.
//!
//! Maps session keys to running sessions. Creation is single-flight: the
//! registry lock is held across lookup, process spawn and insert, so two
//! concurrent misses for one key never start two shells.

use super::pty::PtyProcess;
use super::session::{Session, SessionInfo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webshell_core::WebshellResult;

type Registry = Arc<Mutex<HashMap<String, Arc<Session>>>>;

/// Tracks all live sessions.
pub struct SessionManager {
    sessions: Registry,
    ttl: Duration,
}

impl SessionManager {
    /// `ttl` is the idle time after which `expire_sessions` closes a session.
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Return the session registered under `key`, or start one with `factory`.
    ///
    /// `factory` runs at most once per key while a session for it is live.
    /// Its error is returned as is and nothing is registered.
    pub async fn get_session<F>(&self, key: &str, factory: F) -> WebshellResult<Arc<Session>>
    where
        F: FnOnce() -> WebshellResult<PtyProcess>,
    {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(key) {
            if !existing.is_closed() {
                existing.touch();
                return Ok(existing.clone());
            }
        }

        let process = factory()?;
        let session = Session::new(key, process)?;
        sessions.insert(key.to_string(), session.clone());
        info!(session_id = %key, pid = session.pid(), total = sessions.len(), "session created");

        let registry = self.sessions.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            watched.done().cancelled().await;
            let mut sessions = registry.lock().await;
            if sessions
                .get(watched.id())
                .is_some_and(|s| Arc::ptr_eq(s, &watched))
            {
                sessions.remove(watched.id());
                debug!(session_id = %watched.id(), "session deregistered");
            }
        });

        Ok(session)
    }

    /// Close every session idle for longer than the TTL. Returns their keys.
    pub async fn expire_sessions(&self) -> Vec<String> {
        let expired: Vec<Arc<Session>> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|s| s.idle_for() > self.ttl)
                .cloned()
                .collect()
        };

        for session in &expired {
            info!(session_id = %session.id(), idle_secs = session.idle_for().as_secs(), "expiring idle session");
            session.close();
        }
        expired.iter().map(|s| s.id().to_string()).collect()
    }

    /// Run `expire_sessions` every `interval` until `shutdown` fires.
    pub fn spawn_expiry(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = manager.expire_sessions().await;
                        if !expired.is_empty() {
                            debug!(count = expired.len(), "expired sessions");
                        }
                    }
                }
            }
        })
    }

    /// Close every session and empty the registry. Returns once every shell
    /// is reaped and its recording saved.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        info!(count = sessions.len(), "closing all sessions");
        for session in &sessions {
            session.close();
        }
        for session in &sessions {
            session.wait_closed().await;
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(key).cloned()
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}
