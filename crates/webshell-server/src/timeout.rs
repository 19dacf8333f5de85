//! Inactivity monitor for once mode.
//!
//! Connections ping on every inbound and outbound frame. If nothing pings
//! within the grace window the shutdown token is cancelled. Outside once mode
//! the monitor is a no-op.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How often the monitor checks for inactivity. Twice the client ping period.
pub const TICK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Default)]
pub enum Activity {
    #[default]
    Noop,
    Inactivity(Arc<Mutex<Instant>>),
}

impl Activity {
    /// Start a monitor that cancels `shutdown` after `grace` without pings.
    pub fn start(grace: Duration, shutdown: CancellationToken) -> Self {
        Self::start_with_tick(grace, TICK_INTERVAL, shutdown)
    }

    pub fn start_with_tick(grace: Duration, tick: Duration, shutdown: CancellationToken) -> Self {
        let last = Arc::new(Mutex::new(Instant::now()));
        let watched = last.clone();

        tokio::spawn(async move {
            info!(grace_secs = grace.as_secs(), "inactivity monitor active");
            let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let idle = watched.lock().map(|t| t.elapsed()).unwrap_or_default();
                        if idle >= grace {
                            info!(idle_secs = idle.as_secs(), "stopping server due to inactivity");
                            shutdown.cancel();
                            return;
                        }
                    }
                }
            }
        });

        Activity::Inactivity(last)
    }

    /// Record activity.
    pub fn ping(&self) {
        if let Activity::Inactivity(last) = self {
            if let Ok(mut t) = last.lock() {
                *t = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_grace_without_pings() {
        let shutdown = CancellationToken::new();
        let activity = Activity::start(Duration::from_secs(30), shutdown.clone());
        assert!(matches!(activity, Activity::Inactivity(_)));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!shutdown.is_cancelled());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn pings_keep_server_alive() {
        let shutdown = CancellationToken::new();
        let activity = Activity::start(Duration::from_secs(30), shutdown.clone());

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(15)).await;
            activity.ping();
        }
        assert!(!shutdown.is_cancelled());

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn noop_never_fires() {
        let activity = Activity::default();
        activity.ping();
        assert!(matches!(activity, Activity::Noop));
    }
}
