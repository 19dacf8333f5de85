//! webshell-server: browser shell server.
//!
//! Serves PTY-backed shell sessions over WebSocket under `/<token>/shell`,
//! optionally recording them, and can replay a recording under
//! `/<token>/replay`.

mod app;
mod audit;
mod config;
mod replay;
mod server;
mod session;
mod timeout;
mod transport;

use app::AppContext;
use clap::Parser;
use config::{Overrides, ServerConfig};
use server::WebshellServer;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// webshell-server: browser shell server
#[derive(Parser, Debug)]
#[command(name = "webshell-server", version, about = "Browser shell server")]
struct Cli {
    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// URL secret; routes are served under /<token>/
    #[arg(long, env = "TOKEN")]
    token: Option<String>,

    /// Serve without a URL secret
    #[arg(long)]
    no_token: bool,

    /// Working directory for shells
    #[arg(long = "home", env = "HOMEDIR")]
    home_dir: Option<String>,

    /// Shell to run
    #[arg(long)]
    shell: Option<String>,

    /// Run shells as this user
    #[arg(long)]
    user: Option<String>,

    /// Single use: serve one session, then exit
    #[arg(long)]
    once: bool,

    /// Seconds without activity before a once-mode server exits
    #[arg(long)]
    grace: Option<u64>,

    /// Idle seconds before a session is reclaimed
    #[arg(long)]
    session_ttl: Option<u64>,

    /// Enable all auditing
    #[arg(long)]
    audit: bool,

    /// Record sessions to ttyrec files
    #[arg(long)]
    audit_tty: bool,

    /// Log every command executed in a shell
    #[arg(long)]
    audit_exec: bool,

    /// Directory for recordings and the exec audit log
    #[arg(long)]
    audit_path: Option<String>,

    /// Store recordings uncompressed
    #[arg(long)]
    no_compress: bool,

    /// Minimum milliseconds between recording timing samples
    #[arg(long, allow_hyphen_values = true)]
    timing_precision_ms: Option<i64>,

    /// Enable the replay endpoint
    #[arg(long)]
    replay: bool,

    /// Recording served by the replay endpoint
    #[arg(long)]
    replay_file: Option<String>,

    /// Replay speed factor (negative slows down, 0 disables delays)
    #[arg(long, allow_hyphen_values = true)]
    replay_speed: Option<i64>,

    /// Config file path
    #[arg(long, default_value = "~/.webshell/config.toml")]
    config: String,

    /// Debug level logging
    #[arg(long)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            bind: self.bind.clone(),
            port: self.port,
            token: self.token.clone(),
            no_token: self.no_token,
            home_dir: self.home_dir.clone(),
            shell: self.shell.clone(),
            user: self.user.clone(),
            once: self.once,
            grace: self.grace,
            session_ttl: self.session_ttl,
            audit: self.audit,
            audit_tty: self.audit_tty,
            audit_exec: self.audit_exec,
            audit_path: self.audit_path.clone(),
            no_compress: self.no_compress,
            timing_precision_ms: self.timing_precision_ms,
            replay: self.replay,
            replay_file: self.replay_file.clone(),
            replay_speed: self.replay_speed,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr(),
        home = %config.home_dir.display(),
        "starting webshell-server"
    );
    info!(url = %format!("http://{}{}/shell", config.listen_addr(), config.route_prefix()), "shell endpoint");
    if config.once {
        info!("server will exit after the first session ends");
    }

    let shutdown = CancellationToken::new();
    let app = AppContext::new(config, shutdown.clone());
    let server = WebshellServer::new(app.clone());

    let listener = match server.bind().await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    let expiry = app
        .sessions
        .spawn_expiry(app.config.expire_interval, shutdown.clone());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => {
                    info!("received shutdown signal");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    server.run(listener).await;

    for s in app.sessions.list().await {
        debug!(
            session_id = %s.id,
            pid = s.pid,
            idle_secs = s.idle_secs,
            attached = s.attached,
            recording = ?s.recording,
            recorded_bytes = s.recorded_bytes,
            "closing session"
        );
    }
    app.sessions.shutdown_all().await;
    if let Err(e) = expiry.await {
        warn!(error = %e, "expiry task failed");
    }
    info!(connections = app.connections(), "webshell-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
