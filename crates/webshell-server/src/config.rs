//! Server configuration: TOML file + CLI overrides.

use crate::session::env::DEFAULT_RESTRICTED;
use crate::session::RunAs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;
use webshell_core::ttyrec::{RecorderOptions, DEFAULT_PRECISION_MS, DEFAULT_SPEED};
use webshell_core::{WebshellError, WebshellResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default)]
    pub replay: ReplaySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub no_token: bool,
    #[serde(default)]
    pub once: bool,
    #[serde(default = "default_grace")]
    pub grace: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            token: None,
            no_token: false,
            once: false,
            grace: default_grace(),
        }
    }
}

/// `[session]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub home_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_session_ttl")]
    pub ttl: u64,
    #[serde(default = "default_expire_interval")]
    pub expire_interval: u64,
    #[serde(default = "default_restricted_env")]
    pub restricted_env: Vec<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            home_dir: None,
            user: None,
            ttl: default_session_ttl(),
            expire_interval: default_expire_interval(),
            restricted_env: default_restricted_env(),
        }
    }
}

/// `[audit]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditSection {
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub exec: bool,
    #[serde(default = "default_audit_path")]
    pub path: String,
    #[serde(default = "default_true")]
    pub compress: bool,
    #[serde(default = "default_precision")]
    pub timing_precision_ms: i64,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            tty: false,
            exec: false,
            path: default_audit_path(),
            compress: true,
            timing_precision_ms: default_precision(),
        }
    }
}

/// `[replay]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplaySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_speed")]
    pub speed: i64,
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            enabled: false,
            file: None,
            speed: default_speed(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_grace() -> u64 {
    600
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_session_ttl() -> u64 {
    3600
}
fn default_expire_interval() -> u64 {
    60
}
fn default_restricted_env() -> Vec<String> {
    DEFAULT_RESTRICTED.iter().map(|s| s.to_string()).collect()
}
fn default_audit_path() -> String {
    "/tmp".to_string()
}
fn default_true() -> bool {
    true
}
fn default_precision() -> i64 {
    DEFAULT_PRECISION_MS
}
fn default_speed() -> i64 {
    DEFAULT_SPEED
}

/// Values given on the command line or through the environment. `None` and
/// `false` leave the file value in place.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub token: Option<String>,
    pub no_token: bool,
    pub home_dir: Option<String>,
    pub shell: Option<String>,
    pub user: Option<String>,
    pub once: bool,
    pub grace: Option<u64>,
    pub session_ttl: Option<u64>,
    pub audit: bool,
    pub audit_tty: bool,
    pub audit_exec: bool,
    pub audit_path: Option<String>,
    pub no_compress: bool,
    pub timing_precision_ms: Option<i64>,
    pub replay: bool,
    pub replay_file: Option<String>,
    pub replay_speed: Option<i64>,
}

/// Resolved server configuration (paths expanded, overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// URL secret. `None` serves without one.
    pub token: Option<String>,
    pub home_dir: PathBuf,
    pub shell: String,
    pub run_as: Option<RunAs>,
    pub once: bool,
    pub grace: Duration,
    pub session_ttl: Duration,
    pub expire_interval: Duration,
    pub audit_tty: bool,
    pub audit_exec: bool,
    pub audit_path: PathBuf,
    pub compress: bool,
    pub timing_precision_ms: i64,
    pub replay: bool,
    pub replay_file: Option<PathBuf>,
    pub replay_speed: i64,
    pub restricted_env: Vec<String>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> WebshellResult<Self> {
        let file_config = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| WebshellError::Config(format!("parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with overrides.
    pub fn resolve(file: ConfigFile, o: Overrides) -> WebshellResult<Self> {
        let ConfigFile {
            server,
            session,
            audit,
            replay,
        } = file;

        let token = if o.no_token || server.no_token {
            None
        } else {
            Some(
                o.token
                    .or(server.token)
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(generate_token),
            )
        };

        let run_as = o
            .user
            .or(session.user)
            .filter(|u| !u.is_empty())
            .map(|u| RunAs::lookup(&u))
            .transpose()?;

        let home_dir = match o.home_dir.or(session.home_dir) {
            Some(dir) => expand_tilde_str(&dir),
            None => dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
        };

        let replay_file = o.replay_file.or(replay.file).map(|f| expand_tilde_str(&f));
        let replay_enabled = o.replay || replay.enabled;
        if replay_enabled && replay_file.is_none() {
            return Err(WebshellError::Config("replay enabled without a replay file".into()));
        }

        let expire_interval = session.expire_interval.max(1);

        Ok(Self {
            bind: o.bind.unwrap_or(server.bind),
            port: o.port.unwrap_or(server.port),
            token,
            home_dir,
            shell: o.shell.unwrap_or(session.shell),
            run_as,
            once: o.once || server.once,
            grace: Duration::from_secs(o.grace.unwrap_or(server.grace)),
            session_ttl: Duration::from_secs(o.session_ttl.unwrap_or(session.ttl)),
            expire_interval: Duration::from_secs(expire_interval),
            audit_tty: o.audit || o.audit_tty || audit.tty,
            audit_exec: o.audit || o.audit_exec || audit.exec,
            audit_path: expand_tilde_str(&o.audit_path.unwrap_or(audit.path)),
            compress: !o.no_compress && audit.compress,
            timing_precision_ms: o.timing_precision_ms.unwrap_or(audit.timing_precision_ms),
            replay: replay_enabled,
            replay_file,
            replay_speed: o.replay_speed.unwrap_or(replay.speed),
            restricted_env: session.restricted_env,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Path prefix every route lives under: `/<token>` or empty.
    pub fn route_prefix(&self) -> String {
        self.token
            .as_deref()
            .map(|t| format!("/{t}"))
            .unwrap_or_default()
    }

    pub fn recorder_options(&self) -> RecorderOptions {
        RecorderOptions {
            compress: self.compress,
            precision_ms: self.timing_precision_ms,
        }
    }

    /// Where the recording for a new session goes. Keys sharing a token
    /// prefix still get distinct names thanks to the random suffix.
    pub fn recording_path(&self, session_key: &str) -> PathBuf {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let short = session_key.get(..12).unwrap_or(session_key);
        let nonce = hex::encode(rand::random::<[u8; 4]>());
        self.audit_path
            .join(format!("webshell-{millis}-{short}-{nonce}.ttyrec"))
    }
}

fn generate_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
