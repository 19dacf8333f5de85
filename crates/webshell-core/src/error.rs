use thiserror::Error;

/// Errors produced by the webshell core and server.
#[derive(Debug, Error)]
pub enum WebshellError {
    #[error("invalid recording, bad header magic {0:#010x}")]
    InvalidMagic(u32),

    #[error("unsupported recording version {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported compression flag {0}")]
    UnsupportedCompression(u8),

    #[error("corrupt timing index: {0}")]
    CorruptTimings(String),

    #[error("corrupt audit stream: {0}")]
    CorruptAudit(String),

    #[error("invalid frame {index} (recording has {count} frames)")]
    InvalidFrame { index: usize, count: usize },

    #[error("recorder is closed")]
    RecorderClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to start process: {0}")]
    Spawn(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type WebshellResult<T> = Result<T, WebshellError>;
