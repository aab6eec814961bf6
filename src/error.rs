use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that abort or reject a whole scan session operation.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to read range file {}: {source}", path.display())]
    RangeFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no valid IPv4 ranges found in {}", path.display())]
    NoAddresses { path: PathBuf },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shuffle is only allowed while the scan is paused")]
    NotPaused,

    #[error("probing has finished; there is no remaining work to shuffle")]
    ProbingFinished,

    #[error("scan session is no longer running")]
    SessionClosed,

    #[error("range enumeration task failed: {0}")]
    Enumeration(String),
}

/// Reasons a single validation attempt ends in `Failed`.
///
/// These never escape the validation task; they are logged and folded into
/// the address's terminal state.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("validation tool not found at {}", .0.display())]
    ToolMissing(PathBuf),

    #[error("validation tool at {} is not a regular file", .0.display())]
    ToolNotFile(PathBuf),

    #[error("cannot inspect validation tool at {}: {source}", path.display())]
    ToolUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot make validation tool at {} executable: {source}", path.display())]
    ToolPermissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn validation tool: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("validation tool exited before signalling readiness")]
    EarlyExit,

    #[error("validation tool not ready after {0:?}")]
    ReadyTimeout(Duration),

    #[error("invalid proxy url: {0}")]
    ProxyUrl(String),

    #[error("failed to build proxy client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("proxy test failed over every protocol")]
    ProxyFailed,

    #[error("validation cancelled")]
    Cancelled,
}

pub type Result<T, E = ScanError> = std::result::Result<T, E>;
