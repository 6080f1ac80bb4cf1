use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("ClamAV error: {0}")]
    ClamAV(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::de::Error),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("Filesystem failure during {op} on {path:?}: {source}")]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Virus database corrupted: {0}")]
    DatabaseCorrupted(String),

    #[error("Virus database restore failed: {0}")]
    RestoreFailed(String),
}

impl Error {
    pub fn filesystem(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Filesystem {
            op,
            path: path.into(),
            source,
        }
    }

    /// Errors that mean the engine could not give an answer at all. These
    /// degrade a scan to `ERROR` and are retryable.
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(
            self,
            Error::ClamAV(_) | Error::Connection(_) | Error::Timeout(_) | Error::Parse(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
