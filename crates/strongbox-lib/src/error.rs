use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the backup engine and its on-disk formats.
#[derive(Debug, Error)]
pub enum BackupError {
    /// A path or uid could not be resolved.
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("IO error at {path:?}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The persisted index was written by an incompatible version.
    #[error("Index version mismatch: expected {expected}, found {found}")]
    SerializationVersionMismatch { expected: u8, found: u8 },
    #[error("Malformed record: {0}")]
    Format(String),
    /// A zip archive could not be read or written.
    #[error("Archive error at {path:?}: {message}")]
    Archive { path: PathBuf, message: String },
    #[error("Failed to launch child process: {0}")]
    ProcessLaunch(String),
    /// A launcher protocol record could not be parsed. Callers drop the record.
    #[error("Malformed protocol record: {0}")]
    ProtocolParse(String),
}

impl BackupError {
    /// Wraps an I/O error with the path it happened on.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }

    pub fn archive(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Archive {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
