use std::io;
use tokio_rusqlite::rusqlite;

use super::models::FailureKind;

/// Errors raised while running an archive operation.
///
/// They never escape `ZipBackupJob::run`; the job turns them into a single
/// failure callback.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid backup archive: {0}")]
    Format(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Operation was aborted")]
    Cancelled,
}

impl BackupError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Io { .. } | Self::Database(_) => FailureKind::Io,
            Self::Format(_) => FailureKind::Format,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }
}

impl From<zip::result::ZipError> for BackupError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => Self::io("Archive I/O failed", e),
            other => Self::Format(other.to_string()),
        }
    }
}

/// `map_err` helper attaching a context string to an I/O error.
pub fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> BackupError {
    let context = context.into();
    move |source| BackupError::io(context, source)
}
