use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by a monitor tick or by reconfiguration.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Character name cannot be empty")]
    EmptyCharacterName,

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

impl MonitorError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Transient errors are retried on the next tick after the error backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Failures reported by a [`crate::sink::RepairSink`].
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown session: {0}")]
    UnknownSession(uuid::Uuid),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level error for running the monitor as a process.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}
