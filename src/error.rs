use std::collections::TryReserveError;

use thiserror::Error;

use crate::io::SeekOrigin;

pub type Result<T> = std::result::Result<T, IoError>;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("Failed to open {path} in mode {mode}: {source}")]
    OpenFailed {
        path: String,
        mode: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read from {path}: {detail}")]
    ReadFailed { path: String, detail: String },
    #[error("Failed to write to {path}: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to seek {path} to {offset} from {origin:?}")]
    SeekFailed {
        path: String,
        offset: i64,
        origin: SeekOrigin,
    },
    #[error("Unable to allocate {requested} bytes")]
    AllocationFailed {
        requested: usize,
        #[source]
        source: TryReserveError,
    },
    #[error("Failed to transfer data into {path}: {detail}")]
    TransferFailed { path: String, detail: String },
    #[error("Remote request to {url} failed{}: {detail}", .status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    RemoteRequestFailed {
        url: String,
        status: Option<u16>,
        detail: String,
    },
    #[error("Range request to {url} returned no data, check the permissions")]
    RemoteDataEmpty { url: String },
    /// A range reply that does not cover the requested blocks, or a read
    /// over blocks that were never fetched.
    #[error("Incomplete remote data: {0}")]
    IncompleteData(String),
    #[error("{operation} is not supported by {path}")]
    UnsupportedOperation {
        operation: &'static str,
        path: String,
    },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IoError {
    /// Errors that abort the current high-level operation instead of
    /// leaving the decision to the immediate caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IoError::AllocationFailed { .. }
                | IoError::TransferFailed { .. }
                | IoError::RemoteDataEmpty { .. }
                | IoError::IncompleteData(_)
        )
    }

    pub(crate) fn read_failed(path: impl Into<String>, detail: impl Into<String>) -> Self {
        IoError::ReadFailed {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn transfer_failed(path: impl Into<String>, detail: impl Into<String>) -> Self {
        IoError::TransferFailed {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn unsupported(operation: &'static str, path: impl Into<String>) -> Self {
        IoError::UnsupportedOperation {
            operation,
            path: path.into(),
        }
    }
}
