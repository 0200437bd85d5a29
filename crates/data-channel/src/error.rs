//! Error types for the data channel.

use std::io;

use relay_protocol::{HashType, Status};
use relay_transfer::TransferError;

/// Errors produced by the upload protocol on either side of a connection.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Path(#[from] TransferError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("hash mismatch: file corrupted during transfer (expected {expected}, got {actual})")]
    DataCorruption { expected: HashType, actual: HashType },

    #[error("timed out waiting for the next message")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    /// The peer answered the upload with a non-OK status.
    #[error("peer rejected upload: {0}")]
    Rejected(Status),
}

impl DataChannelError {
    /// Classifies the error for an RPC caller.
    pub fn status(&self) -> Status {
        match self {
            DataChannelError::Io(e) => io_status(e),
            DataChannelError::Path(e) => e.status(),
            DataChannelError::InvalidRequest(msg) | DataChannelError::Protocol(msg) => {
                Status::invalid_argument(msg.clone())
            }
            DataChannelError::DataCorruption { .. } => {
                Status::data_loss("hash mismatch: file corrupted during transfer")
            }
            DataChannelError::Timeout => Status::deadline_exceeded(self.to_string()),
            DataChannelError::Cancelled => Status::canceled("upload cancelled"),
            DataChannelError::Rejected(status) => status.clone(),
        }
    }
}

/// Maps a filesystem error onto the status a caller can act on.
pub fn io_status(err: &io::Error) -> Status {
    match err.kind() {
        io::ErrorKind::PermissionDenied => Status::permission_denied(err.to_string()),
        io::ErrorKind::NotFound => Status::not_found(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}
