//! Error type for the file service.

use std::io;

use relay_data_channel::DataChannelError;
use relay_data_channel::error::io_status;
use relay_dpu_proxy::ProxyError;
use relay_protocol::Status;
use relay_transfer::TransferError;

use crate::fetch::FetchError;

/// Errors returned by the file service handlers.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Unimplemented(String),

    #[error("{0}")]
    PermissionDenied(String),

    /// Rejected by the access gate.
    #[error("access denied: {0}")]
    AccessDenied(Status),

    #[error("invalid path: {0}")]
    Path(#[from] TransferError),

    #[error("download failed: {0}")]
    Download(#[source] FetchError),

    #[error("hash calculation failed: {0}")]
    Digest(#[source] io::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to create HTTP stream: {0}")]
    SourceOpen(#[source] FetchError),

    #[error("failed to get DPU connection: {0}")]
    Connection(#[source] ProxyError),

    #[error("failed to create Put client: {0}")]
    UploadOpen(#[source] DataChannelError),

    #[error("failed to send {what}: {source}")]
    Send {
        what: &'static str,
        #[source]
        source: DataChannelError,
    },

    #[error("failed to read from HTTP stream: {0}")]
    SourceRead(#[source] io::Error),

    #[error("{0} timed out")]
    DeadlineExceeded(&'static str),

    #[error("failed to complete Put to DPU: {0}")]
    Ack(#[source] DataChannelError),

    #[error("DPU rejected upload: {0}")]
    PeerRejected(Status),

    /// A local upload failed inside the receiver.
    #[error(transparent)]
    Receive(#[from] DataChannelError),
}

impl FileError {
    /// Classifies the error for an RPC caller.
    pub fn status(&self) -> Status {
        let msg = self.to_string();
        match self {
            FileError::InvalidArgument(_) | FileError::Path(_) => Status::invalid_argument(msg),
            FileError::Unimplemented(_) => Status::unimplemented(msg),
            FileError::PermissionDenied(_) => Status::permission_denied(msg),
            FileError::AccessDenied(status) | FileError::PeerRejected(status) => status.clone(),
            FileError::Io { source, .. } => Status::new(io_status(source).code, msg),
            FileError::Connection(e) => Status::new(e.status().code, msg),
            FileError::DeadlineExceeded(_) => Status::deadline_exceeded(msg),
            FileError::Receive(e) => e.status(),
            FileError::Download(_)
            | FileError::Digest(_)
            | FileError::SourceOpen(_)
            | FileError::UploadOpen(_)
            | FileError::Send { .. }
            | FileError::SourceRead(_)
            | FileError::Ack(_) => Status::internal(msg),
        }
    }
}

impl From<FileError> for Status {
    fn from(err: FileError) -> Self {
        err.status()
    }
}
