//! Path policy and streaming digests for the file relay.
//!
//! Every handler that touches the filesystem goes through [`PathPolicy`], and
//! every handler that moves bytes folds them through a [`DigestAccumulator`].

mod digest;
mod validation;

pub use digest::{DigestAccumulator, DigestReader, digest_bytes, file_digest};
pub use validation::{ALLOWED_PREFIXES, DEFAULT_HOST_MOUNT, PathPolicy, normalize};

use relay_protocol::Status;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    InvalidPath(String),
}

impl TransferError {
    /// Classifies the error for an RPC caller.
    pub fn status(&self) -> Status {
        match self {
            TransferError::Io(e) => Status::internal(e.to_string()),
            TransferError::InvalidPath(msg) => Status::invalid_argument(msg.clone()),
        }
    }
}
