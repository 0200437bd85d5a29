//! File service handlers for the relay agent.
//!
//! - `TransferToRemote` downloads a remote file onto this device, or relays
//!   it straight onto a DPU when the call carries DPU routing metadata.
//! - `Put` receives a chunked upload and commits it atomically.
//! - `Remove` deletes a file inside the allow-listed directories.
//!
//! Every path a caller names goes through [`relay_transfer::PathPolicy`]
//! before any I/O happens.

mod error;
mod fetch;
mod local;
mod remove;
mod service;
mod streaming;

use std::path::PathBuf;

use relay_protocol::HashType;

pub use error::FileError;
pub use fetch::{FetchError, FetchFuture, HttpFetcher, SizeLimited, Source, SourceFetcher};
pub use service::{
    AccessFuture, AccessGate, AllowAll, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE,
    DEFAULT_TRANSFER_TIMEOUT, FileService, TransferLimits,
};

/// Where a transferred file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Written on this device at the given (translated) path.
    Stored(PathBuf),
    /// Relayed to a DPU, which committed it under the requested path.
    Forwarded { dpu: String },
}

/// Result of a successful `TransferToRemote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub digest: HashType,
    pub bytes: u64,
    pub outcome: TransferOutcome,
}
