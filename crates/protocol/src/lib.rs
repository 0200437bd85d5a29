//! Shared types for the file relay RPC surface.
//!
//! Request/response shapes for `TransferToRemote`, `Put` and `Remove`, the
//! digest descriptors carried on the wire, and the [`Status`] every handler
//! error is classified into.

pub mod messages;
pub mod status;
pub mod types;

pub use messages::{
    CallContext, RemoteDownload, RemoveRequest, TARGET_INDEX_KEY, TARGET_TYPE_DPU,
    TARGET_TYPE_KEY, TransferToRemoteRequest, TransferToRemoteResponse,
};
pub use status::{Code, Status};
pub use types::{DEFAULT_PERMISSIONS, HashMethod, HashType, TransferProtocol};
