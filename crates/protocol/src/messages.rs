use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{HashType, TransferProtocol};

/// Call metadata key naming the class of the target the request is for.
pub const TARGET_TYPE_KEY: &str = "x-sonic-ss-target-type";

/// Call metadata key naming the target instance.
pub const TARGET_INDEX_KEY: &str = "x-sonic-ss-target-index";

/// Target class value that routes a request to a DPU.
pub const TARGET_TYPE_DPU: &str = "dpu";

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Where and how to fetch a remote file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDownload {
    /// Source URL.
    pub path: String,
    pub protocol: TransferProtocol,
}

/// Fetches a remote file onto the device (or onto a DPU).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferToRemoteRequest {
    pub local_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_download: Option<RemoteDownload>,
}

/// Deletes a file from device storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveRequest {
    pub remote_file: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Digest of the transferred bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferToRemoteResponse {
    pub hash: HashType,
}

// ---------------------------------------------------------------------------
// Call context
// ---------------------------------------------------------------------------

/// Per-call information supplied by the RPC layer.
///
/// Metadata keys are stored lowercase; lookups are case-insensitive on the key.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    metadata: HashMap<String, String>,
    /// Authenticated peer identity (certificate common name), if any.
    pub peer: Option<String>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a metadata entry. The first value for a key wins.
    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata
            .entry(key.to_ascii_lowercase())
            .or_insert_with(|| value.into());
        self
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns the DPU index when the call carries DPU routing metadata.
    ///
    /// Both entries must be present: the target type must name the DPU class
    /// and the index must be non-empty.
    pub fn dpu_target(&self) -> Option<&str> {
        let target_type = self.metadata(TARGET_TYPE_KEY)?;
        let index = self.metadata(TARGET_INDEX_KEY)?;
        if target_type.eq_ignore_ascii_case(TARGET_TYPE_DPU) && !index.is_empty() {
            Some(index)
        } else {
            None
        }
    }
}
