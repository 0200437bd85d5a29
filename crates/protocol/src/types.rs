use std::fmt;

use serde::{Deserialize, Serialize};

/// Permission bits applied to a received file when the sender gives none.
pub const DEFAULT_PERMISSIONS: u32 = 0o644;

/// Transport used to fetch a remote file.
///
/// Only [`TransferProtocol::Http`] is served; the other tags exist so a request
/// naming them can be rejected as unimplemented instead of malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferProtocol {
    #[default]
    Unknown,
    Sftp,
    Http,
    Https,
    Scp,
}

impl fmt::Display for TransferProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferProtocol::Unknown => "UNKNOWN",
            TransferProtocol::Sftp => "SFTP",
            TransferProtocol::Http => "HTTP",
            TransferProtocol::Https => "HTTPS",
            TransferProtocol::Scp => "SCP",
        };
        f.write_str(name)
    }
}

/// Digest algorithm used to fingerprint transferred bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMethod {
    #[default]
    Md5,
    Sha256,
}

impl HashMethod {
    /// Wire value of this method.
    pub fn as_u8(self) -> u8 {
        match self {
            HashMethod::Md5 => 1,
            HashMethod::Sha256 => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(HashMethod::Md5),
            2 => Some(HashMethod::Sha256),
            _ => None,
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            HashMethod::Md5 => 16,
            HashMethod::Sha256 => 32,
        }
    }
}

impl fmt::Display for HashMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashMethod::Md5 => f.write_str("MD5"),
            HashMethod::Sha256 => f.write_str("SHA256"),
        }
    }
}

/// A computed digest together with the method that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashType {
    pub method: HashMethod,
    pub hash: Vec<u8>,
}

impl HashType {
    pub fn new(method: HashMethod, hash: Vec<u8>) -> Self {
        Self { method, hash }
    }

    /// Lowercase hex rendering of the digest bytes.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.hash)
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.method, self.to_hex())
    }
}
