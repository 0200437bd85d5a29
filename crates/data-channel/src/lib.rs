//! Chunked upload protocol over TCP.
//!
//! A client opens an upload, streams the file content in chunks and closes
//! with the expected digest; the receiving side writes to a temp file, checks
//! the digest and renames the file into place only when it matches.
//!
//! # Wire format
//!
//! See [`wire`] module for the binary protocol specification.

pub mod client;
pub mod error;
pub mod receiver;
pub mod server;
pub mod wire;

pub use client::{DpuChannel, PutClient};
pub use error::DataChannelError;
pub use receiver::{PutReceiver, PutSummary, RequestSource};
pub use server::PutServer;
pub use wire::{FrameReader, PutOpen, PutRequest};

use std::time::Duration;

/// TCP read/write buffer size (256 KB).
pub const TCP_BUFFER_SIZE: usize = 256 * 1024;

/// Largest payload a single frame may carry (4 MB).
pub const MAX_FRAME_PAYLOAD: usize = 4 * 1024 * 1024;

/// Default timeout for establishing a TCP connection to a peer.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a receiver waits for the next message of an upload in progress.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a server keeps a connection with no upload in progress.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
