//! TCP wire format for chunked uploads.
//!
//! # Wire format
//!
//! ```text
//! REQUEST FRAME (client -> receiver):
//!   [1 byte: tag]
//!   [4 bytes BE: payload_len]
//!   [payload_len bytes: payload]
//!
//!   OPEN    (0x01): [2 bytes BE: path_len][path UTF-8][4 bytes BE: permissions][1 byte: hash method]
//!   CONTENT (0x02): raw file bytes
//!   HASH    (0x03): [1 byte: hash method][digest bytes]
//!
//! RESPONSE (receiver -> client, once per upload):
//!   [1 byte: status code][2 bytes BE: msg_len][msg_len bytes: message UTF-8]
//! ```
//!
//! An upload is exactly one OPEN, any number of CONTENT frames and one HASH.
//! Several uploads may follow each other on one connection.

use relay_protocol::{Code, HashMethod, HashType, Status};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_FRAME_PAYLOAD;
use crate::error::DataChannelError;

pub const TAG_OPEN: u8 = 0x01;
pub const TAG_CONTENT: u8 = 0x02;
pub const TAG_HASH: u8 = 0x03;

/// First message of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOpen {
    /// Destination path on the receiving device.
    pub remote_file: String,
    /// Unix permission bits; zero means the receiver's default.
    pub permissions: u32,
    /// Digest method the closing HASH frame will use.
    pub method: HashMethod,
}

/// One message of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutRequest {
    Open(PutOpen),
    Content(Vec<u8>),
    Hash(HashType),
}

/// Writes a complete request frame.
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &PutRequest,
) -> Result<(), DataChannelError> {
    match request {
        PutRequest::Open(open) => {
            let path = open.remote_file.as_bytes();
            if path.len() > u16::MAX as usize {
                return Err(DataChannelError::Protocol(format!(
                    "path too long: {} bytes (max {})",
                    path.len(),
                    u16::MAX
                )));
            }
            let mut payload = Vec::with_capacity(2 + path.len() + 5);
            payload.extend_from_slice(&(path.len() as u16).to_be_bytes());
            payload.extend_from_slice(path);
            payload.extend_from_slice(&open.permissions.to_be_bytes());
            payload.push(open.method.as_u8());
            write_frame(writer, TAG_OPEN, &payload).await
        }
        PutRequest::Content(data) => write_content(writer, data).await,
        PutRequest::Hash(hash) => {
            let mut payload = Vec::with_capacity(1 + hash.hash.len());
            payload.push(hash.method.as_u8());
            payload.extend_from_slice(&hash.hash);
            write_frame(writer, TAG_HASH, &payload).await
        }
    }
}

/// Writes a CONTENT frame straight from a borrowed chunk.
pub async fn write_content<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), DataChannelError> {
    write_frame(writer, TAG_CONTENT, data).await
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    tag: u8,
    payload: &[u8],
) -> Result<(), DataChannelError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(DataChannelError::Protocol(format!(
            "frame payload too large: {} bytes (max {MAX_FRAME_PAYLOAD})",
            payload.len()
        )));
    }
    writer.write_u8(tag).await?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Reads the next request frame.
///
/// Returns `None` when the stream ends cleanly before a new frame starts.
/// End of stream inside a frame is an I/O error.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<PutRequest>, DataChannelError> {
    let mut tag = [0u8; 1];
    if reader.read(&mut tag).await? == 0 {
        return Ok(None);
    }

    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(DataChannelError::Protocol(format!(
            "frame payload too large: {len} bytes (max {MAX_FRAME_PAYLOAD})"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let request = match tag[0] {
        TAG_OPEN => PutRequest::Open(decode_open(&payload)?),
        TAG_CONTENT => PutRequest::Content(payload),
        TAG_HASH => {
            let (&method, digest) = payload
                .split_first()
                .ok_or_else(|| DataChannelError::Protocol("empty HASH frame".into()))?;
            PutRequest::Hash(HashType::new(decode_method(method)?, digest.to_vec()))
        }
        other => {
            return Err(DataChannelError::Protocol(format!(
                "unknown frame tag: 0x{other:02x}"
            )));
        }
    };
    Ok(Some(request))
}

fn decode_open(payload: &[u8]) -> Result<PutOpen, DataChannelError> {
    let truncated = || DataChannelError::Protocol("truncated OPEN frame".into());

    let (len_bytes, rest) = payload.split_first_chunk::<2>().ok_or_else(truncated)?;
    let path_len = u16::from_be_bytes(*len_bytes) as usize;
    if rest.len() != path_len + 5 {
        return Err(truncated());
    }
    let (path, rest) = rest.split_at(path_len);
    let remote_file = String::from_utf8(path.to_vec())
        .map_err(|e| DataChannelError::Protocol(format!("invalid UTF-8 path: {e}")))?;
    let (perm_bytes, rest) = rest.split_first_chunk::<4>().ok_or_else(truncated)?;

    Ok(PutOpen {
        remote_file,
        permissions: u32::from_be_bytes(*perm_bytes),
        method: decode_method(rest[0])?,
    })
}

fn decode_method(value: u8) -> Result<HashMethod, DataChannelError> {
    HashMethod::from_u8(value)
        .ok_or_else(|| DataChannelError::Protocol(format!("unknown hash method: {value}")))
}

/// Writes the single response that closes an upload, and flushes.
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    outcome: &Result<(), Status>,
) -> Result<(), DataChannelError> {
    let (code, message) = match outcome {
        Ok(()) => (Code::Ok, ""),
        Err(status) => (status.code, status.message.as_str()),
    };
    let message = truncate_utf8(message, u16::MAX as usize);

    writer.write_u8(code.as_u8()).await?;
    writer.write_u16(message.len() as u16).await?;
    writer.write_all(message.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the response to an upload.
///
/// The outer error is a transport failure; the inner one is the receiver's
/// verdict.
pub async fn read_response<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Result<(), Status>, DataChannelError> {
    let raw = reader.read_u8().await?;
    let code = Code::from_u8(raw)
        .ok_or_else(|| DataChannelError::Protocol(format!("unknown status code: {raw}")))?;
    let len = reader.read_u16().await? as usize;
    let mut msg = vec![0u8; len];
    reader.read_exact(&mut msg).await?;
    let message = String::from_utf8_lossy(&msg).into_owned();

    Ok(match code {
        Code::Ok => Ok(()),
        code => Err(Status::new(code, message)),
    })
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// Frame reader
// ---------------------------------------------------------------------------

/// Pull-style source of request frames over a byte stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub async fn next_frame(&mut self) -> Result<Option<PutRequest>, DataChannelError> {
        read_request(&mut self.inner).await
    }
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    /// Waits until more bytes arrive. `false` means the peer closed the stream.
    pub async fn has_more(&mut self) -> Result<bool, DataChannelError> {
        Ok(!self.inner.fill_buf().await?.is_empty())
    }
}
