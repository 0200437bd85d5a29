//! Upstream byte sources.
//!
//! A [`SourceFetcher`] opens a URL as a plain `AsyncRead`, with the body
//! capped at a maximum size. Handlers never see HTTP types.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures_util::TryStreamExt;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;
use tracing::debug;

/// An opened source body.
pub struct Source {
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    /// Declared length, when the server sent one.
    pub size_hint: Option<u64>,
}

/// A boxed future returned by [`SourceFetcher::open`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Source, FetchError>> + Send + 'a>>;

/// Errors produced while opening a source.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("file size {declared} exceeds maximum of {max} bytes")]
    TooLarge { declared: u64, max: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Opens a readable byte stream for a URL.
pub trait SourceFetcher: Send + Sync {
    /// Opens `url`. Reading more than `max_size` bytes from the returned
    /// source fails.
    fn open<'a>(&'a self, url: &'a str, max_size: u64) -> FetchFuture<'a>;
}

/// Fetches over HTTP(S) with reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl SourceFetcher for HttpFetcher {
    fn open<'a>(&'a self, url: &'a str, max_size: u64) -> FetchFuture<'a> {
        Box::pin(async move {
            let res = self.client.get(url).send().await?;

            let status = res.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            let size_hint = res.content_length();
            if let Some(declared) = size_hint {
                if declared > max_size {
                    return Err(FetchError::TooLarge {
                        declared,
                        max: max_size,
                    });
                }
            }
            debug!(url, ?size_hint, "source opened");

            let stream = Box::pin(res.bytes_stream().map_err(io::Error::other));
            let reader = SizeLimited::new(StreamReader::new(stream), max_size);
            Ok(Source {
                reader: Box::pin(reader),
                size_hint,
            })
        })
    }
}

/// Reader that fails once more than `max` bytes have been read.
pub struct SizeLimited<R> {
    inner: R,
    read: u64,
    max: u64,
}

impl<R> SizeLimited<R> {
    pub fn new(inner: R, max: u64) -> Self {
        Self { inner, read: 0, max }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SizeLimited<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.read += (buf.filled().len() - before) as u64;
        if this.read > this.max {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("response body exceeds maximum size of {} bytes", this.max),
            )));
        }
        Poll::Ready(Ok(()))
    }
}
