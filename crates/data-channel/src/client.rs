//! Upload client (proxy side).
//!
//! A [`DpuChannel`] is a cheap, cloneable handle to one peer address. It keeps
//! streams that finished an upload cleanly and hands them out again, so
//! back-to-back transfers to the same peer skip the TCP handshake.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::TCP_BUFFER_SIZE;
use crate::error::DataChannelError;
use crate::wire::{PutRequest, read_response, write_content, write_request};

/// How long to wait for the receiver's status after a write to it fails.
const VERDICT_GRACE: Duration = Duration::from_secs(2);

/// Cloneable connection handle to one upload server.
#[derive(Clone)]
pub struct DpuChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    addr: SocketAddr,
    connect_timeout: Duration,
    idle: Mutex<Vec<TcpStream>>,
}

impl std::fmt::Debug for DpuChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpuChannel")
            .field("addr", &self.inner.addr)
            .field("idle", &self.idle_streams())
            .finish()
    }
}

impl DpuChannel {
    /// Connects to `addr` and keeps the stream for the first upload.
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<Self, DataChannelError> {
        let channel = Self::lazy(addr, connect_timeout);
        let stream = channel.dial().await?;
        channel.release(stream);
        Ok(channel)
    }

    /// Creates a handle without connecting; the first upload dials.
    pub fn lazy(addr: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                addr,
                connect_timeout,
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Number of streams waiting for reuse.
    pub fn idle_streams(&self) -> usize {
        self.inner
            .idle
            .lock()
            .map(|idle| idle.len())
            .unwrap_or_default()
    }

    /// Starts an upload on a pooled stream, or on a fresh one.
    pub async fn open_put(&self) -> Result<PutClient, DataChannelError> {
        let stream = match self.take_idle() {
            Some(stream) => stream,
            None => self.dial().await?,
        };
        Ok(PutClient {
            channel: self.clone(),
            writer: BufWriter::with_capacity(TCP_BUFFER_SIZE, stream),
        })
    }

    async fn dial(&self) -> Result<TcpStream, DataChannelError> {
        let addr = self.inner.addr;
        match tokio::time::timeout(self.inner.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                info!(%addr, "upload channel connected");
                Ok(stream)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DataChannelError::Timeout),
        }
    }

    fn take_idle(&self) -> Option<TcpStream> {
        let mut idle = self.inner.idle.lock().ok()?;
        while let Some(stream) = idle.pop() {
            if is_reusable(&stream) {
                return Some(stream);
            }
            debug!(addr = %self.inner.addr, "dropping closed idle stream");
        }
        None
    }

    fn release(&self, stream: TcpStream) {
        if let Ok(mut idle) = self.inner.idle.lock() {
            idle.push(stream);
        }
    }
}

/// An idle stream is reusable only while the peer has neither closed it nor
/// sent anything unsolicited.
fn is_reusable(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.try_read(&mut probe) {
        Err(e) => e.kind() == std::io::ErrorKind::WouldBlock,
        Ok(_) => false,
    }
}

/// One upload in progress.
///
/// Dropping a client without [`close_and_recv`](Self::close_and_recv)
/// abandons the stream; the receiver discards the partial upload.
pub struct PutClient {
    channel: DpuChannel,
    writer: BufWriter<TcpStream>,
}

impl PutClient {
    /// Sends one frame.
    ///
    /// Fails with [`DataChannelError::Rejected`] once the receiver has given
    /// up on the upload.
    pub async fn send(&mut self, request: &PutRequest) -> Result<(), DataChannelError> {
        self.check_early_verdict().await?;
        match write_request(&mut self.writer, request).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.verdict_after(e).await),
        }
    }

    /// Sends a CONTENT frame without copying `chunk`.
    pub async fn send_content(&mut self, chunk: &[u8]) -> Result<(), DataChannelError> {
        self.check_early_verdict().await?;
        match write_content(&mut self.writer, chunk).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.verdict_after(e).await),
        }
    }

    /// Flushes pending frames and waits for the receiver's verdict.
    ///
    /// A non-OK verdict is returned as [`DataChannelError::Rejected`]. The
    /// stream goes back to the channel's pool only after an OK.
    pub async fn close_and_recv(mut self) -> Result<(), DataChannelError> {
        if let Err(e) = self.writer.flush().await {
            return Err(self.verdict_after(e.into()).await);
        }
        let mut stream = self.writer.into_inner();
        match read_response(&mut stream).await? {
            Ok(()) => {
                self.channel.release(stream);
                Ok(())
            }
            Err(status) => Err(DataChannelError::Rejected(status)),
        }
    }

    /// The receiver only speaks before HASH when it rejects the upload, so
    /// any readable byte here starts a failure status.
    async fn check_early_verdict(&mut self) -> Result<(), DataChannelError> {
        let mut head = [0u8; 64];
        let n = match self.writer.get_ref().try_read(&mut head) {
            Ok(0) => {
                return Err(DataChannelError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the upload stream",
                )));
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = (&head[..n]).chain(self.writer.get_mut());
        match read_response(&mut reader).await? {
            Ok(()) => Err(DataChannelError::Protocol(
                "receiver acknowledged before the hash was sent".into(),
            )),
            Err(status) => Err(DataChannelError::Rejected(status)),
        }
    }

    /// After a failed write, prefers the receiver's status over the I/O
    /// error when one arrives within [`VERDICT_GRACE`].
    async fn verdict_after(&mut self, err: DataChannelError) -> DataChannelError {
        if !matches!(err, DataChannelError::Io(_)) {
            return err;
        }
        let stream = self.writer.get_mut();
        match tokio::time::timeout(VERDICT_GRACE, read_response(stream)).await {
            Ok(Ok(Err(status))) => {
                debug!(addr = %self.channel.addr(), code = %status.code, "upload rejected mid-stream");
                DataChannelError::Rejected(status)
            }
            _ => err,
        }
    }
}
