//! Upload server (DPU side).
//!
//! Accepts connections from proxies and runs a [`PutReceiver`] for each
//! upload. Uploads on one connection are handled one after another; separate
//! connections run concurrently.

use std::time::Duration;

use relay_transfer::PathPolicy;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DataChannelError;
use crate::receiver::PutReceiver;
use crate::wire::{FrameReader, write_response};
use crate::{FRAME_TIMEOUT, IDLE_TIMEOUT, TCP_BUFFER_SIZE};

/// How long a rejected connection is drained before it is dropped.
const REJECT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP server for receiving uploads.
#[derive(Debug, Clone)]
pub struct PutServer {
    receiver: PutReceiver,
    cancel: CancellationToken,
    idle_timeout: Duration,
}

impl PutServer {
    pub fn new(policy: PathPolicy, cancel: CancellationToken) -> Self {
        Self {
            receiver: PutReceiver::new(policy)
                .with_frame_timeout(FRAME_TIMEOUT)
                .with_cancel(cancel.clone()),
            cancel,
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    /// Sets how long a connection may sit between uploads before it is closed.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.receiver = self.receiver.with_frame_timeout(timeout);
        self
    }

    pub async fn bind(&self, addr: impl ToSocketAddrs) -> Result<TcpListener, DataChannelError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "upload server listening");
        Ok(listener)
    }

    /// Accepts connections until the cancellation token fires.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), DataChannelError> {
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("upload server stopping");
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            debug!(%peer, "upload connection accepted");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream).await {
                    debug!(%peer, error = %e, "upload connection ended with error");
                }
            });
        }
    }

    async fn serve_connection(&self, stream: TcpStream) -> Result<(), DataChannelError> {
        let (reader, mut writer) = stream.into_split();
        let mut frames = FrameReader::new(BufReader::with_capacity(TCP_BUFFER_SIZE, reader));

        loop {
            let more = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                result = tokio::time::timeout(self.idle_timeout, frames.has_more()) => {
                    match result {
                        Ok(r) => r?,
                        Err(_) => {
                            debug!("closing idle upload connection");
                            return Ok(());
                        }
                    }
                }
            };
            if !more {
                return Ok(());
            }

            match self.receiver.receive(&mut frames).await {
                Ok(_) => write_response(&mut writer, &Ok(())).await?,
                Err(e) => {
                    let status = e.status();
                    warn!(code = %status.code, error = %e, "upload failed");
                    // The stream position is unknown after a failure, so the
                    // connection is not reused.
                    if write_response(&mut writer, &Err(status)).await.is_ok() {
                        let _ = writer.shutdown().await;
                        drain(frames.into_inner()).await;
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Reads and discards whatever the peer still sends, until it closes or
/// [`REJECT_DRAIN_TIMEOUT`] passes.
///
/// Closing with unread bytes would reset the connection, and a reset can
/// destroy the status frame before the peer reads it.
async fn drain<R: AsyncRead + Unpin>(mut reader: R) {
    let mut sink = tokio::io::sink();
    let discard = tokio::io::copy(&mut reader, &mut sink);
    match tokio::time::timeout(REJECT_DRAIN_TIMEOUT, discard).await {
        Ok(Ok(bytes)) => debug!(bytes, "drained rejected upload"),
        Ok(Err(e)) => debug!(error = %e, "drain ended with error"),
        Err(_) => debug!("peer kept sending after rejection, closing"),
    }
}
