//! TransferToRemote routed to a DPU: relay the download straight into an
//! upload on the DPU without touching local storage.
//!
//! One chunk buffer is reused for the whole transfer and the digest is
//! computed as bytes pass through, so memory use does not depend on the file
//! size. Every step runs against the same request deadline.

use std::future::Future;

use relay_data_channel::{DataChannelError, DpuChannel, PutOpen, PutRequest};
use relay_dpu_proxy::{ConnectionCache, ProxyError};
use relay_protocol::{DEFAULT_PERMISSIONS, TransferToRemoteRequest};
use relay_transfer::{DigestReader, PathPolicy};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::FileError;
use crate::fetch::SourceFetcher;
use crate::local::check_transfer_request;
use crate::service::TransferLimits;
use crate::{TransferOutcome, TransferResult};

const STREAMING: &str = "streaming operation";

pub(crate) async fn transfer_streaming(
    req: &TransferToRemoteRequest,
    dpu: &str,
    policy: &PathPolicy,
    fetcher: &dyn SourceFetcher,
    connections: Option<&ConnectionCache>,
    limits: &TransferLimits,
) -> Result<TransferResult, FileError> {
    let (local_path, url) = check_transfer_request(req)?;
    // The DPU translates the path for its own filesystem.
    let remote_file = policy.validate(local_path)?.to_string_lossy().into_owned();
    let deadline = Instant::now() + limits.timeout;

    info!(dpu, url, remote_file = %remote_file, "streaming transfer to DPU");

    let source = bounded(deadline, fetcher.open(url, limits.max_file_size))
        .await?
        .map_err(FileError::SourceOpen)?;

    let channel = bounded(deadline, connect(dpu, connections))
        .await?
        .map_err(FileError::Connection)?;

    let mut client = bounded(deadline, channel.open_put())
        .await?
        .map_err(FileError::UploadOpen)?;

    let open = PutRequest::Open(PutOpen {
        remote_file: remote_file.clone(),
        permissions: DEFAULT_PERMISSIONS,
        method: limits.hash_method,
    });
    bounded(deadline, client.send(&open))
        .await?
        .map_err(send_failed("open request"))?;

    let mut reader = DigestReader::new(source.reader, limits.hash_method);
    let mut buf = vec![0u8; limits.chunk_size];
    loop {
        if Instant::now() >= deadline {
            return Err(FileError::DeadlineExceeded(STREAMING));
        }

        let n = bounded(deadline, reader.read(&mut buf))
            .await?
            .map_err(FileError::SourceRead)?;
        if n == 0 {
            break;
        }

        bounded(deadline, client.send_content(&buf[..n]))
            .await?
            .map_err(send_failed("content chunk"))?;
    }

    let bytes = reader.bytes_read();
    let digest = reader.finish();
    debug!(dpu, bytes, digest = %digest, "source drained, sending hash");

    bounded(deadline, client.send(&PutRequest::Hash(digest.clone())))
        .await?
        .map_err(send_failed("hash"))?;

    match bounded(deadline, client.close_and_recv()).await? {
        Ok(()) => {}
        Err(DataChannelError::Rejected(status)) => return Err(FileError::PeerRejected(status)),
        Err(e) => return Err(FileError::Ack(e)),
    }

    info!(
        dpu,
        remote_file = %remote_file,
        bytes,
        digest = %digest,
        "streaming transfer complete"
    );
    Ok(TransferResult {
        digest,
        bytes,
        outcome: TransferOutcome::Forwarded {
            dpu: dpu.to_string(),
        },
    })
}

/// A rejection read back while sending carries the receiver's own status.
fn send_failed(what: &'static str) -> impl FnOnce(DataChannelError) -> FileError {
    move |source| match source {
        DataChannelError::Rejected(status) => FileError::PeerRejected(status),
        source => FileError::Send { what, source },
    }
}

async fn connect(
    dpu: &str,
    connections: Option<&ConnectionCache>,
) -> Result<DpuChannel, ProxyError> {
    match connections {
        Some(cache) => cache.get_connection(dpu).await,
        None => relay_dpu_proxy::get_dpu_connection(dpu).await,
    }
}

/// Runs `fut` against the request deadline.
async fn bounded<F: Future>(deadline: Instant, fut: F) -> Result<F::Output, FileError> {
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| FileError::DeadlineExceeded(STREAMING))
}
