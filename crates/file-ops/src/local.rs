//! TransferToRemote without DPU routing: download onto this device.

use std::io;
use std::path::Path;

use relay_protocol::{HashType, TransferProtocol, TransferToRemoteRequest};
use relay_transfer::{PathPolicy, file_digest};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};

use crate::error::FileError;
use crate::fetch::{FetchError, SourceFetcher};
use crate::service::TransferLimits;
use crate::{TransferOutcome, TransferResult};

/// Checks that a transfer request names a destination and an HTTP source.
///
/// Returns `(destination, url)`.
pub(crate) fn check_transfer_request(
    req: &TransferToRemoteRequest,
) -> Result<(&str, &str), FileError> {
    let remote = req
        .remote_download
        .as_ref()
        .ok_or_else(|| FileError::InvalidArgument("remote_download cannot be nil".into()))?;

    if req.local_path.is_empty() {
        return Err(FileError::InvalidArgument(
            "local_path cannot be empty".into(),
        ));
    }
    if remote.path.is_empty() {
        return Err(FileError::InvalidArgument(
            "remote download path (URL) cannot be empty".into(),
        ));
    }
    if remote.protocol != TransferProtocol::Http {
        return Err(FileError::Unimplemented(format!(
            "only HTTP protocol is supported, got protocol {}",
            remote.protocol
        )));
    }

    Ok((&req.local_path, &remote.path))
}

/// Downloads the source straight to its destination and digests the result.
pub(crate) async fn transfer_local(
    req: &TransferToRemoteRequest,
    policy: &PathPolicy,
    fetcher: &dyn SourceFetcher,
    limits: &TransferLimits,
) -> Result<TransferResult, FileError> {
    let (local_path, url) = check_transfer_request(req)?;
    let dest = policy.resolve(local_path)?;

    info!(url, dest = %dest.display(), "downloading");

    let deadline = Instant::now() + limits.timeout;
    let mut source = timeout_at(deadline, fetcher.open(url, limits.max_file_size))
        .await
        .map_err(|_| FileError::DeadlineExceeded("download"))?
        .map_err(FileError::Download)?;

    let mut file = File::create(&dest).await.map_err(|source| FileError::Io {
        context: format!("failed to create {}", dest.display()),
        source,
    })?;

    let bytes = match timeout_at(deadline, write_body(&mut source.reader, &mut file)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            drop(file);
            remove_partial(&dest).await;
            return Err(FileError::Download(FetchError::Io(e)));
        }
        Err(_) => {
            drop(file);
            remove_partial(&dest).await;
            return Err(FileError::DeadlineExceeded("download"));
        }
    };
    drop(file);

    let digest: HashType = match file_digest(&dest, limits.hash_method).await {
        Ok(digest) => digest,
        Err(e) => {
            remove_partial(&dest).await;
            return Err(FileError::Digest(e));
        }
    };

    info!(dest = %dest.display(), bytes, digest = %digest, "download complete");
    Ok(TransferResult {
        digest,
        bytes,
        outcome: TransferOutcome::Stored(dest),
    })
}

async fn write_body<R: AsyncRead + Unpin>(reader: &mut R, file: &mut File) -> io::Result<u64> {
    let bytes = tokio::io::copy(reader, file).await?;
    file.flush().await?;
    Ok(bytes)
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial download"),
    }
}
