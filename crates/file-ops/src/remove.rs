//! Safe file removal.

use std::path::PathBuf;

use relay_protocol::RemoveRequest;
use relay_transfer::PathPolicy;
use tracing::{info, warn};

use crate::error::FileError;

/// Deletes a single file inside the allow-listed directories.
///
/// Safety checks:
/// 1. The path must be non-empty.
/// 2. The path must pass the allow-list (reported as permission denied here,
///    since the caller asked to destroy something it may not touch).
/// 3. Only files are removed; directories fail.
///
/// Returns the translated path that was removed.
pub(crate) async fn remove_file(
    req: &RemoveRequest,
    policy: &PathPolicy,
) -> Result<PathBuf, FileError> {
    if req.remote_file.is_empty() {
        return Err(FileError::InvalidArgument(
            "remote_file cannot be empty".into(),
        ));
    }

    let clean = policy.validate(&req.remote_file).map_err(|e| {
        warn!(path = %req.remote_file, error = %e, "remove denied");
        FileError::PermissionDenied("only files in /tmp/ or /var/tmp/ can be removed".into())
    })?;
    let path = policy.translate(&clean);

    tokio::fs::remove_file(&path)
        .await
        .map_err(|source| FileError::Io {
            context: format!("failed to remove {}", path.display()),
            source,
        })?;

    info!(path = %path.display(), "removed file");
    Ok(path)
}
