//! The file service: access check, routing and dispatch for each RPC.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use relay_data_channel::{PutReceiver, PutSummary, RequestSource};
use relay_dpu_proxy::ConnectionCache;
use relay_protocol::{
    CallContext, HashMethod, RemoveRequest, Status, TARGET_INDEX_KEY, TARGET_TYPE_KEY,
    TransferToRemoteRequest, TransferToRemoteResponse,
};
use relay_transfer::PathPolicy;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::FileError;
use crate::fetch::{HttpFetcher, SourceFetcher};
use crate::local::transfer_local;
use crate::remove::remove_file;
use crate::streaming::transfer_streaming;
use crate::TransferResult;

/// Default deadline for a whole transfer.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default cap on a downloaded file (4 GiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Default read size when relaying to a DPU (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Bounds applied to every transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub timeout: Duration,
    pub max_file_size: u64,
    pub chunk_size: usize,
    pub hash_method: HashMethod,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TRANSFER_TIMEOUT,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            hash_method: HashMethod::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Access gate
// ---------------------------------------------------------------------------

/// A boxed future returned by [`AccessGate::check_access`].
pub type AccessFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Status>> + Send + 'a>>;

/// Decides whether a caller may use a service.
pub trait AccessGate: Send + Sync {
    fn check_access<'a>(
        &'a self,
        ctx: &'a CallContext,
        service: &'a str,
        write: bool,
    ) -> AccessFuture<'a>;
}

/// Lets every call through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessGate for AllowAll {
    fn check_access<'a>(
        &'a self,
        _ctx: &'a CallContext,
        _service: &'a str,
        _write: bool,
    ) -> AccessFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

const SERVICE_NAME: &str = "file";

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Handlers for `TransferToRemote`, `Put` and `Remove`.
#[derive(Clone)]
pub struct FileService {
    policy: PathPolicy,
    limits: TransferLimits,
    fetcher: Arc<dyn SourceFetcher>,
    connections: Option<Arc<ConnectionCache>>,
    gate: Arc<dyn AccessGate>,
    cancel: CancellationToken,
}

impl FileService {
    /// Creates a service that fetches over HTTP, lets every caller through and
    /// reaches DPUs through the process-wide proxy.
    pub fn new(policy: PathPolicy) -> Self {
        Self {
            policy,
            limits: TransferLimits::default(),
            fetcher: Arc::new(HttpFetcher::default()),
            connections: None,
            gate: Arc::new(AllowAll),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_limits(mut self, limits: TransferLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Uses `cache` for DPU connections instead of the process-wide proxy.
    pub fn with_connections(mut self, cache: Arc<ConnectionCache>) -> Self {
        self.connections = Some(cache);
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn AccessGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Uploads in progress stop when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    pub fn limits(&self) -> &TransferLimits {
        &self.limits
    }

    /// Fetches a remote file onto this device, or straight onto a DPU when
    /// the call carries DPU routing metadata.
    pub async fn transfer_to_remote(
        &self,
        ctx: &CallContext,
        req: &TransferToRemoteRequest,
    ) -> Result<TransferResult, FileError> {
        self.authorize(ctx).await?;

        match ctx.dpu_target() {
            Some(dpu) => {
                transfer_streaming(
                    req,
                    dpu,
                    &self.policy,
                    self.fetcher.as_ref(),
                    self.connections.as_deref(),
                    &self.limits,
                )
                .await
            }
            None => transfer_local(req, &self.policy, self.fetcher.as_ref(), &self.limits).await,
        }
    }

    /// [`transfer_to_remote`](Self::transfer_to_remote) shaped as the RPC
    /// response.
    pub async fn transfer_to_remote_response(
        &self,
        ctx: &CallContext,
        req: &TransferToRemoteRequest,
    ) -> Result<TransferToRemoteResponse, Status> {
        let result = self.transfer_to_remote(ctx, req).await?;
        Ok(TransferToRemoteResponse {
            hash: result.digest,
        })
    }

    /// Receives an upload onto this device.
    ///
    /// Uploads are always written locally. DPU metadata is only logged.
    pub async fn put<S: RequestSource>(
        &self,
        ctx: &CallContext,
        source: &mut S,
    ) -> Result<PutSummary, FileError> {
        self.authorize(ctx).await?;

        if let (Some(kind), Some(index)) =
            (ctx.metadata(TARGET_TYPE_KEY), ctx.metadata(TARGET_INDEX_KEY))
        {
            info!(
                target_type = kind,
                target_index = index,
                "upload carries DPU metadata, handling locally"
            );
        }

        let receiver = PutReceiver::new(self.policy.clone()).with_cancel(self.cancel.clone());
        Ok(receiver.receive(source).await?)
    }

    /// Deletes a file from this device.
    pub async fn remove(&self, ctx: &CallContext, req: &RemoveRequest) -> Result<(), FileError> {
        self.authorize(ctx).await?;
        remove_file(req, &self.policy).await?;
        Ok(())
    }

    async fn authorize(&self, ctx: &CallContext) -> Result<(), FileError> {
        self.gate
            .check_access(ctx, SERVICE_NAME, true)
            .await
            .map_err(FileError::AccessDenied)
    }
}
