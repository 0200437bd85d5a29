//! End-to-end transfer scenarios: local download, relay onto a DPU served by
//! a loopback `PutServer`, path rejection and digest mismatch.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use relay_data_channel::{DataChannelError, DpuChannel, PutOpen, PutRequest, PutServer};
use relay_dpu_proxy::{ConnectionCache, DpuResolver, MemoryTable};
use relay_file_ops::{
    FetchFuture, FileService, Source, SourceFetcher, TransferLimits, TransferOutcome,
};
use relay_protocol::{
    CallContext, Code, HashMethod, HashType, RemoteDownload, TARGET_INDEX_KEY, TARGET_TYPE_KEY,
    TransferProtocol, TransferToRemoteRequest,
};
use relay_transfer::{PathPolicy, digest_bytes};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Serves the same bytes for every URL and counts how often it was asked.
struct MemoryFetcher {
    body: Vec<u8>,
    opens: AtomicUsize,
}

impl MemoryFetcher {
    fn new(body: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            body: body.to_vec(),
            opens: AtomicUsize::new(0),
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl SourceFetcher for MemoryFetcher {
    fn open<'a>(&'a self, _url: &'a str, _max_size: u64) -> FetchFuture<'a> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Source {
                reader: Box::pin(io::Cursor::new(self.body.clone())),
                size_hint: Some(self.body.len() as u64),
            })
        })
    }
}

/// A source body that never produces a byte.
struct Stalled;

impl AsyncRead for Stalled {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

struct StalledFetcher;

impl SourceFetcher for StalledFetcher {
    fn open<'a>(&'a self, _url: &'a str, _max_size: u64) -> FetchFuture<'a> {
        Box::pin(async {
            Ok(Source {
                reader: Box::pin(Stalled),
                size_hint: None,
            })
        })
    }
}

/// A host mount with the allow-listed directories in place.
fn mount() -> (tempfile::TempDir, PathPolicy) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
    std::fs::create_dir_all(dir.path().join("var/tmp")).unwrap();
    let policy = PathPolicy::new(dir.path());
    (dir, policy)
}

fn request(local_path: &str) -> TransferToRemoteRequest {
    TransferToRemoteRequest {
        local_path: local_path.into(),
        remote_download: Some(RemoteDownload {
            path: "http://images.example/fw.bin".into(),
            protocol: TransferProtocol::Http,
        }),
    }
}

fn dpu_ctx(index: &str) -> CallContext {
    CallContext::new()
        .with_metadata(TARGET_TYPE_KEY, "dpu")
        .with_metadata(TARGET_INDEX_KEY, index)
}

/// A DPU: a loopback `PutServer` writing under its own host mount.
struct FakeDpu {
    _mount: tempfile::TempDir,
    root: std::path::PathBuf,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl FakeDpu {
    async fn start() -> Self {
        let (dir, policy) = mount();
        let cancel = CancellationToken::new();
        let server = PutServer::new(policy, cancel.clone());
        let listener = server.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.serve(listener).await });
        Self {
            root: dir.path().to_path_buf(),
            _mount: dir,
            addr,
            cancel,
        }
    }

    fn file(&self, path: &str) -> std::path::PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl Drop for FakeDpu {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A connection cache whose tables list DPU `id` at `addr`.
fn cache_for(id: &str, addr: SocketAddr, reachable: bool) -> Arc<ConnectionCache> {
    let state = Arc::new(MemoryTable::new());
    let config = Arc::new(MemoryTable::new());
    let access = if reachable { "True" } else { "False" };
    state.insert(
        &format!("CHASSIS_MIDPLANE_TABLE|DPU{id}"),
        [("ip_address", addr.ip().to_string()), ("access", access.to_string())],
    );
    config.insert(&format!("DPU|dpu{id}"), [("gnmi_port", addr.port().to_string())]);
    let resolver = Arc::new(DpuResolver::new(state, config));
    Arc::new(ConnectionCache::new(Some(resolver)))
}

fn md5(data: &[u8]) -> HashType {
    digest_bytes(HashMethod::Md5, data)
}

fn assert_no_files(root: &Path) {
    for dir in ["tmp", "var/tmp"] {
        let entries: Vec<_> = std::fs::read_dir(root.join(dir)).unwrap().collect();
        assert!(entries.is_empty(), "unexpected files in {dir}: {entries:?}");
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn local_download_lands_under_host_mount() {
    let (dir, policy) = mount();
    let body = b"bootloader image v2".repeat(1000);
    let fetcher = MemoryFetcher::new(&body);
    let service = FileService::new(policy).with_fetcher(fetcher.clone());

    let result = service
        .transfer_to_remote(&CallContext::new(), &request("/tmp/fw.bin"))
        .await
        .unwrap();

    let stored = dir.path().join("tmp/fw.bin");
    assert_eq!(result.outcome, TransferOutcome::Stored(stored.clone()));
    assert_eq!(result.bytes, body.len() as u64);
    assert_eq!(result.digest, md5(&body));
    assert_eq!(std::fs::read(&stored).unwrap(), body);
    assert_eq!(fetcher.opens(), 1);
}

#[tokio::test]
async fn local_destination_errors_keep_their_kind() {
    let (dir, policy) = mount();
    let service = FileService::new(policy).with_fetcher(MemoryFetcher::new(b"fw"));

    let err = service
        .transfer_to_remote(&CallContext::new(), &request("/tmp/no_such_dir/fw.bin"))
        .await
        .unwrap_err();
    assert_eq!(err.status().code, Code::NotFound, "{err}");
    assert!(err.to_string().starts_with("failed to create"));

    // The destination is a directory: neither missing nor a permission error.
    std::fs::create_dir(dir.path().join("tmp/occupied")).unwrap();
    let err = service
        .transfer_to_remote(&CallContext::new(), &request("/tmp/occupied"))
        .await
        .unwrap_err();
    assert_eq!(err.status().code, Code::Internal);
    assert!(dir.path().join("tmp/occupied").is_dir());
}

#[tokio::test]
async fn response_carries_the_digest() {
    let (_dir, policy) = mount();
    let service = FileService::new(policy).with_fetcher(MemoryFetcher::new(b"abc"));

    let resp = service
        .transfer_to_remote_response(&CallContext::new(), &request("/var/tmp/abc"))
        .await
        .unwrap();
    assert_eq!(resp.hash.to_hex(), "900150983cd24fb0d6963f7d28e17f72");
}

#[tokio::test]
async fn dpu_transfer_streams_without_touching_local_storage() {
    let dpu = FakeDpu::start().await;
    let (local, policy) = mount();
    let body: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let limits = TransferLimits {
        chunk_size: 4096,
        ..TransferLimits::default()
    };
    let service = FileService::new(policy)
        .with_fetcher(MemoryFetcher::new(&body))
        .with_connections(cache_for("0", dpu.addr, true))
        .with_limits(limits);

    let result = service
        .transfer_to_remote(&dpu_ctx("0"), &request("/tmp/fw.bin"))
        .await
        .unwrap();

    assert_eq!(result.outcome, TransferOutcome::Forwarded { dpu: "0".into() });
    assert_eq!(result.bytes, body.len() as u64);
    assert_eq!(result.digest, md5(&body));
    assert_eq!(std::fs::read(dpu.file("/tmp/fw.bin")).unwrap(), body);
    assert_no_files(local.path());
}

#[tokio::test]
async fn dpu_transfer_with_sha256() {
    let dpu = FakeDpu::start().await;
    let (_local, policy) = mount();
    let limits = TransferLimits {
        hash_method: HashMethod::Sha256,
        ..TransferLimits::default()
    };
    let service = FileService::new(policy)
        .with_fetcher(MemoryFetcher::new(b"payload"))
        .with_connections(cache_for("1", dpu.addr, true))
        .with_limits(limits);

    let result = service
        .transfer_to_remote(&dpu_ctx("1"), &request("/var/tmp/p.bin"))
        .await
        .unwrap();
    assert_eq!(result.digest, digest_bytes(HashMethod::Sha256, b"payload"));
    assert_eq!(std::fs::read(dpu.file("/var/tmp/p.bin")).unwrap(), b"payload");
}

#[tokio::test]
async fn repeated_dpu_transfers_reuse_the_connection() {
    let dpu = FakeDpu::start().await;
    let (_local, policy) = mount();
    let cache = cache_for("0", dpu.addr, true);
    let service = FileService::new(policy)
        .with_fetcher(MemoryFetcher::new(b"again"))
        .with_connections(cache.clone());

    for name in ["/tmp/a", "/tmp/b", "/tmp/c"] {
        service
            .transfer_to_remote(&dpu_ctx("0"), &request(name))
            .await
            .unwrap();
        assert_eq!(std::fs::read(dpu.file(name)).unwrap(), b"again");
    }
    assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn paths_outside_allow_list_fail_before_any_io() {
    let (dir, policy) = mount();
    let fetcher = MemoryFetcher::new(b"root::0:0");
    // An unreachable address: nothing may dial it.
    let cache = cache_for("0", "127.0.0.1:9".parse().unwrap(), true);
    let service = FileService::new(policy)
        .with_fetcher(fetcher.clone())
        .with_connections(cache.clone());

    for ctx in [CallContext::new(), dpu_ctx("0")] {
        for path in ["/etc/passwd", "/tmp/../etc/passwd", "relative/file"] {
            let err = service
                .transfer_to_remote(&ctx, &request(path))
                .await
                .unwrap_err();
            assert_eq!(err.status().code, Code::InvalidArgument, "{path}");
        }
    }

    assert_eq!(fetcher.opens(), 0);
    assert!(cache.is_empty().await);
    assert_no_files(dir.path());
}

#[tokio::test]
async fn dpu_rejection_mid_stream_keeps_the_dpu_status() {
    let dpu = FakeDpu::start().await;
    let (_local, policy) = mount();
    let body = vec![0xa5u8; 8 * 1024 * 1024];
    let service = FileService::new(policy)
        .with_fetcher(MemoryFetcher::new(&body))
        .with_connections(cache_for("0", dpu.addr, true));

    let err = service
        .transfer_to_remote(&dpu_ctx("0"), &request("/tmp/no_such_dir/fw.bin"))
        .await
        .unwrap_err();
    assert_eq!(err.status().code, Code::NotFound, "{err}");
    assert_no_files(&dpu.root);
}

#[tokio::test]
async fn wrong_hash_is_data_loss_and_leaves_nothing_behind() {
    let dpu = FakeDpu::start().await;
    let channel = DpuChannel::connect(dpu.addr, Duration::from_secs(5))
        .await
        .unwrap();

    let mut client = channel.open_put().await.unwrap();
    client
        .send(&PutRequest::Open(PutOpen {
            remote_file: "/tmp/corrupt.bin".into(),
            permissions: 0o644,
            method: HashMethod::Md5,
        }))
        .await
        .unwrap();
    client.send_content(b"the real bytes").await.unwrap();
    client
        .send(&PutRequest::Hash(md5(b"different bytes")))
        .await
        .unwrap();

    match client.close_and_recv().await {
        Err(DataChannelError::Rejected(status)) => {
            assert_eq!(status.code, Code::DataLoss);
            assert!(status.message.contains("hash mismatch"));
        }
        other => panic!("expected data-loss rejection, got {other:?}"),
    }
    assert!(!dpu.file("/tmp/corrupt.bin").exists());
    assert_no_files(&dpu.root);
}

#[tokio::test]
async fn local_put_with_wrong_hash_is_data_loss() {
    let (dir, policy) = mount();
    let service = FileService::new(policy);

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    tx.send(PutRequest::Open(PutOpen {
        remote_file: "/tmp/img".into(),
        permissions: 0,
        method: HashMethod::Md5,
    }))
    .await
    .unwrap();
    tx.send(PutRequest::Content(b"abc".to_vec())).await.unwrap();
    tx.send(PutRequest::Hash(md5(b"abd"))).await.unwrap();
    drop(tx);

    let err = service.put(&dpu_ctx("0"), &mut rx).await.unwrap_err();
    assert_eq!(err.status().code, Code::DataLoss);
    assert_no_files(dir.path());
}

#[tokio::test]
async fn local_put_commits_file() {
    let (dir, policy) = mount();
    let service = FileService::new(policy);

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    tx.send(PutRequest::Open(PutOpen {
        remote_file: "/var/tmp/cfg.json".into(),
        permissions: 0o600,
        method: HashMethod::Md5,
    }))
    .await
    .unwrap();
    tx.send(PutRequest::Content(b"{\"a\":".to_vec())).await.unwrap();
    tx.send(PutRequest::Content(b"1}".to_vec())).await.unwrap();
    tx.send(PutRequest::Hash(md5(b"{\"a\":1}"))).await.unwrap();
    drop(tx);

    let summary = service.put(&CallContext::new(), &mut rx).await.unwrap();
    assert_eq!(summary.path, dir.path().join("var/tmp/cfg.json"));
    assert_eq!(summary.bytes, 7);
    assert_eq!(std::fs::read(&summary.path).unwrap(), b"{\"a\":1}");
}

#[tokio::test]
async fn unreachable_dpu_is_unavailable() {
    let (_local, policy) = mount();
    let fetcher = MemoryFetcher::new(b"x");

    // Marked down in the state table.
    let service = FileService::new(policy.clone())
        .with_fetcher(fetcher.clone())
        .with_connections(cache_for("0", "127.0.0.1:9".parse().unwrap(), false));
    let err = service
        .transfer_to_remote(&dpu_ctx("0"), &request("/tmp/x"))
        .await
        .unwrap_err();
    assert_eq!(err.status().code, Code::Unavailable);

    // Marked up, but nothing listens there.
    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let service = FileService::new(policy)
        .with_fetcher(fetcher)
        .with_connections(cache_for("0", closed, true));
    let err = service
        .transfer_to_remote(&dpu_ctx("0"), &request("/tmp/x"))
        .await
        .unwrap_err();
    assert_eq!(err.status().code, Code::Unavailable);
    assert!(err.to_string().starts_with("failed to get DPU connection"));
}

#[tokio::test]
async fn unknown_dpu_is_internal() {
    let (_local, policy) = mount();
    let service = FileService::new(policy)
        .with_fetcher(MemoryFetcher::new(b"x"))
        .with_connections(cache_for("0", "127.0.0.1:9".parse().unwrap(), true));

    let err = service
        .transfer_to_remote(&dpu_ctx("7"), &request("/tmp/x"))
        .await
        .unwrap_err();
    assert_eq!(err.status().code, Code::Internal);
}

#[tokio::test]
async fn stalled_source_hits_the_deadline() {
    let limits = TransferLimits {
        timeout: Duration::from_millis(100),
        ..TransferLimits::default()
    };

    let (dir, policy) = mount();
    let service = FileService::new(policy)
        .with_fetcher(Arc::new(StalledFetcher))
        .with_limits(limits);
    let err = service
        .transfer_to_remote(&CallContext::new(), &request("/tmp/slow.bin"))
        .await
        .unwrap_err();
    assert_eq!(err.status().code, Code::DeadlineExceeded);
    assert!(!dir.path().join("tmp/slow.bin").exists());

    let dpu = FakeDpu::start().await;
    let service = service.with_connections(cache_for("0", dpu.addr, true));
    let err = service
        .transfer_to_remote(&dpu_ctx("0"), &request("/tmp/slow.bin"))
        .await
        .unwrap_err();
    assert_eq!(err.status().code, Code::DeadlineExceeded);
    assert_eq!(err.to_string(), "streaming operation timed out");
}

#[tokio::test]
async fn falls_back_to_process_wide_proxy() {
    let dpu = FakeDpu::start().await;
    let (_local, policy) = mount();
    let service = FileService::new(policy).with_fetcher(MemoryFetcher::new(b"global"));

    relay_dpu_proxy::set_default_proxy(None);
    let err = service
        .transfer_to_remote(&dpu_ctx("3"), &request("/tmp/g.bin"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("DPU proxy not initialized"));

    relay_dpu_proxy::set_default_proxy(Some(cache_for("3", dpu.addr, true)));
    service
        .transfer_to_remote(&dpu_ctx("3"), &request("/tmp/g.bin"))
        .await
        .unwrap();
    assert_eq!(std::fs::read(dpu.file("/tmp/g.bin")).unwrap(), b"global");
    relay_dpu_proxy::set_default_proxy(None);
}
