//! Per-DPU connection cache.
//!
//! Every lookup resolves the DPU again; the cached channel is reused only when
//! it still points at the freshly resolved address. Each identifier has its
//! own async slot, so a slow dial to one DPU never holds up another, and
//! concurrent requests for the same DPU share a single dial.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use relay_data_channel::{DEFAULT_CONNECT_TIMEOUT, DataChannelError, DpuChannel};
use relay_protocol::Status;
use tracing::{debug, info};

use crate::resolver::{DpuEndpoint, DpuResolver, ResolveError};

/// A boxed future returned by [`Dialer::dial`].
pub type DialFuture<'a> =
    Pin<Box<dyn Future<Output = Result<DpuChannel, DataChannelError>> + Send + 'a>>;

/// Opens a channel to a resolved endpoint.
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, endpoint: &'a DpuEndpoint) -> DialFuture<'a>;
}

/// Connects over TCP with a timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Dialer for TcpDialer {
    fn dial<'a>(&'a self, endpoint: &'a DpuEndpoint) -> DialFuture<'a> {
        Box::pin(DpuChannel::connect(endpoint.addr, self.connect_timeout))
    }
}

/// Errors produced while obtaining a DPU connection.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("DPU proxy not initialized")]
    NotInitialized,

    #[error("resolver not available")]
    ResolverUnavailable,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to connect to DPU {id}: {source}")]
    Dial {
        id: String,
        #[source]
        source: DataChannelError,
    },
}

impl ProxyError {
    pub fn status(&self) -> Status {
        match self {
            ProxyError::Resolve(ResolveError::Unavailable(_)) | ProxyError::Dial { .. } => {
                Status::unavailable(self.to_string())
            }
            _ => Status::internal(self.to_string()),
        }
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<DpuChannel>>>;

/// One reusable channel per DPU identifier.
///
/// Channels handed out belong to the cache; callers use them and drop their
/// clone.
pub struct ConnectionCache {
    resolver: Option<Arc<DpuResolver>>,
    dialer: Arc<dyn Dialer>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConnectionCache {
    /// Creates a cache that dials over TCP.
    pub fn new(resolver: Option<Arc<DpuResolver>>) -> Self {
        Self::with_dialer(resolver, Arc::new(TcpDialer::default()))
    }

    pub fn with_dialer(resolver: Option<Arc<DpuResolver>>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            resolver,
            dialer,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a channel to DPU `id`, dialing when nothing usable is cached.
    pub async fn get_connection(&self, id: &str) -> Result<DpuChannel, ProxyError> {
        let resolver = self.resolver.as_ref().ok_or(ProxyError::ResolverUnavailable)?;
        let endpoint = resolver.resolve(id).await?;

        let slot = self.slot(id);
        let mut cached = slot.lock().await;

        if let Some(channel) = cached.as_ref() {
            if channel.addr() == endpoint.addr {
                return Ok(channel.clone());
            }
            info!(
                dpu = id,
                old = %channel.addr(),
                new = %endpoint.addr,
                "DPU address changed, replacing connection"
            );
        }

        let channel = self
            .dialer
            .dial(&endpoint)
            .await
            .map_err(|source| ProxyError::Dial {
                id: id.to_string(),
                source,
            })?;
        debug!(dpu = id, addr = %endpoint.addr, "cached DPU connection");
        *cached = Some(channel.clone());
        Ok(channel)
    }

    /// Drops the cached channel for `id`. Returns whether one was cached.
    pub async fn invalidate(&self, id: &str) -> bool {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get(id) {
                Some(slot) => slot.clone(),
                None => return false,
            }
        };
        let removed = slot.lock().await.take().is_some();
        if removed {
            debug!(dpu = id, "invalidated DPU connection");
        }
        removed
    }

    /// Number of identifiers with a cached channel.
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn slot(&self, id: &str) -> Slot {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use relay_protocol::Code;

    use super::*;
    use crate::store::MemoryTable;

    /// Dialer that hands out lazy channels and counts calls.
    #[derive(Default)]
    struct CountingDialer {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Dialer for CountingDialer {
        fn dial<'a>(&'a self, endpoint: &'a DpuEndpoint) -> DialFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                Ok(DpuChannel::lazy(endpoint.addr, Duration::from_secs(1)))
            })
        }
    }

    struct FailingDialer;

    impl Dialer for FailingDialer {
        fn dial<'a>(&'a self, _endpoint: &'a DpuEndpoint) -> DialFuture<'a> {
            Box::pin(async {
                Err(DataChannelError::Io(std::io::Error::from(
                    std::io::ErrorKind::ConnectionRefused,
                )))
            })
        }
    }

    /// Dialer whose dials to DPU "0" hang until released.
    #[derive(Default)]
    struct GatedDialer {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    impl Dialer for GatedDialer {
        fn dial<'a>(&'a self, endpoint: &'a DpuEndpoint) -> DialFuture<'a> {
            Box::pin(async move {
                if endpoint.id == "0" {
                    self.entered.notify_one();
                    self.release.notified().await;
                }
                Ok(DpuChannel::lazy(endpoint.addr, Duration::from_secs(1)))
            })
        }
    }

    fn tables() -> (Arc<MemoryTable>, Arc<MemoryTable>) {
        let state = Arc::new(MemoryTable::new());
        let config = Arc::new(MemoryTable::new());
        for (id, ip) in [("0", "169.254.200.1"), ("1", "169.254.200.2")] {
            state.insert(
                &format!("CHASSIS_MIDPLANE_TABLE|DPU{id}"),
                [("ip_address", ip), ("access", "True")],
            );
            config.insert(&format!("DPU|dpu{id}"), [("gnmi_port", "50052")]);
        }
        (state, config)
    }

    fn cache_with(dialer: Arc<dyn Dialer>) -> (ConnectionCache, Arc<MemoryTable>) {
        let (state, config) = tables();
        let resolver = Arc::new(DpuResolver::new(state.clone(), config));
        (ConnectionCache::with_dialer(Some(resolver), dialer), state)
    }

    #[tokio::test]
    async fn no_resolver() {
        let cache = ConnectionCache::new(None);
        let err = cache.get_connection("0").await.unwrap_err();
        assert_eq!(err.to_string(), "resolver not available");
        assert_eq!(err.status().code, Code::Internal);
    }

    #[tokio::test]
    async fn unknown_dpu_is_internal() {
        let dialer = Arc::new(CountingDialer::default());
        let (cache, _) = cache_with(dialer.clone());
        let err = cache.get_connection("99").await.unwrap_err();
        assert!(matches!(err, ProxyError::Resolve(ResolveError::NotFound(_))));
        assert_eq!(err.status().code, Code::Internal);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn down_dpu_is_unavailable() {
        let dialer = Arc::new(CountingDialer::default());
        let (cache, state) = cache_with(dialer.clone());
        state.insert("CHASSIS_MIDPLANE_TABLE|DPU0", [("access", "False")]);

        let err = cache.get_connection("0").await.unwrap_err();
        assert_eq!(err.status().code, Code::Unavailable);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reuses_cached_channel() {
        let dialer = Arc::new(CountingDialer::default());
        let (cache, _) = cache_with(dialer.clone());

        let a = cache.get_connection("0").await.unwrap();
        let b = cache.get_connection("0").await.unwrap();
        assert_eq!(a.addr(), b.addr());
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);

        cache.get_connection("1").await.unwrap();
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn concurrent_requests_dial_once() {
        let dialer = Arc::new(CountingDialer {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let (cache, _) = cache_with(dialer.clone());
        let cache = Arc::new(cache);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_connection("0").await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_dial_does_not_block_other_dpus() {
        let dialer = Arc::new(GatedDialer::default());
        let (cache, _) = cache_with(dialer.clone());
        let cache = Arc::new(cache);

        let stuck = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_connection("0").await })
        };
        dialer.entered.notified().await;

        let other = tokio::time::timeout(Duration::from_secs(1), cache.get_connection("1"))
            .await
            .expect("DPU 1 waited on DPU 0's dial")
            .unwrap();
        assert_eq!(other.addr(), "169.254.200.2:50052".parse().unwrap());
        assert!(!stuck.is_finished());

        dialer.release.notify_one();
        stuck.await.unwrap().unwrap();
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn address_change_replaces_channel() {
        let dialer = Arc::new(CountingDialer::default());
        let (cache, state) = cache_with(dialer.clone());

        let first = cache.get_connection("0").await.unwrap();
        state.insert("CHASSIS_MIDPLANE_TABLE|DPU0", [("ip_address", "169.254.200.9")]);
        let second = cache.get_connection("0").await.unwrap();

        assert_ne!(first.addr(), second.addr());
        assert_eq!(second.addr(), "169.254.200.9:50052".parse().unwrap());
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn invalidate_forces_redial() {
        let dialer = Arc::new(CountingDialer::default());
        let (cache, _) = cache_with(dialer.clone());

        cache.get_connection("0").await.unwrap();
        assert!(cache.invalidate("0").await);
        assert!(!cache.invalidate("0").await);
        assert!(cache.is_empty().await);

        cache.get_connection("0").await.unwrap();
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dial_failure_is_unavailable_and_not_cached() {
        let (cache, _) = cache_with(Arc::new(FailingDialer));
        let err = cache.get_connection("0").await.unwrap_err();
        assert!(matches!(err, ProxyError::Dial { .. }));
        assert_eq!(err.status().code, Code::Unavailable);
        assert!(cache.is_empty().await);
    }
}
