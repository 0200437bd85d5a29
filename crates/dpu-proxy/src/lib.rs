//! DPU resolution and connection reuse.
//!
//! [`DpuResolver`] turns a DPU index into an address using the midplane
//! state and DPU config tables; [`ConnectionCache`] keeps one channel per DPU
//! on top of it. Handlers receive the cache explicitly. The process-wide
//! default below exists for callers that cannot be handed one.

pub mod proxy;
pub mod resolver;
pub mod store;

pub use proxy::{ConnectionCache, DialFuture, Dialer, ProxyError, TcpDialer};
pub use resolver::{DpuEndpoint, DpuResolver, ResolveError};
pub use store::{Fields, MemoryTable, StoreError, TableFuture, TableReader};

use std::sync::{Arc, PoisonError, RwLock};

use relay_data_channel::DpuChannel;

static DEFAULT_PROXY: RwLock<Option<Arc<ConnectionCache>>> = RwLock::new(None);

/// Installs (or with `None`, clears) the process-wide connection cache.
pub fn set_default_proxy(cache: Option<Arc<ConnectionCache>>) {
    *DEFAULT_PROXY.write().unwrap_or_else(PoisonError::into_inner) = cache;
}

pub fn default_proxy() -> Option<Arc<ConnectionCache>> {
    DEFAULT_PROXY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Gets a DPU connection through the process-wide cache.
pub async fn get_dpu_connection(id: &str) -> Result<DpuChannel, ProxyError> {
    let cache = default_proxy().ok_or(ProxyError::NotInitialized)?;
    cache.get_connection(id).await
}
