//! DPU identifier to network endpoint resolution.
//!
//! Two tables are consulted:
//!
//! ```text
//! state:  CHASSIS_MIDPLANE_TABLE|DPU<id>  { ip_address, access }
//! config: DPU|dpu<id>                     { gnmi_port }
//! ```
//!
//! Nothing is cached here; every call reads both tables again so an address
//! change is picked up on the next request.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use relay_protocol::Status;
use tracing::debug;

use crate::store::{StoreError, TableReader};

pub const STATE_KEY_PREFIX: &str = "CHASSIS_MIDPLANE_TABLE|DPU";
pub const CONFIG_KEY_PREFIX: &str = "DPU|dpu";

const FIELD_IP: &str = "ip_address";
const FIELD_ACCESS: &str = "access";
const FIELD_PORT: &str = "gnmi_port";

/// Where a DPU can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpuEndpoint {
    pub id: String,
    pub addr: SocketAddr,
    /// Whether the midplane reports the DPU as reachable.
    pub reachable: bool,
}

/// Errors produced while resolving a DPU.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("DPU {0} not found")]
    NotFound(String),

    #[error("DPU {0} is not reachable")]
    Unavailable(String),

    #[error("DPU {id}: {reason}")]
    Invalid { id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResolveError {
    pub fn status(&self) -> Status {
        match self {
            ResolveError::NotFound(_) => Status::not_found(self.to_string()),
            ResolveError::Unavailable(_) => Status::unavailable(self.to_string()),
            ResolveError::Invalid { .. } | ResolveError::Store(_) => {
                Status::internal(self.to_string())
            }
        }
    }

    fn invalid(id: &str, reason: impl Into<String>) -> Self {
        ResolveError::Invalid {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Resolves DPU identifiers through the state and config tables.
pub struct DpuResolver {
    state: Arc<dyn TableReader>,
    config: Arc<dyn TableReader>,
}

impl DpuResolver {
    pub fn new(state: Arc<dyn TableReader>, config: Arc<dyn TableReader>) -> Self {
        Self { state, config }
    }

    /// Resolves `id` to an endpoint that is currently marked reachable.
    ///
    /// The reachability flag is checked before the config table is read, so a
    /// DPU that is down reports unavailable even when its config is missing.
    pub async fn resolve(&self, id: &str) -> Result<DpuEndpoint, ResolveError> {
        let (ip, reachable) = self.read_state(id).await?;
        if !reachable {
            return Err(ResolveError::Unavailable(id.to_string()));
        }
        let ip = ip?;
        let port = self.read_port(id).await?;

        debug!(dpu = id, %ip, port, "resolved DPU endpoint");
        Ok(DpuEndpoint {
            id: id.to_string(),
            addr: SocketAddr::new(ip, port),
            reachable,
        })
    }

    /// Like [`resolve`](Self::resolve) but returns an endpoint even when the
    /// DPU is marked down.
    pub async fn lookup(&self, id: &str) -> Result<DpuEndpoint, ResolveError> {
        let (ip, reachable) = self.read_state(id).await?;
        let ip = ip?;
        let port = self.read_port(id).await?;
        Ok(DpuEndpoint {
            id: id.to_string(),
            addr: SocketAddr::new(ip, port),
            reachable,
        })
    }

    /// Returns the parsed address (deferred, so reachability can be checked
    /// first) and the reachability flag.
    async fn read_state(
        &self,
        id: &str,
    ) -> Result<(Result<IpAddr, ResolveError>, bool), ResolveError> {
        let fields = self
            .state
            .get_all(&format!("{STATE_KEY_PREFIX}{id}"))
            .await?;
        if fields.is_empty() {
            return Err(ResolveError::NotFound(id.to_string()));
        }

        let reachable = fields
            .get(FIELD_ACCESS)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let ip = match fields.get(FIELD_IP).map(String::as_str) {
            None | Some("") => Err(ResolveError::invalid(id, "no ip_address in state table")),
            Some(raw) => raw
                .parse::<IpAddr>()
                .map_err(|_| ResolveError::invalid(id, format!("invalid ip_address {raw:?}"))),
        };

        Ok((ip, reachable))
    }

    async fn read_port(&self, id: &str) -> Result<u16, ResolveError> {
        let fields = self
            .config
            .get_all(&format!("{CONFIG_KEY_PREFIX}{id}"))
            .await?;
        if fields.is_empty() {
            return Err(ResolveError::invalid(id, "no entry in config table"));
        }
        let raw = fields
            .get(FIELD_PORT)
            .ok_or_else(|| ResolveError::invalid(id, "no gnmi_port in config table"))?;
        raw.parse::<u16>()
            .map_err(|_| ResolveError::invalid(id, format!("invalid gnmi_port {raw:?}")))
    }
}
