//! Wires the agent components together and runs them until shutdown.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use relay_data_channel::PutServer;
use relay_dpu_proxy::{ConnectionCache, DpuResolver, MemoryTable, TcpDialer};
use relay_file_ops::FileService;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// The assembled agent.
pub struct Agent {
    /// Handlers for the file RPCs.
    pub files: FileService,
    /// Receives uploads relayed to this device.
    pub uploads: PutServer,
    /// DPU connections shared by every handler.
    pub connections: Arc<ConnectionCache>,
}

/// Builds the agent from `config`. Everything stops when `cancel` fires.
pub async fn build(config: &Config, cancel: CancellationToken) -> anyhow::Result<Agent> {
    let policy = config.path_policy();

    let state = load_table("state", config.state_table.as_deref()).await?;
    let dpu_config = load_table("config", config.config_table.as_deref()).await?;
    let resolver = Arc::new(DpuResolver::new(state, dpu_config));
    let connections = Arc::new(ConnectionCache::with_dialer(
        Some(resolver),
        Arc::new(TcpDialer::new(config.connect_timeout())),
    ));

    let files = FileService::new(policy.clone())
        .with_limits(config.limits())
        .with_connections(Arc::clone(&connections))
        .with_cancel(cancel.clone());

    let uploads = PutServer::new(policy, cancel)
        .with_idle_timeout(config.idle_timeout())
        .with_frame_timeout(config.frame_timeout());

    Ok(Agent {
        files,
        uploads,
        connections,
    })
}

/// Runs the agent until SIGINT.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let agent = build(&config, cancel.clone()).await?;

    relay_dpu_proxy::set_default_proxy(Some(Arc::clone(&agent.connections)));

    let limits = agent.files.limits();
    tracing::info!(
        host_mount = %agent.files.policy().host_mount().display(),
        timeout_secs = limits.timeout.as_secs(),
        max_file_size = limits.max_file_size,
        hash = %limits.hash_method,
        "file service ready"
    );

    let listener = agent
        .uploads
        .bind(config.listen.as_str())
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;

    let uploads = agent.uploads.clone();
    let server = tokio::spawn(async move { uploads.serve(listener).await });

    tracing::info!("agent ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");

    cancel.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "upload server failed"),
        Err(e) => tracing::error!(error = %e, "upload server task panicked"),
    }
    relay_dpu_proxy::set_default_proxy(None);

    Ok(())
}

/// Loads a table snapshot, or an empty table when none is configured.
async fn load_table(name: &str, path: Option<&Path>) -> anyhow::Result<Arc<MemoryTable>> {
    let Some(path) = path else {
        tracing::warn!(table = name, "no snapshot configured, DPU routing will find nothing");
        return Ok(Arc::new(MemoryTable::new()));
    };

    let table = MemoryTable::from_json_file(path)
        .await
        .with_context(|| format!("failed to load {name} table from {}", path.display()))?;
    tracing::info!(table = name, path = %path.display(), entries = table.len(), "table loaded");
    Ok(Arc::new(table))
}
