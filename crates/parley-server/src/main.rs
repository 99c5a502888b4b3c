use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_server::media_store::DiskMediaStore;
use parley_server::presence::PresenceBroadcaster;
use parley_server::{api, AppState, ConnectionRegistry, ServerConfig};
use parley_store::{MessageStore, SqliteStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting parley server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store: Arc<dyn MessageStore> = Arc::new(SqliteStore::open(&config.database_path)?);
    info!(path = %config.database_path.display(), "Message store opened");

    let media = Arc::new(
        DiskMediaStore::new(
            config.media_storage_path.clone(),
            config.public_base_url.clone(),
            config.max_media_size,
        )
        .await?,
    );

    let registry = Arc::new(ConnectionRegistry::new());
    let http_addr = config.http_addr;
    let liveness_timeout = config.liveness_timeout;
    let sweep_interval = config.sweep_interval;

    let app_state = AppState::new(store, media, Arc::clone(&registry), config);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    PresenceBroadcaster::new(Arc::clone(&registry)).spawn();

    // Liveness sweep: evict connections that stopped sending anything.
    let reg = Arc::clone(&registry);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            let evicted = reg.evict_stale(Instant::now(), liveness_timeout);
            if !evicted.is_empty() {
                info!(count = evicted.len(), "Liveness sweep evicted connections");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    let closed = registry.shutdown();
    info!(closed, "Live connections closed");

    Ok(())
}
