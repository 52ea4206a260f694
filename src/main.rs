// lode-pool: multi-coin Stratum mining pool core.
//
// Bring-up order: config, daemon client, family handler, pool. The job
// manager gates the daemon first; the stratum server starts serving after.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use lode_pool::bus::MessageBus;
use lode_pool::config::PoolConfig;
use lode_pool::daemon::DaemonClient;
use lode_pool::family::sha256d::Sha256dFamily;
use lode_pool::family::PoolHandler;
use lode_pool::pool::Pool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LODE_POOL_CONFIG").ok())
        .unwrap_or_else(|| "pool_config.json".to_string());
    let config = Arc::new(PoolConfig::load(&config_path).context("loading pool config")?);
    tracing::info!(
        pool = %config.id,
        daemons = config.daemons.len(),
        endpoints = config.endpoints.len(),
        "configuration loaded from {}", config_path
    );

    let daemon = Arc::new(DaemonClient::new(&config.daemons).context("building daemon client")?);
    let handler: Arc<dyn PoolHandler> = Arc::new(
        Sha256dFamily::new(&config.pool_script_hex).context("building pool family")?,
    );
    let bus = Arc::new(MessageBus::new());

    // Drain the bus so events are observable in logs even without
    // out-of-core consumers attached.
    let mut bus_rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = bus_rx.recv().await {
            tracing::trace!(?event, "bus event");
        }
    });

    let pool = Pool::new(config, daemon, handler, bus);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    pool.run(shutdown).await
}
