//! oinput relay server entry point.
//!
//! ```text
//! main()
//!  └─ load_config()            -- first CLI argument, or oinputserver.toml
//!  └─ InputServer::bind()      -- handshake listener
//!  └─ ServiceManager           -- setup, initialize, start
//!  └─ tick loop                -- Relay::tick() every tick_interval_ms
//!  └─ Ctrl-C                   -- stop, close clients, dispose
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use tokio::time::MissedTickBehavior;
use tracing::info;
use tracing_subscriber::EnvFilter;

use oinput_server::application::relay::Relay;
use oinput_server::application::service_manager::ServiceManager;
use oinput_server::infrastructure::network::{InputServer, InputServerConfig};
use oinput_server::infrastructure::storage::config::{load_config, DEFAULT_CONFIG_FILE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // `RUST_LOG` overrides the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    info!("oinput server starting ({})", config_path.display());

    let server = InputServer::bind(InputServerConfig::from(&config.server))
        .context("starting input server")?;

    let mut manager = ServiceManager::new(config.server.max_events);
    let added = manager.setup(&config.services);
    info!("{added} of {} configured services added", config.services.len());
    manager.initialize();
    manager.start();

    let mut relay = Relay::new(manager, server, config.server.show_stream_speed);

    let mut ticker = tokio::time::interval(config.server.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("oinput server ready.  Press Ctrl-C to exit.");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                relay.tick(Instant::now());
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    relay.shutdown();
    info!("oinput server stopped");
    Ok(())
}
