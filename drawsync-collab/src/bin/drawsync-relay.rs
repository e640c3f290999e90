//! drawsync relay: forwards encrypted room traffic between peers.
//!
//! Configured from the environment: `DRAWSYNC_RELAY_ADDR` for the bind
//! address, `RUST_LOG` for log filtering.

use log::info;

use drawsync_collab::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = RelayConfig::from_env();
    info!("Starting drawsync relay on {}...", config.bind_addr);

    let server = RelayServer::new(config);
    server.run().await?;
    Ok(())
}
