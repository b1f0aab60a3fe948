use cellgraph_sync::server::{RelayConfig, RelayServer};
use log::info;

const ADDR_ENV: &str = "CELLGRAPH_RELAY_ADDR";

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args().nth(1).or_else(|| std::env::var(ADDR_ENV).ok()) {
        config.bind_addr = addr;
    }

    info!("Starting cellgraph relay on {}...", config.bind_addr);

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
