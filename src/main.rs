//! Relay binary: configuration from the environment, logs to stderr.

use cowrite::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    let server = RelayServer::new(config);

    log::info!("starting relay on {}", server.bind_addr());
    server.run().await
}
