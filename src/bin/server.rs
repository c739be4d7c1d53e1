use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

use chatty_realtime::config::ServerConfig;
use chatty_realtime::core::router::Router;
use chatty_realtime::handlers::routes;

#[tokio::main]
async fn main() {
    // Initialize env
    let dotenv_result = dotenvy::dotenv();

    // Initialize logging
    env_logger::init();

    match dotenv_result {
        Ok(path) => info!("Environment variables loaded from {}", path.display()),
        Err(e) => warn!("Failed to load .env file: {}", e),
    }

    // Load config from the environment
    let config = match ServerConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration: host={}, port={}, send_buffer={}, write_wait={:?}, ping_period={:?}",
        config.host, config.port, config.send_buffer, config.write_wait, config.ping_period
    );

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    let router = Arc::new(Router::with_shutdown_wait(config.write_wait));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
    };

    let (bound, server) = match warp::serve(routes(router.clone(), config.clone()))
        .try_bind_with_graceful_shutdown(addr, shutdown)
    {
        Ok(bound) => bound,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Starting Chatty Realtime server on {}", bound);
    server.await;

    router.close().await;
    info!("Server stopped");
}
