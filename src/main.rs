#![deny(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use agent_gateway::gateway::{AppState, GatewayConfig, routes};
use dotenv::dotenv;
use poem::{EndpointExt, Server, listener::TcpListener, middleware::Tracing};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let config = GatewayConfig::from_env();
    let addr = format!("0.0.0.0:{}", config.port);
    info!("Starting agent gateway on {}", addr);
    info!(
        "Heartbeat every {:?}, read deadline {:?}, terminals served at {}/ws/terminal/",
        config.heartbeat_interval, config.read_deadline, config.public_ws_base
    );

    let state = Arc::new(AppState::standalone(config));
    let app = routes(state).with(Tracing);

    Server::new(TcpListener::bind(addr))
        .name("Agent Gateway")
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown requested");
            },
            Some(Duration::from_secs(5)),
        )
        .await?;

    Ok(())
}
