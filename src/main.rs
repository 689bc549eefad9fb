use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use camera_relay::capture::BackendSource;
use camera_relay::config::Config;
use camera_relay::gateway::ConfigGateway;
use camera_relay::handlers::{build_router, AppState};
use camera_relay::relay::StreamRelay;

#[derive(Parser, Debug)]
#[command(author, version, about = "Relays home camera RTSP feeds to browsers over WebSocket")]
struct Args {
    /// Path to the configuration file (TOML, or JSON by extension)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the listen address
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camera_relay=debug,info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(camera_relay::StreamError::Io { source }) => {
            warn!("Could not load {} ({}), using default configuration", args.config, source);
            Config::default()
        }
        Err(e) => return Err(anyhow::anyhow!("Invalid configuration in {}: {}", args.config, e)),
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    if config.cameras.is_empty() {
        warn!("No cameras configured, every stream request will return 404");
    }
    for name in config.cameras.keys() {
        info!("Camera '{}' available at /stream/ws/{}", name, name);
    }

    let relay = StreamRelay::new(Arc::new(BackendSource::new(&config.relay)), config.relay.clone());
    let state = AppState {
        relay: relay.clone(),
        gateway: Arc::new(ConfigGateway::new(config.cameras.clone())),
        server: Arc::new(config.server.clone()),
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    relay.shutdown();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
