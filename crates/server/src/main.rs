//! Voice Gateway entry point

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use voice_gateway_config::{load_config, GatewayConfig};
use voice_gateway_server::{create_router, AppState, ProviderSet};
use voice_gateway_tools::global_registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from).or_else(|| {
        let default = PathBuf::from("config.yaml");
        default.exists().then_some(default)
    });
    let config = match config_path.as_deref() {
        Some(path) => load_config(Some(path))?,
        None => {
            tracing::warn!("no configuration file, running with defaults");
            GatewayConfig::default()
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        "starting voice gateway"
    );

    // Concrete speech/model providers are deployment-specific; the
    // placeholders keep the gateway serving until they are injected here.
    let providers = ProviderSet::placeholders();

    let bind_addr: SocketAddr = {
        let cfg = &config.server;
        format!("{}:{}", cfg.ip, cfg.port).parse()?
    };
    let broker_enabled = config.broker.enabled;

    let mut state = AppState::build(config, config_path, providers).await;

    // Plugin registration window closes before the first connection.
    global_registry().seal();
    tracing::info!(tools = global_registry().len(), "tool registry sealed");

    if broker_enabled {
        let udp = voice_gateway_server::broker::start_broker(state.clone()).await?;
        state = state.with_udp(udp);
    }

    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await?;

    tracing::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
    if let Some(pool) = state.asr_pool.as_ref() {
        pool.shutdown().await;
    }
}
