use std::sync::Arc;

use server_warden::api;
use server_warden::config::{ManagerConfig, Settings};
use server_warden::services::ServerRegistry;
use server_warden::AppState;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env();
    info!("🚀 Server Warden v{}", env!("CARGO_PKG_VERSION"));

    // Invalid configuration is fatal
    let config = ManagerConfig::load(&settings.servers_config)?;
    let registry = Arc::new(ServerRegistry::from_config(config)?);
    info!("📦 Managing {} server(s): {:?}", registry.names().len(), registry.names());

    let started = registry.start_automatic();
    info!("▶️ Started {} server(s) automatically", started);

    let app = api::router(AppState {
        registry: registry.clone(),
    });

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("📡 Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("🛑 Shutting down supervised servers...");
    if !registry.shutdown().await {
        warn!("some servers did not stop cleanly, killing what's left");
        if !registry.teardown().await {
            error!("failed to tear down every server");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
