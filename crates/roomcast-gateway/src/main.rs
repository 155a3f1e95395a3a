//! roomcast gateway binary.
//!
//! - WebSocket endpoint: /v1/ws?conversation_id=...
//! - Config path from `ROOMCAST_CONFIG` (default `roomcast.yaml`)
//! - Ctrl-C / SIGTERM: mark draining, stop accepting, let sessions close

use std::net::SocketAddr;

use tokio::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use roomcast_gateway::{app_state::AppState, broker, config, router};

const DEFAULT_CONFIG_PATH: &str = "roomcast.yaml";
/// Time for writers to flush close frames after the hub stops.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::var("ROOMCAST_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = config::load_from_file(&path)?;
    let listen: SocketAddr = cfg.gateway.listen.parse()?;

    let broker = broker::connect(&cfg.broker).await?;
    tracing::info!(backend = ?cfg.broker.backend, prefix = %cfg.broker.topic_prefix, "broker connected");

    let state = AppState::new(cfg, broker)?;
    let app = router::build_router(state.clone());

    tracing::info!(%listen, instance = %state.instance_id(), config = %path, "roomcast-gateway starting");
    let listener = tokio::net::TcpListener::bind(listen).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    // Last strong hub handle: dropping it stops the registry, which closes
    // every outbox so sessions send close frames.
    drop(state);
    tokio::time::sleep(CLOSE_GRACE).await;
    tracing::info!("roomcast-gateway stopped");
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    state.set_draining();
    tracing::info!("shutdown requested, draining");
}
