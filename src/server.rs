use std::path::Path;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::engine::Str0mEngine;
use crate::supervisor::Supervisor;
use crate::transport::WebSocketTransport;
use crate::util::{select_host_address, shutdown_signal};

/// Path of the signaling WebSocket endpoint.
pub const SIGNALING_PATH: &str = "/signaling";

/// Signaling endpoint plus static files for every other path.
pub fn router(supervisor: Supervisor, static_dir: &Path) -> Router {
    Router::new()
        .route(SIGNALING_PATH, any(signaling))
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

async fn signaling(
    State(supervisor): State<Supervisor>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!("Rejecting non-upgrade request: {}", rejection);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    upgrade.on_upgrade(move |socket| async move {
        if let Err(e) = supervisor.accept(WebSocketTransport::new(socket)).await {
            warn!("Could not start session: {}", e);
        }
    })
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let host_addr = match config.host_addr {
        Some(addr) => addr,
        None => select_host_address()?,
    };
    info!("Media host address: {}", host_addr);

    let engine = Arc::new(Str0mEngine::new(host_addr));
    let supervisor = Supervisor::new(engine, config.session_options());

    let shutdown = supervisor.cancellation_token();
    shutdown_signal(shutdown.clone());

    let listener = TcpListener::bind(config.bind).await?;
    let addr = listener.local_addr()?;
    info!(
        "Connect a browser to http://{}:{} (signaling on {})",
        host_addr,
        addr.port(),
        SIGNALING_PATH
    );

    let app = router(supervisor.clone(), &config.static_dir);
    let graceful = shutdown.clone();
    let serve = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await
    };
    let drain = async {
        shutdown.cancelled().await;
        supervisor.shutdown().await
    };

    let (served, closed) = tokio::join!(serve, drain);
    info!("Closed {} sessions on shutdown", closed);
    served?;
    Ok(())
}
