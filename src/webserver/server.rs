/// Axum webserver lifecycle: startup, serving, graceful shutdown
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::cors::CorsLayer;

use crate::configs::get_configs;
use crate::logger::{log, LogTag};
use crate::webserver::{routes, state::AppState};

/// Start the webserver; blocks until shutdown is signalled
pub async fn start_server(state: Arc<AppState>, shutdown: Arc<Notify>) -> Result<(), String> {
    let configs = get_configs();
    let addr: SocketAddr = format!("{}:{}", configs.webserver_host, configs.webserver_port)
        .parse()
        .map_err(|e| format!("Invalid bind address: {}", e))?;

    let app = build_app(state);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;

    log(
        LogTag::Webserver,
        "STARTUP",
        &format!("Listening on http://{}", addr),
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
            log(LogTag::Webserver, "SHUTDOWN", "Webserver stopping");
        })
        .await
        .map_err(|e| format!("Webserver error: {}", e))?;

    Ok(())
}

fn build_app(state: Arc<AppState>) -> Router {
    routes::create_router(state).layer(CorsLayer::permissive())
}
