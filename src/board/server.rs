use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::engine::Board;
use super::ws;
use crate::config::BoardConfig;

/// Build the full application router: REST API plus the `/ws` event stream.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Start the board and serve it until Ctrl+C, then shut the board down.
pub async fn start_server(config: BoardConfig) -> Result<()> {
    let port = config.port();
    let cors = config.toml.server.cors;

    let (board, engine) = Board::new(config).start();
    let state = Arc::new(AppState {
        board: board.clone(),
    });

    let mut app = build_router(state);
    if cors {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if cors { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "agentboard listening");
    println!("agentboard running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    board.shutdown().await.context("Failed to shut down board")?;
    engine.await.context("Board engine panicked")?;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
