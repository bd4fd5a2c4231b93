mod cli;
mod config;
mod handlers;
mod registry;
mod relay;
mod websocket;

use anyhow::Context;
use axum::{routing::get, Router};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    cli::Cli,
    config::Config,
    handlers::{get_session_status, health_check},
    websocket::{websocket_handler, SignalingState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO if RUST_LOG is not set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    let state = SignalingState::new();

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/sessions/:id", get(get_session_status))
        .route("/ws/:session_id", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("huddle-server listening on {addr}");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
