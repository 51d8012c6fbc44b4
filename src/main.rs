use axum::Router;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};

use story_relay::handlers::{active_session, health_check, list_consumers, ws_handler};
use story_relay::init::app_init;
use story_relay::AppState;

fn create_app_router(state: Arc<AppState>, static_dir: &Path) -> Router {
    Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/health", axum::routing::get(health_check))
        .route("/api/consumers", axum::routing::get(list_consumers))
        .route("/api/session", axum::routing::get(active_session))
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .route_service("/ghost", ServeFile::new(static_dir.join("ghost.html")))
        .fallback_service(ServeDir::new(static_dir))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("🛑 Shutting down...");
    state.coordinator.shutdown().await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("🚀 Starting story relay...");
    let (config, state) = app_init().await?;
    log::info!("✅ Application state initialized");

    if !config.static_dir.is_dir() {
        log::warn!("⚠️  Static directory {} not found, pages will 404", config.static_dir.display());
    }
    let app = create_app_router(state.clone(), &config.static_dir);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    log::info!("");
    log::info!("🎉 Server started!");
    log::info!("📍 http://{}", addr);
    log::info!("📡 Stream: ws://{}/ws", addr);
    log::info!("👻 Ghost: http://{}/ghost", addr);
    log::info!("❤️  Health: http://{}/health", addr);
    log::info!("");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}
