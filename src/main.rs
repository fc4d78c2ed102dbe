use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::info;

use hypelink_relay::common::logger;
use hypelink_relay::common::types::AnyResult;
use hypelink_relay::config::Config;
use hypelink_relay::relay::lifecycle::LifecycleManager;
use hypelink_relay::server::AppState;
use hypelink_relay::transport;

#[tokio::main]
async fn main() -> AnyResult<()> {
    let config = Config::load()?;
    logger::init(&config);

    let (state, lifecycle_events) = AppState::new(config.clone());
    let state = Arc::new(state);

    let lifecycle = LifecycleManager::new(state.clone(), lifecycle_events);
    tokio::spawn(async move { lifecycle.run().await });

    let app = Router::new()
        .route(
            "/ws/driver",
            get(transport::websocket_server::driver_ws_handler),
        )
        .route(
            "/ws/dashboard",
            get(transport::websocket_server::dashboard_ws_handler),
        )
        .with_state(state.clone())
        .merge(transport::http_server::router(state.clone()))
        .layer(CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let address: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()?;
    info!("Hypelink relay listening on {}", address);

    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}
