pub mod auth;
pub mod envelope;
pub mod idempotency;
pub mod models;
pub mod request_context;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;

pub use state::{AppState, WebConfig};

/// The full HTTP application, mounted under `/api/v1` and `/api`.
pub fn build_app(state: Arc<AppState>) -> Router {
    routes::build_router(state)
}

/// Serve the API until the listener fails.
pub async fn start_server(config: WebConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = build_app(state);

    let addr: SocketAddr = config.listen_addr.parse()?;
    tracing::info!("Starting API server on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
