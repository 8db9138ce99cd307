//! Axum server setup and router construction.

use std::net::SocketAddr;

use axum::Router;
use axum::routing::{get, post};
use chat_relay::relay::CompletionRelay;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::api::{self, AppState};

/// Build the full axum router around a relay.
pub fn build_router(relay: CompletionRelay) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(api::health))
        .route("/v1/chat/completions", post(api::post_chat_completions))
        .route("/v1/requests/{id}/cancel", post(api::post_cancel))
        .with_state(AppState { relay })
        .layer(cors)
}

/// Bind, start serving on a background task, and return the bound address.
pub async fn start_server(router: Router, bind_addr: SocketAddr) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("Relay server failed: {e}");
        }
    });

    Ok(addr)
}

/// Serve until `shutdown` is cancelled, then drain in-flight connections.
pub async fn serve(
    router: Router,
    bind_addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    info!("Relay listening on http://{addr}/v1");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("Relay server shut down");
    Ok(())
}
