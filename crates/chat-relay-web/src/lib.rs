//! HTTP front end for `chat-relay`.
//!
//! `chat-relay-web` exposes a [`CompletionRelay`] over an OpenAI-compatible
//! REST surface, adding cancellation by request id:
//!
//! | Route | Description |
//! |-------|-------------|
//! | `POST /v1/chat/completions` | Forward a request. `"stream": true` answers with SSE. The optional `x-request-id` header registers the call for cancellation. |
//! | `POST /v1/requests/{id}/cancel` | Cancel an in-flight request. Answers `{"cancelled": bool}`. |
//! | `GET /health` | Liveness probe. |
//!
//! Failures are returned as `{"detail": "<message>"}` with the classified
//! status (499 for cancellation). A stream that fails after it has started
//! ends with one `data: {"error": {...}}` frame instead of `data: [DONE]`.
//!
//! # Quick start
//!
//! ```ignore
//! use chat_relay::prelude::*;
//! use chat_relay_web::{WebConfig, spawn_web};
//!
//! let relay = CompletionRelay::from_config(&RelayConfig::from_env()?)?;
//! let addr = spawn_web(relay, WebConfig::default()).await?;
//! println!("Relay: http://{addr}/v1");
//! ```

mod api;
mod server;

pub use api::{CancelResponse, REQUEST_ID_HEADER};
pub use server::{build_router, serve, start_server};

use std::net::SocketAddr;

use chat_relay::relay::CompletionRelay;

/// Configuration for the web server.
pub struct WebConfig {
    /// Address to bind to. Default: `127.0.0.1:8082`.
    pub bind_addr: SocketAddr,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8082)),
        }
    }
}

/// Spawn the web server on a Tokio task and return the bound address.
///
/// The server runs until the Tokio runtime shuts down.
pub async fn spawn_web(relay: CompletionRelay, config: WebConfig) -> std::io::Result<SocketAddr> {
    let router = build_router(relay);
    start_server(router, config.bind_addr).await
}
