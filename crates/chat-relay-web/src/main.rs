//! Run the relay as an OpenAI-compatible HTTP service.
//!
//! # Usage
//!
//! ```bash
//! OPENAI_API_KEY=sk-... cargo run -p chat-relay-web
//! OPENAI_API_KEY=sk-... cargo run -p chat-relay-web -- --port 9000
//! ```
//!
//! Then point an OpenAI client at `http://127.0.0.1:8082/v1`. To cancel a
//! request, send it with an `x-request-id` header and
//! `POST /v1/requests/<id>/cancel` from anywhere.

use std::net::SocketAddr;
use std::path::PathBuf;

use chat_relay::config::RelayConfig;
use chat_relay::relay::CompletionRelay;
use chat_relay_web::{build_router, serve};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Cancellable chat-completion relay server.
#[derive(Parser)]
#[command(about = "OpenAI-compatible relay with cancellation by request id")]
struct Args {
    /// Interface to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8082)]
    port: u16,

    /// Upstream base URL (overrides OPENAI_BASE_URL).
    #[arg(long)]
    base_url: Option<String>,

    /// Usage ledger path (overrides USAGE_STATS_PATH).
    #[arg(long)]
    usage_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = RelayConfig::from_env().map_err(|e| e.to_string())?;
    if let Some(base_url) = args.base_url {
        config = config.with_base_url(base_url);
    }
    if let Some(path) = args.usage_file {
        config = config.with_usage_stats_path(path);
    }
    let relay = CompletionRelay::from_config(&config).map_err(|e| e.to_string())?;

    let bind_addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .map_err(|e| format!("invalid bind address: {e}"))?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            trigger.cancel();
        }
    });

    serve(build_router(relay), bind_addr, shutdown)
        .await
        .map_err(|e| format!("server error: {e}"))
}
