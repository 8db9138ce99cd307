//! Send a chat-completion request through the relay and print the response.
//!
//! Reads the API key from the `OPENAI_API_KEY` environment variable; see
//! [`RelayConfig::from_env`](chat_relay::config::RelayConfig::from_env) for
//! the other variables. Logs go to stderr (`RUST_LOG` controls the level).
//!
//! # Examples
//!
//! ```sh
//! # Basic request
//! chat-relay --user "Summarize this paragraph"
//!
//! # Streamed, with a system prompt
//! chat-relay --system "You are terse." --user "Explain SSE." --stream
//!
//! # Cancel after two seconds (exits with status 499 reported)
//! chat-relay --user "Write a long essay" --stream --cancel-after-ms 2000
//!
//! # Azure OpenAI deployment
//! chat-relay --base-url https://res.openai.azure.com --api-version 2024-06-01 \
//!   --model my-deployment --user "hi"
//! ```

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use chat_relay::config::RelayConfig;
use chat_relay::relay::{CompletionRelay, DONE_EVENT, generate_request_id};
use chat_relay::{ChatRequest, Message, RelayError, chunk_delta_text, completion_text};
use clap::Parser;
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

/// Send a chat-completion request through the cancellable relay.
///
/// Reads the API key from the OPENAI_API_KEY environment variable.
#[derive(Parser)]
#[command(name = "chat-relay")]
struct Cli {
    // ── Message content ────────────────────────────────────────
    /// System prompt to set the assistant's behavior
    #[arg(long)]
    system: Option<String>,

    /// User message to send
    #[arg(long)]
    user: Option<String>,

    /// Read user content from stdin
    #[arg(long)]
    stdin: bool,

    // ── Model and sampling ─────────────────────────────────────
    /// Model (or Azure deployment) to use
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Maximum tokens in the response
    #[arg(long)]
    max_tokens: Option<u32>,

    // ── Relay behavior ─────────────────────────────────────────
    /// Stream the response chunk by chunk
    #[arg(long)]
    stream: bool,

    /// Request id to register for cancellation
    #[arg(long)]
    request_id: Option<String>,

    /// Cancel the request after this many milliseconds
    #[arg(long)]
    cancel_after_ms: Option<u64>,

    // ── Endpoint overrides ─────────────────────────────────────
    /// Upstream base URL (overrides OPENAI_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// Azure API version (overrides AZURE_API_VERSION, selects Azure)
    #[arg(long)]
    api_version: Option<String>,

    /// Upstream timeout in seconds (overrides REQUEST_TIMEOUT)
    #[arg(long)]
    timeout: Option<u64>,

    /// Usage ledger path (overrides USAGE_STATS_PATH)
    #[arg(long)]
    usage_file: Option<PathBuf>,

    // ── Output mode ────────────────────────────────────────────
    /// Print the full JSON response (or raw SSE events when streaming)
    #[arg(long)]
    raw: bool,
}

// ── Helpers ────────────────────────────────────────────────────────

fn build_user_content(cli: &Cli) -> Result<String, String> {
    let stdin_text = if cli.stdin {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("failed to read stdin: {e}"))?;
        Some(buf)
    } else {
        None
    };

    match (&cli.user, stdin_text) {
        (Some(msg), Some(piped)) => Ok(format!("{msg}\n\n{piped}")),
        (Some(msg), None) => Ok(msg.clone()),
        (None, Some(piped)) => Ok(piped),
        (None, None) => Err("provide --user, --stdin, or both".to_string()),
    }
}

fn build_config(cli: &Cli) -> Result<RelayConfig, String> {
    let mut config = RelayConfig::from_env().map_err(|e| e.to_string())?;
    if let Some(base_url) = &cli.base_url {
        config = config.with_base_url(base_url);
    }
    if let Some(version) = &cli.api_version {
        config = config.with_api_version(version);
    }
    if let Some(secs) = cli.timeout {
        config = config.with_timeout(Duration::from_secs(secs));
    }
    if let Some(path) = &cli.usage_file {
        config = config.with_usage_stats_path(path);
    }
    Ok(config)
}

fn build_request(cli: &Cli, user_content: String) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(sys) = &cli.system {
        messages.push(Message::system(sys));
    }
    messages.push(Message::user(user_content));

    let mut request = ChatRequest::new(&cli.model).with_messages(&messages);
    if let Some(t) = cli.temperature {
        request = request.with("temperature", t);
    }
    if let Some(max) = cli.max_tokens {
        request = request.with("max_tokens", max);
    }
    request
}

enum Failure {
    Usage(String),
    Relay(RelayError),
}

/// Write one streamed text fragment and flush it so it shows up immediately.
fn write_delta(out: &mut impl Write, text: &str) -> Result<(), Failure> {
    out.write_all(text.as_bytes())
        .and_then(|()| out.flush())
        .map_err(|e| Failure::Usage(format!("failed to write output: {e}")))
}

async fn run(cli: &Cli) -> Result<(), Failure> {
    let user_content = build_user_content(cli).map_err(Failure::Usage)?;
    let config = build_config(cli).map_err(Failure::Usage)?;
    let relay = CompletionRelay::from_config(&config).map_err(|e| Failure::Usage(e.to_string()))?;
    let request = build_request(cli, user_content);

    // A cancel timer needs an id to target.
    let request_id = match (&cli.request_id, cli.cancel_after_ms) {
        (Some(id), _) => Some(id.clone()),
        (None, Some(_)) => Some(generate_request_id()),
        (None, None) => None,
    };

    if let (Some(ms), Some(id)) = (cli.cancel_after_ms, request_id.clone()) {
        let relay = relay.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            relay.cancel_request(&id);
        });
    }

    if cli.stream {
        let mut events = relay.create_chat_completion_stream(request, request_id.as_deref());
        let mut stdout = io::stdout();
        while let Some(event) = events.next().await {
            let event = event.map_err(Failure::Relay)?;
            if cli.raw {
                println!("{event}\n");
                continue;
            }
            if event == DONE_EVENT {
                println!();
                break;
            }
            let chunk: serde_json::Value = event
                .strip_prefix("data: ")
                .and_then(|payload| serde_json::from_str(payload).ok())
                .unwrap_or_default();
            if let Some(text) = chunk_delta_text(&chunk) {
                write_delta(&mut stdout, text)?;
            }
        }
        return Ok(());
    }

    let completion = relay
        .create_chat_completion(request, request_id.as_deref())
        .await
        .map_err(Failure::Relay)?;
    if cli.raw {
        let pretty = serde_json::to_string_pretty(&completion)
            .map_err(|e| Failure::Usage(format!("failed to format response: {e}")))?;
        println!("{pretty}");
    } else {
        println!("{}", completion_text(&completion).unwrap_or_default());
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli).await {
        Ok(()) => {}
        Err(Failure::Usage(msg)) => {
            eprintln!("Error: {msg}");
            process::exit(2);
        }
        Err(Failure::Relay(err)) => {
            eprintln!("Error ({}): {err}", err.status_code());
            process::exit(1);
        }
    }
}
