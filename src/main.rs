//! Chat Gateway
//!
//! Sits in front of a streaming chat completion provider and decides, per
//! request, whether the conversation may go upstream.
//!
//! ```text
//!     Client POST
//!         │
//!         ▼
//!   ┌───────────┐   ┌────────────┐   ┌───────────┐   ┌──────────┐   ┌───────────┐
//!   │ identify  │──▶│ rate limit │──▶│ validate  │──▶│ moderate │──▶│ sanitize  │
//!   └───────────┘   └────────────┘   └───────────┘   └──────────┘   └─────┬─────┘
//!                                                                         │
//!                                                                         ▼
//!     Client SSE  ◀──── classify errors ◀──── stream chunks ◀──── upstream provider
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use chat_gateway::config::load_or_default;
use chat_gateway::lifecycle::signals::wait_for_signal;
use chat_gateway::lifecycle::{startup, Shutdown};
use chat_gateway::observability::{logging, metrics};
use chat_gateway::upstream::OpenAiProvider;

#[derive(Parser)]
#[command(name = "chat-gateway")]
#[command(about = "Request-safety gateway for a streaming chat endpoint", long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_or_default(args.config.as_deref())?;

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "chat-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        chat_path = %config.listener.chat_path,
        rate_limit = config.rate_limit.limit,
        window_ms = config.rate_limit.window_ms,
        moderation = config.moderation.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let provider = Arc::new(OpenAiProvider::from_config(&config.upstream, &config.timeouts)?);

    let shutdown = Shutdown::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    startup::run(config, provider, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
