//! flowchat-replay: rebuild session trees from a recorded stream log
//!
//! Usage: `flowchat-replay <log.jsonl>`. Prints the sessions as JSON.

use flowchat::replay::{load_log, replay};
use flowchat::CoreConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowchat=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let Some(path) = std::env::args().nth(1) else {
        return Err("usage: flowchat-replay <log.jsonl>".into());
    };

    let config = CoreConfig::from_env();
    tracing::info!(path = %path, "Replaying log");
    let entries = load_log(&path)?;
    let sessions = replay(entries, config).await;

    println!("{}", serde_json::to_string_pretty(&sessions)?);
    Ok(())
}
