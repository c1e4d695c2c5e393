use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};

use switchboard_core::{ChatMessage, RequestContext};
use switchboard_engine::{GatewayConfig, Orchestrator};
use switchboard_telemetry::{init_telemetry, TelemetryConfig};

/// Send one streaming chat completion through the gateway and print the
/// normalized events as JSON lines.
#[derive(Parser)]
#[command(name = "switchboard", version)]
struct Cli {
    /// Gateway config file (providers and accounts).
    #[arg(long, short)]
    config: PathBuf,

    #[arg(long, short)]
    provider: String,

    #[arg(long, short)]
    model: String,

    /// Optional system prompt.
    #[arg(long)]
    system: Option<String>,

    #[arg(long)]
    max_tokens: Option<u32>,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,

    /// Print the metrics snapshot to stderr when done.
    #[arg(long)]
    metrics: bool,

    prompt: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: cli.json_logs,
        ..Default::default()
    });

    let config = GatewayConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let transport = config
        .http_transport()
        .context("building HTTP transport")?;

    let mut orchestrator = Orchestrator::new(Arc::new(config.build_registry()), Arc::new(transport))
        .with_metrics(telemetry.metrics());
    for (provider, route) in config.routes() {
        orchestrator = orchestrator.with_route(provider, route);
    }

    let mut messages = Vec::new();
    if let Some(system) = cli.system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(cli.prompt));
    let mut request = RequestContext::new(cli.provider, cli.model).with_messages(messages);
    if let Some(max_tokens) = cli.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }

    let cancel = request.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling request");
            cancel.cancel();
        }
    });

    let result = orchestrator
        .handle_request(&request, |event| match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
        })
        .await;

    if cli.metrics {
        for sample in telemetry.metrics().snapshot() {
            eprintln!("{} {:?} {}", sample.name, sample.labels, sample.value);
        }
    }

    let outcome = result?;
    info!(
        account = %outcome.account_id,
        attempts = outcome.attempts,
        failed_over = outcome.failed_over,
        "request complete"
    );
    Ok(())
}
