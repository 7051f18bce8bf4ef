use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fanout_events::ChannelSink;
use fanout_kernel::{Aggregator, demo_registry};
use fanout_protocol::{EventKind, SourceId, SourceRequest};
use tokio_stream::StreamExt;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "fanoutd")]
#[command(about = "Fan-out aggregator demo daemon")]
struct Cli {
    #[arg(long, default_value = "Explain fan-out and fan-in in one paragraph.")]
    prompt: String,
    /// Sources to query; defaults to every demo source.
    #[arg(long, value_delimiter = ',')]
    sources: Vec<String>,
    #[arg(long, default_value_t = fanout_runtime::DEFAULT_MAX_SOURCES)]
    pool_size: usize,
    #[arg(long, default_value_t = 45)]
    source_timeout_secs: u64,
    #[arg(long, default_value_t = 2_000)]
    cancel_grace_ms: u64,
    #[arg(long, default_value_t = fanout_runtime::DEFAULT_MAX_SOURCES)]
    max_sources: usize,
    /// Cancel the session after this many milliseconds.
    #[arg(long)]
    cancel_after_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .compact()
        .init();

    let cli = Cli::parse();

    let registry = demo_registry();
    let source_ids: Vec<SourceId> = if cli.sources.is_empty() {
        registry.ids().cloned().collect()
    } else {
        cli.sources.iter().map(|source| SourceId::from(source.as_str())).collect()
    };

    let aggregator = Aggregator::builder()
        .pool_size(cli.pool_size)
        .source_timeout(Duration::from_secs(cli.source_timeout_secs))
        .cancel_grace(Duration::from_millis(cli.cancel_grace_ms))
        .max_sources_per_request(cli.max_sources)
        .registry(registry)
        .build();

    let request = SourceRequest::new(cli.prompt, Vec::new());
    let capacity = aggregator.config().channel_capacity(source_ids.len());
    let (sink, mut events) = ChannelSink::new(capacity);
    let handle = aggregator
        .start(request, &source_ids, sink)
        .context("failed to start aggregation session")?;
    info!(request_id = %handle.request_id(), sources = source_ids.len(), "session created");

    if let Some(delay) = cli.cancel_after_ms {
        let canceller = handle.canceller();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if canceller.cancel() {
                warn!(after_ms = delay, "cancelling session");
            }
        });
    }

    while let Some(event) = events.next().await {
        let at_ms = event.emitted_at.as_millis() as u64;
        match &event.kind {
            EventKind::Started => {
                info!(source_id = %event.source_id, at_ms, "source.started");
            }
            EventKind::Fragment { text } => {
                info!(source_id = %event.source_id, sequence = event.sequence, at_ms, text = %text, "source.fragment");
            }
            EventKind::Completed => {
                info!(source_id = %event.source_id, sequence = event.sequence, at_ms, "source.completed");
            }
            EventKind::Failed { reason, message } => {
                warn!(
                    source_id = %event.source_id,
                    sequence = event.sequence,
                    at_ms,
                    reason = reason.as_str(),
                    message = %message,
                    "source.failed"
                );
            }
        }
    }

    let report = handle.join().await?;
    let rendered = serde_json::to_string_pretty(&report).context("failed to render session report")?;
    info!(
        completed = report.completed_count(),
        failed = report.failed_count(),
        elapsed_ms = report.elapsed_ms,
        "session report\n{rendered}"
    );

    Ok(())
}
