//! Trace collector binary
//!
//! Runs the tenant pipelines described by a YAML config against the
//! in-process broker. `--generate` publishes random spans for every
//! configured tenant once the pipelines are up, which makes the binary
//! usable as a local smoke test.
//!
//! Run with: `cargo run --bin trace-collector -- --config crates/trace_collector/config/collector.yaml --generate 1000`

use anyhow::Context;
use clap::{Parser, ValueEnum};
use pipeline_core::{Collector, CollectorSettings, YamlConfigProvider};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trace_collector::{
    components, generator, JsonLinesTraceRepository, MemoryBroker, MemoryTraceRepository,
    TraceRepository,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "trace-collector")]
#[command(about = "Multi-tenant trace collector", long_about = None)]
struct Args {
    /// Path to the collector configuration
    #[arg(short, long, default_value = "collector.yaml")]
    config: PathBuf,

    /// Append stored spans to this JSON-lines file instead of keeping them in memory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Random spans to publish per tenant and topic after startup
    #[arg(long, default_value_t = 0)]
    generate: usize,

    /// Upper bound on spans per generated trace
    #[arg(long, default_value_t = 5)]
    spans_per_trace: usize,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_target(false)).init(),
    }
}

/// Publishes `spans` random spans for each tenant to each subscribed topic.
fn publish_generated(
    broker: &MemoryBroker,
    tenants: &[String],
    spans: usize,
    spans_per_trace: usize,
) -> anyhow::Result<usize> {
    let mut rng = rand::thread_rng();
    let mut messages = 0;
    for topic in broker.topics_with_consumers() {
        for tenant in tenants {
            let mut remaining = spans;
            while remaining > 0 {
                let count = remaining.min(spans_per_trace.max(1));
                let data = generator::trace_data(&mut rng, tenant, count);
                let body = serde_json::to_vec(&data).context("failed to encode trace data")?;
                broker.publish(&topic, body);
                remaining -= count;
                messages += 1;
            }
        }
    }
    Ok(messages)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting trace collector"
    );

    let broker = MemoryBroker::new();
    let memory = Arc::new(MemoryTraceRepository::new());
    let repository: Arc<dyn TraceRepository> = match &args.output {
        Some(path) => Arc::new(JsonLinesTraceRepository::new(path.clone())),
        None => memory.clone(),
    };

    let connector = broker.clone();
    let settings = CollectorSettings::new(move || {
        Ok(components(Arc::new(connector.clone()), Arc::clone(&repository))?)
    })
    .with_config_provider(Arc::new(YamlConfigProvider::from_file(args.config.clone())));

    let collector = Arc::new(Collector::new(settings)?);
    let mut handle = Arc::clone(&collector).run(CancellationToken::new());

    if !handle.ready().await {
        handle.wait().await.context("collector failed to start")?;
        return Ok(());
    }

    if args.generate > 0 {
        let tenants = collector.tenants().await;
        let messages = publish_generated(&broker, &tenants, args.generate, args.spans_per_trace)?;
        info!(messages, tenants = tenants.len(), "published generated traces");
    }

    handle.wait().await.context("collector stopped with errors")?;
    if args.output.is_none() {
        info!(spans = memory.span_count(), "spans stored in memory");
    }
    Ok(())
}
