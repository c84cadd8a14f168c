//! Multi-tenant trace collector
//!
//! Concrete components for the pipeline model in `pipeline_core`:
//!
//! - `broker` receiver: consumes JSON-encoded [`TraceData`](pipeline_core::TraceData)
//!   messages from a topic, drops invalid spans and forwards the rest.
//! - `queue` processor: shards admission round-robin, coalesces batches per
//!   tenant, and dispatches them through a bounded worker pool.
//! - `olap` exporter: writes spans to a [`TraceRepository`], one insert per
//!   retention class, with retry and a per-insert timeout.
//!
//! # Example
//!
//! ```no_run
//! use pipeline_core::{Collector, CollectorSettings, YamlConfigProvider};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use trace_collector::{components, MemoryBroker, MemoryTraceRepository};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let broker = MemoryBroker::new();
//! let repository = Arc::new(MemoryTraceRepository::new());
//!
//! let settings = CollectorSettings::new(move || {
//!     Ok(components(Arc::new(broker.clone()), repository.clone())?)
//! })
//! .with_config_provider(Arc::new(YamlConfigProvider::from_file("collector.yaml")));
//!
//! let collector = Collector::new(settings)?;
//! collector.run_in_one(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod components;
pub mod exporter;
pub mod generator;
pub mod processor;
pub mod receiver;

// Re-export main types
pub use broker::{
    BrokerConnector, BrokerConsumer, BrokerError, ConsumerOptions, MemoryBroker, Message,
    MessageHandler,
};
pub use components::components;
pub use exporter::{
    InsertSpansParam, JsonLinesTraceRepository, MemoryTraceRepository, OlapExporterConfig,
    OlapExporterFactory, RepositoryError, RetryConfig, RetryingRepository, TraceExporter,
    TraceRepository,
};
pub use processor::{
    PoolError, QueueMetrics, QueueProcessor, QueueProcessorConfig, QueueProcessorFactory,
    WorkerPool,
};
pub use receiver::{BrokerReceiver, BrokerReceiverConfig, BrokerReceiverFactory, SpanMessageHandler};
