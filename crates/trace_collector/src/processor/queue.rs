//! Sharded queue processor
//!
//! Absorbs bursts from the receivers, coalesces small batches per tenant and
//! hands the coalesced batches to the next consumer through a bounded
//! [`WorkerPool`].
//!
//! ```text
//!                 ┌─ shard 0: mpsc ─► worker ─► {tenant -> Traces} ─┐
//! consume_traces ─┼─ shard 1: mpsc ─► worker ─► {tenant -> Traces} ─┼─► pool ─► next
//!  (round robin)  └─ shard N: mpsc ─► worker ─► {tenant -> Traces} ─┘
//! ```
//!
//! A shard flushes when its pending span count reaches `maxBatchSize` or on
//! every tick with something pending. Admission blocks while the selected
//! shard's channel is full.

use async_trait::async_trait;
use crossbeam_utils::CachePadded;
use futures::FutureExt;
use pipeline_core::error::panic_message;
use pipeline_core::{
    BoxError, Component, ComponentConfig, ComponentError, ComponentId, ComponentType, Consumer,
    ConsumerError, CreateSettings, Factory, MultiError, Processor, ProcessorFactory, Traces,
    Validate, ValidationErrors,
};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::pool::WorkerPool;

pub const PROCESSOR_TYPE: &str = "queue";

/// Configuration for [`QueueProcessor`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct QueueProcessorConfig {
    pub pool_name: String,
    /// Batches dispatched concurrently
    pub max_pool_size: usize,
    /// Dispatches allowed to wait for the pool, 0 = unbounded
    pub max_blocking_tasks: usize,
    /// Capacity of each shard's inbound channel
    pub queue_size: usize,
    /// Pending spans that trigger a flush
    pub max_batch_size: usize,
    pub tick_interval_ms: u64,
    pub shard_count: usize,
}

impl Default for QueueProcessorConfig {
    fn default() -> Self {
        Self {
            pool_name: "trace_queue".to_string(),
            max_pool_size: 32,
            max_blocking_tasks: 0,
            queue_size: 1000,
            max_batch_size: 500,
            tick_interval_ms: 1000,
            shard_count: 4,
        }
    }
}

impl QueueProcessorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Validate for QueueProcessorConfig {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        errors.ensure(!self.pool_name.trim().is_empty(), "poolName must not be empty");
        errors.ensure(self.max_pool_size > 0, "maxPoolSize must be positive");
        errors.ensure(self.queue_size > 0, "queueSize must be positive");
        errors.ensure(self.max_batch_size > 0, "maxBatchSize must be positive");
        errors.ensure(self.tick_interval_ms > 0, "tickIntervalMs must be positive");
        errors.ensure(self.shard_count > 0, "shardCount must be positive");
        errors.into_result()
    }
}

/// Counters shared by all shards of one processor.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    spans_accepted: AtomicU64,
    spans_dispatched: AtomicU64,
    batches_dispatched: AtomicU64,
    dispatch_errors: AtomicU64,
    spans_dropped: AtomicU64,
    flushes: AtomicU64,
}

impl QueueMetrics {
    /// Spans admitted by `consume_traces`.
    pub fn spans_accepted(&self) -> u64 {
        self.spans_accepted.load(Ordering::Relaxed)
    }

    /// Spans the next consumer accepted.
    pub fn spans_dispatched(&self) -> u64 {
        self.spans_dispatched.load(Ordering::Relaxed)
    }

    pub fn batches_dispatched(&self) -> u64 {
        self.batches_dispatched.load(Ordering::Relaxed)
    }

    /// Batches the next consumer rejected or panicked on.
    pub fn dispatch_errors(&self) -> u64 {
        self.dispatch_errors.load(Ordering::Relaxed)
    }

    /// Spans lost because the pool refused the dispatch.
    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    fn record_accepted(&self, spans: u64) {
        self.spans_accepted.fetch_add(spans, Ordering::Relaxed);
    }

    fn record_dispatched(&self, spans: u64) {
        self.spans_dispatched.fetch_add(spans, Ordering::Relaxed);
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dispatch_error(&self) {
        self.dispatch_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self, spans: u64) {
        self.spans_dropped.fetch_add(spans, Ordering::Relaxed);
    }

    fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pending spans of one shard, keyed by tenant.
#[derive(Default)]
struct ShardState {
    pending: Mutex<HashMap<String, Traces>>,
    pending_spans: CachePadded<AtomicUsize>,
}

impl ShardState {
    /// Coalesces `traces` into its tenant's entry; returns the new pending count.
    fn append(&self, traces: Traces) -> usize {
        let spans = traces.span_count();
        if spans == 0 {
            return self.pending_spans();
        }
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.entry(traces.tenant.clone()) {
            Entry::Occupied(mut entry) => entry.get_mut().merge(traces),
            Entry::Vacant(entry) => {
                entry.insert(traces);
            }
        }
        self.pending_spans.fetch_add(spans, Ordering::Relaxed) + spans
    }

    fn pending_spans(&self) -> usize {
        self.pending_spans.load(Ordering::Relaxed)
    }
}

/// Hands flushed batches to the next consumer through the pool.
struct Dispatcher {
    id: ComponentId,
    next: Arc<dyn Consumer>,
    pool: WorkerPool,
    metrics: Arc<QueueMetrics>,
}

impl Dispatcher {
    /// Empties the shard, submitting one pool task per tenant.
    ///
    /// Runs under the shard lock so a tick and a size-triggered flush never
    /// interleave, and batches of a tenant enter the pool in flush order.
    fn flush(&self, shard: usize, state: &ShardState) {
        let mut pending = state.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let batches = std::mem::take(&mut *pending);
        state.pending_spans.store(0, Ordering::Relaxed);
        if batches.is_empty() {
            return;
        }
        self.metrics.record_flush();

        for (tenant, traces) in batches {
            let spans = traces.span_count() as u64;
            debug!(processor = %self.id, shard, tenant = %tenant, spans, "flushing batch");

            let next = Arc::clone(&self.next);
            let metrics = Arc::clone(&self.metrics);
            let id = self.id.clone();
            let task_tenant = tenant.clone();
            // detached from the caller: an accepted batch is always attempted
            let submitted = self.pool.submit(async move {
                let outcome = AssertUnwindSafe(next.consume_traces(traces))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => metrics.record_dispatched(spans),
                    Ok(Err(e)) => {
                        metrics.record_dispatch_error();
                        warn!(processor = %id, tenant = %task_tenant, spans, error = %e, "fail to consume traces");
                    }
                    Err(payload) => {
                        metrics.record_dispatch_error();
                        error!(
                            processor = %id,
                            tenant = %task_tenant,
                            panic = %panic_message(&*payload),
                            "recovered panic while consuming traces"
                        );
                    }
                }
            });

            if let Err(e) = submitted {
                self.metrics.record_dropped(spans);
                error!(processor = %self.id, shard, tenant = %tenant, spans, error = %e, "fail to submit task");
            }
        }
    }
}

struct Shard {
    index: usize,
    sender: mpsc::Sender<Traces>,
    receiver: Mutex<Option<mpsc::Receiver<Traces>>>,
    state: Arc<ShardState>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    shutdown_rx: Mutex<Option<oneshot::Receiver<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shard {
    fn new(index: usize, queue_size: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        Self {
            index,
            sender,
            receiver: Mutex::new(Some(receiver)),
            state: Arc::new(ShardState::default()),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker unless it already runs.
    fn spawn_worker(&self, dispatcher: &Arc<Dispatcher>, max_batch_size: usize, tick: Duration) {
        let receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner).take();
        let shutdown = self.shutdown_rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let (Some(receiver), Some(shutdown)) = (receiver, shutdown) else {
            return;
        };

        let worker = tokio::spawn(run_shard(
            self.index,
            receiver,
            shutdown,
            Arc::clone(&self.state),
            Arc::clone(dispatcher),
            max_batch_size,
            tick,
        ));
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
    }

    /// Stops the worker, drains the channel and flushes what is left.
    async fn drain(&self, dispatcher: &Dispatcher) -> Result<(), BoxError> {
        let signal = self.shutdown_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(signal) = signal {
            // the worker may already be gone
            let _ = signal.send(());
        }

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        let mut result = Ok(());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                result = Err(format!("shard {} worker failed: {e}", self.index).into());
            }
        } else {
            // never started; drain whatever was admitted
            let receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(mut receiver) = receiver {
                receiver.close();
                while let Ok(traces) = receiver.try_recv() {
                    self.state.append(traces);
                }
            }
        }

        dispatcher.flush(self.index, &self.state);
        result
    }
}

async fn run_shard(
    index: usize,
    mut receiver: mpsc::Receiver<Traces>,
    mut shutdown: oneshot::Receiver<()>,
    state: Arc<ShardState>,
    dispatcher: Arc<Dispatcher>,
    max_batch_size: usize,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                receiver.close();
                while let Some(traces) = receiver.recv().await {
                    state.append(traces);
                }
                break;
            }
            _ = ticker.tick() => {
                if state.pending_spans() > 0 {
                    dispatcher.flush(index, &state);
                }
            }
            received = receiver.recv() => {
                let Some(traces) = received else {
                    break;
                };
                if state.append(traces) >= max_batch_size {
                    dispatcher.flush(index, &state);
                }
            }
        }
    }
    debug!(processor = %dispatcher.id, shard = index, "shard worker stopped");
}

/// Coalesces traces per tenant across a fixed set of shards and dispatches
/// them to the next consumer with bounded parallelism.
pub struct QueueProcessor {
    id: ComponentId,
    tenant: String,
    config: QueueProcessorConfig,
    shards: Vec<Arc<Shard>>,
    cursor: CachePadded<AtomicUsize>,
    dispatcher: Arc<Dispatcher>,
    closed: AtomicBool,
}

impl QueueProcessor {
    /// Fails when `config` does not validate.
    pub fn new(
        settings: &CreateSettings,
        config: QueueProcessorConfig,
        next: Arc<dyn Consumer>,
    ) -> Result<Self, ComponentError> {
        config
            .validate()
            .map_err(|e| ComponentError::invalid_config(&settings.id, e))?;
        let shards = (0..config.shard_count)
            .map(|index| Arc::new(Shard::new(index, config.queue_size)))
            .collect();
        let dispatcher = Arc::new(Dispatcher {
            id: settings.id.clone(),
            next,
            pool: WorkerPool::new(
                config.pool_name.clone(),
                config.max_pool_size,
                config.max_blocking_tasks,
            ),
            metrics: Arc::new(QueueMetrics::default()),
        });
        Ok(Self {
            id: settings.id.clone(),
            tenant: settings.tenant.clone(),
            config,
            shards,
            cursor: CachePadded::new(AtomicUsize::new(0)),
            dispatcher,
            closed: AtomicBool::new(false),
        })
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.dispatcher.metrics
    }

    /// Spans waiting in shard maps, not counting those still in channels.
    pub fn pending_spans(&self) -> usize {
        self.shards.iter().map(|s| s.state.pending_spans()).sum()
    }

    /// Pending spans of each shard, in shard order.
    pub fn shard_pending_spans(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.state.pending_spans()).collect()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[async_trait]
impl Consumer for QueueProcessor {
    async fn consume_traces(&self, traces: Traces) -> Result<(), ConsumerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConsumerError::Closed);
        }
        let spans = traces.span_count();
        if spans == 0 {
            return Ok(());
        }

        let shard = &self.shards[self.cursor.fetch_add(1, Ordering::Relaxed) % self.shards.len()];
        shard
            .sender
            .send(traces)
            .await
            .map_err(|_| ConsumerError::Closed)?;
        self.dispatcher.metrics.record_accepted(spans as u64);
        Ok(())
    }
}

#[async_trait]
impl Component for QueueProcessor {
    async fn start(&self) -> Result<(), ComponentError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ComponentError::failed(&self.id, "processor is shut down"));
        }
        for shard in &self.shards {
            shard.spawn_worker(
                &self.dispatcher,
                self.config.max_batch_size,
                self.config.tick_interval(),
            );
        }
        info!(
            processor = %self.id,
            tenant = %self.tenant,
            shards = self.shards.len(),
            pool = %self.dispatcher.pool.name(),
            "queue processor started"
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut drains = JoinSet::new();
        for shard in &self.shards {
            let shard = Arc::clone(shard);
            let dispatcher = Arc::clone(&self.dispatcher);
            drains.spawn(async move {
                let index = shard.index;
                let outcome = AssertUnwindSafe(shard.drain(&dispatcher)).catch_unwind().await;
                (index, outcome)
            });
        }

        let mut errors = MultiError::new();
        while let Some(joined) = drains.join_next().await {
            match joined {
                Ok((_, Ok(Ok(())))) => {}
                Ok((index, Ok(Err(e)))) => {
                    error!(processor = %self.id, shard = index, error = %e, "shard shutdown failed");
                    errors.push(e);
                }
                Ok((index, Err(payload))) => {
                    let panic = panic_message(&*payload);
                    error!(processor = %self.id, shard = index, panic = %panic, "recovered panic in shard shutdown");
                    errors.push(format!("shard {index} panicked during shutdown: {panic}"));
                }
                Err(e) => errors.push(e),
            }
        }

        self.dispatcher.pool.stop_and_wait().await;
        let metrics = self.metrics();
        info!(
            processor = %self.id,
            tenant = %self.tenant,
            accepted = metrics.spans_accepted(),
            dispatched = metrics.spans_dispatched(),
            dropped = metrics.spans_dropped(),
            "queue processor stopped"
        );
        errors.into_result().map_err(ComponentError::from)
    }
}

impl Processor for QueueProcessor {}

/// Builds [`QueueProcessor`]s.
#[derive(Debug, Default)]
pub struct QueueProcessorFactory;

impl QueueProcessorFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Factory for QueueProcessorFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static(PROCESSOR_TYPE)
    }

    fn create_default_config(&self) -> Arc<dyn ComponentConfig> {
        Arc::new(QueueProcessorConfig::default())
    }
}

impl ProcessorFactory for QueueProcessorFactory {
    fn create_traces_processor(
        &self,
        settings: &CreateSettings,
        config: &dyn ComponentConfig,
        next: Arc<dyn Consumer>,
    ) -> Result<Arc<dyn Processor>, ComponentError> {
        let config = config
            .downcast_ref::<QueueProcessorConfig>()
            .ok_or_else(|| ComponentError::ConfigType {
                id: settings.id.clone(),
                expected: "QueueProcessorConfig",
            })?;
        Ok(Arc::new(QueueProcessor::new(settings, config.clone(), next)?))
    }
}
