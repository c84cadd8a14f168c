//! Processors and the worker pool they dispatch through.

pub mod pool;
pub mod queue;

pub use pool::{PoolError, WorkerPool};
pub use queue::{QueueMetrics, QueueProcessor, QueueProcessorConfig, QueueProcessorFactory, PROCESSOR_TYPE};
