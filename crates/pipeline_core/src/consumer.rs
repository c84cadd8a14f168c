use async_trait::async_trait;
use thiserror::Error;

use crate::component_id::ComponentId;
use crate::error::BoxError;
use crate::pdata::Traces;

/// Error types for trace delivery
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The consumer has been shut down and accepts no more data
    #[error("consumer is shut down")]
    Closed,
    /// A downstream branch of a fan-out failed
    #[error("downstream {id} failed: {source}")]
    Downstream {
        id: ComponentId,
        #[source]
        source: Box<ConsumerError>,
    },
    /// The sink behind the consumer failed
    #[error(transparent)]
    Sink(BoxError),
}

impl ConsumerError {
    pub fn sink(error: impl Into<BoxError>) -> Self {
        Self::Sink(error.into())
    }
}

/// Anything that accepts trace batches.
///
/// Processors, the fan-out and exporters implement this; receivers push into it.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume_traces(&self, traces: Traces) -> Result<(), ConsumerError>;
}
