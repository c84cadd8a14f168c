//! Message broker abstraction used by the broker receiver.
//!
//! A broker delivers opaque message bodies from a topic to the consumers of a
//! consumer group. Handler failures trigger redelivery until the message's
//! reconsume budget is spent.

mod memory;

pub use memory::MemoryBroker;

use async_trait::async_trait;
use pipeline_core::BoxError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// One delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub msg_id: String,
    pub body: Vec<u8>,
    /// How many times this message has been redelivered
    pub reconsume_times: u32,
}

/// Connection and delivery settings for one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub addr: Vec<String>,
    pub topic: String,
    pub consumer_group: String,
    /// Upper bound on a single handler invocation
    pub consume_timeout: Duration,
    pub max_reconsume_times: u32,
}

/// Broker errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("no handler registered for topic {0:?}")]
    NoHandler(String),
    #[error("consumer for topic {0:?} already started")]
    AlreadyStarted(String),
    #[error("consumer for topic {0:?} is closed")]
    Closed(String),
    #[error("failed to connect to {addr:?}: {reason}")]
    Connect { addr: Vec<String>, reason: String },
}

/// Processes delivered messages. An error requests redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: &Message) -> Result<(), BoxError>;
}

/// A subscription to one topic within a consumer group.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Must be called before [`start`](Self::start).
    fn register_handler(&self, handler: Arc<dyn MessageHandler>);

    async fn start(&self) -> Result<(), BrokerError>;

    /// Stops delivery after the in-flight message. Idempotent.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Creates consumers; shared by every receiver of a collector.
pub trait BrokerConnector: Send + Sync {
    fn new_consumer(&self, options: ConsumerOptions) -> Result<Arc<dyn BrokerConsumer>, BrokerError>;
}
