use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{BrokerConnector, BrokerConsumer, BrokerError, ConsumerOptions, Message, MessageHandler};

type Queue = (async_channel::Sender<Message>, async_channel::Receiver<Message>);

#[derive(Default)]
struct Topics {
    /// topic -> consumer group -> queue
    groups: HashMap<String, HashMap<String, Queue>>,
}

/// In-process broker.
///
/// Every consumer group of a topic gets its own unbounded queue; consumers in
/// the same group compete for messages. Queues exist from the moment a
/// consumer is created, so messages published before `start` are kept.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    topics: Arc<Mutex<Topics>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, Topics> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes `body` to every consumer group of `topic`.
    /// Returns the number of groups it was delivered to.
    pub fn publish(&self, topic: &str, body: Vec<u8>) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let topics = self.topics();
        let Some(groups) = topics.groups.get(topic) else {
            debug!(topic, "no consumer group subscribed, message dropped");
            return 0;
        };

        let message = Message {
            topic: topic.to_string(),
            msg_id: format!("{id:016x}"),
            body,
            reconsume_times: 0,
        };
        groups
            .values()
            .filter(|(tx, _)| tx.try_send(message.clone()).is_ok())
            .count()
    }

    /// Topics with at least one consumer group.
    pub fn topics_with_consumers(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.topics().groups.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Messages waiting in a group's queue.
    pub fn pending(&self, topic: &str, group: &str) -> usize {
        self.topics()
            .groups
            .get(topic)
            .and_then(|groups| groups.get(group))
            .map_or(0, |(_, rx)| rx.len())
    }

    fn queue(&self, topic: &str, group: &str) -> Queue {
        let mut topics = self.topics();
        topics
            .groups
            .entry(topic.to_string())
            .or_default()
            .entry(group.to_string())
            .or_insert_with(async_channel::unbounded)
            .clone()
    }
}

/// `memory` or `memory://<anything>`
fn is_memory_addr(addr: &str) -> bool {
    let addr = addr.trim();
    addr == "memory" || addr.starts_with("memory://")
}

impl BrokerConnector for MemoryBroker {
    fn new_consumer(&self, options: ConsumerOptions) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        if let Some(foreign) = options.addr.iter().find(|addr| !is_memory_addr(addr)) {
            return Err(BrokerError::Connect {
                addr: options.addr.clone(),
                reason: format!("{foreign:?} is not served by the in-memory broker"),
            });
        }
        let (tx, rx) = self.queue(&options.topic, &options.consumer_group);
        Ok(Arc::new(MemoryConsumer {
            options,
            tx,
            rx,
            handler: Mutex::new(None),
            task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }))
    }
}

struct MemoryConsumer {
    options: ConsumerOptions,
    tx: async_channel::Sender<Message>,
    rx: async_channel::Receiver<Message>,
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    fn register_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn start(&self) -> Result<(), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Closed(self.options.topic.clone()));
        }
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| BrokerError::NoHandler(self.options.topic.clone()))?;

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(BrokerError::AlreadyStarted(self.options.topic.clone()));
        }
        *task = Some(tokio::spawn(deliver_loop(
            self.options.clone(),
            self.tx.clone(),
            self.rx.clone(),
            handler,
            self.shutdown.clone(),
        )));
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shutdown.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(topic = %self.options.topic, error = %e, "delivery task failed");
            }
        }
        Ok(())
    }
}

async fn deliver_loop(
    options: ConsumerOptions,
    tx: async_channel::Sender<Message>,
    rx: async_channel::Receiver<Message>,
    handler: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Ok(message) => message,
                Err(_) => break,
            },
        };
        deliver(&options, &tx, handler.as_ref(), message).await;
    }
    debug!(topic = %options.topic, group = %options.consumer_group, "delivery loop stopped");
}

async fn deliver(
    options: &ConsumerOptions,
    tx: &async_channel::Sender<Message>,
    handler: &dyn MessageHandler,
    mut message: Message,
) {
    let failure = match tokio::time::timeout(options.consume_timeout, handler.handle_message(&message)).await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("handler timed out after {:?}", options.consume_timeout),
    };

    if message.reconsume_times >= options.max_reconsume_times {
        error!(
            topic = %message.topic,
            msg_id = %message.msg_id,
            attempts = message.reconsume_times + 1,
            error = %failure,
            "dropping message after exhausting redeliveries"
        );
        return;
    }

    message.reconsume_times += 1;
    warn!(
        topic = %message.topic,
        msg_id = %message.msg_id,
        reconsume_times = message.reconsume_times,
        error = %failure,
        "message handling failed, redelivering"
    );
    if tx.send(message).await.is_err() {
        error!(topic = %options.topic, "queue closed, redelivery lost");
    }
}
