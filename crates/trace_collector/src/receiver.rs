//! Broker receiver: consumes span messages from a topic and hands valid spans
//! to the next consumer of the tenant pipeline.

use async_trait::async_trait;
use pipeline_core::confmap::{duration, string_list};
use pipeline_core::{
    BoxError, Component, ComponentConfig, ComponentError, ComponentId, ComponentType, Consumer,
    CreateSettings, Factory, Receiver, ReceiverFactory, TraceData, Traces, Validate,
    ValidationErrors,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConnector, BrokerConsumer, ConsumerOptions, Message, MessageHandler};

pub const RECEIVER_TYPE: &str = "broker";

/// Configuration for [`BrokerReceiver`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BrokerReceiverConfig {
    /// Broker addresses, as a list or a comma-separated string
    #[serde(with = "string_list")]
    pub addr: Vec<String>,
    pub topic: String,
    pub consumer_group: String,
    #[serde(with = "duration")]
    pub consume_timeout: Duration,
    pub max_reconsume_times: u32,
}

impl Default for BrokerReceiverConfig {
    fn default() -> Self {
        Self {
            addr: Vec::new(),
            topic: String::new(),
            consumer_group: String::new(),
            consume_timeout: Duration::from_secs(5),
            max_reconsume_times: 3,
        }
    }
}

impl Validate for BrokerReceiverConfig {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        errors.ensure(!self.addr.is_empty(), "addr must not be empty");
        errors.ensure(!self.topic.trim().is_empty(), "topic must not be empty");
        errors.ensure(
            !self.consumer_group.trim().is_empty(),
            "consumerGroup must not be empty",
        );
        errors.ensure(!self.consume_timeout.is_zero(), "consumeTimeout must be positive");
        errors.into_result()
    }
}

impl From<&BrokerReceiverConfig> for ConsumerOptions {
    fn from(config: &BrokerReceiverConfig) -> Self {
        Self {
            addr: config.addr.clone(),
            topic: config.topic.clone(),
            consumer_group: config.consumer_group.clone(),
            consume_timeout: config.consume_timeout,
            max_reconsume_times: config.max_reconsume_times,
        }
    }
}

/// Decodes one message into spans and forwards the valid ones.
pub struct SpanMessageHandler {
    id: ComponentId,
    next: Arc<dyn Consumer>,
}

impl SpanMessageHandler {
    pub fn new(id: ComponentId, next: Arc<dyn Consumer>) -> Self {
        Self { id, next }
    }
}

#[async_trait]
impl MessageHandler for SpanMessageHandler {
    async fn handle_message(&self, message: &Message) -> Result<(), BoxError> {
        let mut data: TraceData = serde_json::from_slice(&message.body).map_err(|e| {
            warn!(
                receiver = %self.id,
                topic = %message.topic,
                msg_id = %message.msg_id,
                error = %e,
                "fail to decode trace data"
            );
            e
        })?;

        let received = data.span_list.len();
        data.span_list.retain(|span| match span.check() {
            Ok(()) => true,
            Err(reason) => {
                warn!(
                    receiver = %self.id,
                    tenant = %data.tenant,
                    trace_id = %span.trace_id,
                    span_id = %span.span_id,
                    reason = %reason,
                    "dropping invalid span"
                );
                false
            }
        });

        if data.span_list.is_empty() {
            debug!(receiver = %self.id, msg_id = %message.msg_id, received, "no valid spans in message");
            return Ok(());
        }

        self.next
            .consume_traces(Traces::from_trace_data(data))
            .await
            .map_err(Into::into)
    }
}

/// Receives trace messages from a broker topic.
pub struct BrokerReceiver {
    id: ComponentId,
    tenant: String,
    config: BrokerReceiverConfig,
    connector: Arc<dyn BrokerConnector>,
    handler: Arc<SpanMessageHandler>,
    consumer: Mutex<Option<Arc<dyn BrokerConsumer>>>,
}

impl BrokerReceiver {
    pub fn new(
        settings: &CreateSettings,
        config: BrokerReceiverConfig,
        connector: Arc<dyn BrokerConnector>,
        next: Arc<dyn Consumer>,
    ) -> Self {
        Self {
            id: settings.id.clone(),
            tenant: settings.tenant.clone(),
            config,
            connector,
            handler: Arc::new(SpanMessageHandler::new(settings.id.clone(), next)),
            consumer: Mutex::new(None),
        }
    }

    pub fn handler(&self) -> &Arc<SpanMessageHandler> {
        &self.handler
    }
}

#[async_trait]
impl Component for BrokerReceiver {
    async fn start(&self) -> Result<(), ComponentError> {
        let consumer = self
            .connector
            .new_consumer(ConsumerOptions::from(&self.config))
            .map_err(|e| ComponentError::failed(&self.id, e))?;
        consumer.register_handler(Arc::clone(&self.handler) as Arc<dyn MessageHandler>);
        consumer
            .start()
            .await
            .map_err(|e| ComponentError::failed(&self.id, e))?;

        *self.consumer.lock().unwrap_or_else(PoisonError::into_inner) = Some(consumer);
        info!(
            receiver = %self.id,
            tenant = %self.tenant,
            topic = %self.config.topic,
            group = %self.config.consumer_group,
            "broker receiver started"
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(consumer) = consumer else {
            return Ok(());
        };
        consumer
            .close()
            .await
            .map_err(|e| ComponentError::failed(&self.id, e))?;
        info!(receiver = %self.id, tenant = %self.tenant, "broker receiver stopped");
        Ok(())
    }
}

impl Receiver for BrokerReceiver {}

/// Builds [`BrokerReceiver`]s that share one broker connection.
pub struct BrokerReceiverFactory {
    connector: Arc<dyn BrokerConnector>,
}

impl BrokerReceiverFactory {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self { connector }
    }
}

impl Factory for BrokerReceiverFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static(RECEIVER_TYPE)
    }

    fn create_default_config(&self) -> Arc<dyn ComponentConfig> {
        Arc::new(BrokerReceiverConfig::default())
    }
}

impl ReceiverFactory for BrokerReceiverFactory {
    fn create_traces_receiver(
        &self,
        settings: &CreateSettings,
        config: &dyn ComponentConfig,
        next: Arc<dyn Consumer>,
    ) -> Result<Arc<dyn Receiver>, ComponentError> {
        let config = config
            .downcast_ref::<BrokerReceiverConfig>()
            .ok_or_else(|| ComponentError::ConfigType {
                id: settings.id.clone(),
                expected: "BrokerReceiverConfig",
            })?;
        config
            .validate()
            .map_err(|e| ComponentError::invalid_config(&settings.id, e))?;
        Ok(Arc::new(BrokerReceiver::new(
            settings,
            config.clone(),
            Arc::clone(&self.connector),
            next,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use pipeline_core::testing::{span, CapturingConsumer, FailingConsumer};
    use pipeline_core::{Span, TenantInfo, Ttl};
    use serde_json::json;

    fn settings() -> CreateSettings {
        CreateSettings::new("broker/spans".parse().unwrap(), "acme")
    }

    fn message(body: Vec<u8>) -> Message {
        Message {
            topic: "spans".to_string(),
            msg_id: "m-1".to_string(),
            body,
            reconsume_times: 0,
        }
    }

    fn encode(spans: Vec<Span>) -> Vec<u8> {
        serde_json::to_vec(&TraceData {
            tenant: "acme".to_string(),
            tenant_info: TenantInfo { ttl: Ttl::SevenDays },
            span_list: spans,
        })
        .unwrap()
    }

    fn config() -> BrokerReceiverConfig {
        BrokerReceiverConfig {
            addr: vec!["memory".to_string()],
            topic: "spans".to_string(),
            consumer_group: "collector".to_string(),
            ..BrokerReceiverConfig::default()
        }
    }

    #[tokio::test]
    async fn test_valid_message_is_forwarded() {
        let sink = CapturingConsumer::new();
        let handler = SpanMessageHandler::new(settings().id, sink.clone());

        handler
            .handle_message(&message(encode(vec![span("t", "a"), span("t", "b")])))
            .await
            .unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].tenant, "acme");
        assert_eq!(batches[0].trace_data[0].tenant_info.ttl, Ttl::SevenDays);
        assert_eq!(batches[0].span_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_spans_are_filtered() {
        let sink = CapturingConsumer::new();
        let handler = SpanMessageHandler::new(settings().id, sink.clone());

        let no_trace = span("", "x");
        handler
            .handle_message(&message(encode(vec![span("t", "a"), no_trace])))
            .await
            .unwrap();

        assert_eq!(sink.span_count(), 1);
        assert_eq!(sink.batches()[0].trace_data[0].span_list[0].span_id, "a");
    }

    #[tokio::test]
    async fn test_all_invalid_is_acknowledged_without_forwarding() {
        let sink = CapturingConsumer::new();
        let handler = SpanMessageHandler::new(settings().id, sink.clone());

        handler
            .handle_message(&message(encode(vec![span("t", "")])))
            .await
            .unwrap();
        handler.handle_message(&message(encode(Vec::new()))).await.unwrap();

        assert_eq!(sink.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_an_error() {
        let sink = CapturingConsumer::new();
        let handler = SpanMessageHandler::new(settings().id, sink.clone());

        assert!(handler.handle_message(&message(b"not json".to_vec())).await.is_err());
        let wrong_shape = serde_json::to_vec(&json!({"spanList": "nope"})).unwrap();
        assert!(handler.handle_message(&message(wrong_shape)).await.is_err());
        assert_eq!(sink.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_downstream_error_requests_redelivery() {
        let handler = SpanMessageHandler::new(settings().id, FailingConsumer::new("queue full"));
        let err = handler
            .handle_message(&message(encode(vec![span("t", "a")])))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("queue full"));
    }

    #[tokio::test]
    async fn test_receiver_consumes_from_broker() {
        let broker = MemoryBroker::new();
        let sink = CapturingConsumer::new();
        let receiver = BrokerReceiver::new(&settings(), config(), Arc::new(broker.clone()), sink.clone());

        receiver.start().await.unwrap();
        broker.publish("spans", encode(vec![span("t", "a")]));
        assert!(sink.wait_for_spans(1, Duration::from_secs(5)).await);

        receiver.shutdown().await.unwrap();
        receiver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_for_unreachable_broker() {
        let config = BrokerReceiverConfig {
            addr: vec!["nameserver:9876".to_string()],
            ..config()
        };
        let receiver = BrokerReceiver::new(
            &settings(),
            config,
            Arc::new(MemoryBroker::new()),
            CapturingConsumer::new(),
        );

        let err = receiver.start().await.unwrap_err();
        assert!(matches!(err, ComponentError::Failed { .. }));
        assert!(err.to_string().contains("failed to connect"));
        receiver.shutdown().await.unwrap();
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());

        let err = BrokerReceiverConfig::default().validate().unwrap_err();
        assert!(err.contains("addr must not be empty"));
        assert!(err.contains("topic must not be empty"));
        assert!(err.contains("consumerGroup must not be empty"));
    }

    #[test]
    fn test_factory_rejects_foreign_config() {
        let factory = BrokerReceiverFactory::new(Arc::new(MemoryBroker::new()));
        let foreign: Arc<dyn ComponentConfig> = Arc::new(pipeline_core::testing::TestComponentConfig::default());
        let result = factory.create_traces_receiver(&settings(), foreign.as_ref(), CapturingConsumer::new());
        assert!(matches!(result, Err(ComponentError::ConfigType { .. })));
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        let factory = BrokerReceiverFactory::new(Arc::new(MemoryBroker::new()));
        let config = BrokerReceiverConfig {
            topic: String::new(),
            ..config()
        };
        let result = factory.create_traces_receiver(&settings(), &config, CapturingConsumer::new());
        let Err(err) = result else {
            panic!("receiver without a topic was created");
        };
        assert!(matches!(err, ComponentError::InvalidConfig { .. }));
        assert!(err.to_string().contains("topic must not be empty"));
    }
}
