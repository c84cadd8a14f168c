//! Test doubles for pipeline components.
//!
//! Enabled for this crate's own tests and, through the `testing` feature, for
//! downstream crates' tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use crate::component::{Component, ComponentError, ComponentKind, CreateSettings, Exporter, Processor, Receiver};
use crate::component_id::{ComponentId, ComponentType};
use crate::confmap::ComponentConfig;
use crate::consumer::{Consumer, ConsumerError};
use crate::factory::{ExporterFactory, Factories, Factory, ProcessorFactory, ReceiverFactory};
use crate::pdata::{Span, TenantInfo, TraceData, Traces};
use crate::validate::{Validate, ValidationErrors};

/// Shared, ordered record of lifecycle events such as `start:processor:nop/a`.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn record(&self, event: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Events starting with `prefix`, in order.
    pub fn filtered(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }
}

/// Records every batch it receives.
#[derive(Debug, Default)]
pub struct CapturingConsumer {
    batches: Mutex<Vec<Traces>>,
    notify: Notify,
}

impl CapturingConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batches(&self) -> Vec<Traces> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn span_count(&self) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(Traces::span_count)
            .sum()
    }

    /// Waits until at least `expected` spans arrived; false on timeout.
    pub async fn wait_for_spans(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.span_count() >= expected {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.span_count() >= expected;
            }
        }
    }
}

#[async_trait]
impl Consumer for CapturingConsumer {
    async fn consume_traces(&self, traces: Traces) -> Result<(), ConsumerError> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(traces);
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Always fails with the given message.
#[derive(Debug)]
pub struct FailingConsumer {
    message: String,
}

impl FailingConsumer {
    pub fn new(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            message: message.into(),
        })
    }
}

#[async_trait]
impl Consumer for FailingConsumer {
    async fn consume_traces(&self, _traces: Traces) -> Result<(), ConsumerError> {
        Err(ConsumerError::sink(self.message.clone()))
    }
}

/// Panics on every call.
#[derive(Debug, Default)]
pub struct PanickingConsumer;

#[async_trait]
impl Consumer for PanickingConsumer {
    async fn consume_traces(&self, _traces: Traces) -> Result<(), ConsumerError> {
        panic!("consumer exploded");
    }
}

/// Config of the `nop`-style test components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct TestComponentConfig {
    pub fail_on_start: bool,
    pub fail_on_shutdown: bool,
    /// Shutdown sleeps this long, then records a `drained:` event
    pub shutdown_delay_ms: u64,
}

impl Validate for TestComponentConfig {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

/// A component that records its lifecycle and forwards traces to `next`.
pub struct TestComponent {
    kind: ComponentKind,
    id: ComponentId,
    config: TestComponentConfig,
    events: EventLog,
    next: Option<Arc<dyn Consumer>>,
}

impl TestComponent {
    fn event(&self, phase: &str) -> String {
        format!("{phase}:{}:{}", self.kind, self.id)
    }
}

#[async_trait]
impl Component for TestComponent {
    async fn start(&self) -> Result<(), ComponentError> {
        self.events.record(self.event("start"));
        if self.config.fail_on_start {
            return Err(ComponentError::failed(&self.id, "configured to fail on start"));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        self.events.record(self.event("shutdown"));
        if self.config.shutdown_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.shutdown_delay_ms)).await;
            self.events.record(self.event("drained"));
        }
        if self.config.fail_on_shutdown {
            return Err(ComponentError::failed(&self.id, "configured to fail on shutdown"));
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for TestComponent {
    async fn consume_traces(&self, traces: Traces) -> Result<(), ConsumerError> {
        match &self.next {
            Some(next) => next.consume_traces(traces).await,
            None => Ok(()),
        }
    }
}

impl Receiver for TestComponent {}
impl Processor for TestComponent {}
impl Exporter for TestComponent {}

/// Builds [`TestComponent`]s of every kind and counts how many it created.
pub struct TestFactory {
    ty: ComponentType,
    events: EventLog,
    created: AtomicUsize,
}

impl TestFactory {
    pub fn new(ty: &str, events: EventLog) -> Self {
        Self {
            ty: ComponentType::new(ty).unwrap_or_else(|e| panic!("invalid test type {ty:?}: {e}")),
            events,
            created: AtomicUsize::new(0),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn build(
        &self,
        kind: ComponentKind,
        settings: &CreateSettings,
        config: &dyn ComponentConfig,
        next: Option<Arc<dyn Consumer>>,
    ) -> Result<Arc<TestComponent>, ComponentError> {
        let config = config
            .downcast_ref::<TestComponentConfig>()
            .ok_or_else(|| ComponentError::ConfigType {
                id: settings.id.clone(),
                expected: "TestComponentConfig",
            })?;
        self.created.fetch_add(1, Ordering::SeqCst);
        self.events.record(format!("create:{kind}:{}", settings.id));
        Ok(Arc::new(TestComponent {
            kind,
            id: settings.id.clone(),
            config: config.clone(),
            events: self.events.clone(),
            next,
        }))
    }
}

impl Factory for TestFactory {
    fn component_type(&self) -> ComponentType {
        self.ty.clone()
    }

    fn create_default_config(&self) -> Arc<dyn ComponentConfig> {
        Arc::new(TestComponentConfig::default())
    }
}

impl ReceiverFactory for TestFactory {
    fn create_traces_receiver(
        &self,
        settings: &CreateSettings,
        config: &dyn ComponentConfig,
        next: Arc<dyn Consumer>,
    ) -> Result<Arc<dyn Receiver>, ComponentError> {
        Ok(self.build(ComponentKind::Receiver, settings, config, Some(next))?)
    }
}

impl ProcessorFactory for TestFactory {
    fn create_traces_processor(
        &self,
        settings: &CreateSettings,
        config: &dyn ComponentConfig,
        next: Arc<dyn Consumer>,
    ) -> Result<Arc<dyn Processor>, ComponentError> {
        Ok(self.build(ComponentKind::Processor, settings, config, Some(next))?)
    }
}

impl ExporterFactory for TestFactory {
    fn create_traces_exporter(
        &self,
        settings: &CreateSettings,
        config: &dyn ComponentConfig,
    ) -> Result<Arc<dyn Exporter>, ComponentError> {
        Ok(self.build(ComponentKind::Exporter, settings, config, None)?)
    }
}

/// Factories with a `nop` test factory registered for every kind.
pub fn test_factories(events: EventLog) -> Factories {
    let factory = Arc::new(TestFactory::new("nop", events));
    test_factories_with(&factory)
}

/// Like [`test_factories`] but shares the caller's factory so its counters can be read.
pub fn test_factories_with(factory: &Arc<TestFactory>) -> Factories {
    let ty = factory.component_type();
    Factories {
        receivers: HashMap::from([(ty.clone(), factory.clone() as Arc<dyn ReceiverFactory>)]),
        processors: HashMap::from([(ty.clone(), factory.clone() as Arc<dyn ProcessorFactory>)]),
        exporters: HashMap::from([(ty, factory.clone() as Arc<dyn ExporterFactory>)]),
    }
}

/// A valid span with the given ids.
pub fn span(trace_id: &str, span_id: &str) -> Span {
    Span {
        trace_id: trace_id.to_string(),
        span_id: span_id.to_string(),
        span_name: format!("op-{span_id}"),
        start_time: 1_700_000_000_000_000,
        duration: 1_000,
        ..Span::default()
    }
}

/// A batch of `count` valid spans for `tenant`.
pub fn traces(tenant: &str, count: usize) -> Traces {
    let span_list = (0..count).map(|i| span("trace", &format!("s{i}"))).collect();
    Traces::from_trace_data(TraceData {
        tenant: tenant.to_string(),
        tenant_info: TenantInfo::default(),
        span_list,
    })
}
