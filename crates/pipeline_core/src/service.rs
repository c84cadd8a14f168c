use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::MultiError;
use crate::graph::{Graph, GraphError, GraphSettings};

/// Lifecycle state, only ever moving forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ServiceState {
    Starting = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServiceState::Starting,
            1 => ServiceState::Running,
            2 => ServiceState::Closing,
            _ => ServiceState::Closed,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Closing => "closing",
            ServiceState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Atomic holder for a forward-only [`ServiceState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ServiceState::Starting as u8))
    }

    pub(crate) fn get(&self) -> ServiceState {
        ServiceState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `to` if that is forward of the current state.
    pub(crate) fn advance(&self, to: ServiceState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < to as u8).then_some(to as u8)
            })
            .is_ok()
    }
}

/// Service lifecycle errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("service is {0}")]
    NotStartable(ServiceState),
    #[error("shutdown failed: {0}")]
    Shutdown(#[source] MultiError),
}

/// One tenant's running pipeline.
#[derive(Debug)]
pub struct Service {
    tenant: String,
    state: StateCell,
    graph: Graph,
    /// Serializes start and shutdown
    lifecycle: Mutex<()>,
}

impl Service {
    /// Builds the tenant's graph. Nothing is started yet.
    pub fn new(settings: GraphSettings) -> Result<Self, ServiceError> {
        let tenant = settings.tenant.clone();
        let graph = Graph::build(settings)?;
        Ok(Self {
            tenant,
            state: StateCell::new(),
            graph,
            lifecycle: Mutex::new(()),
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn state(&self) -> ServiceState {
        self.state.get()
    }

    /// Starts every component. A no-op when already running.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let _guard = self.lifecycle.lock().await;
        match self.state.get() {
            ServiceState::Running => return Ok(()),
            ServiceState::Starting => {}
            closing => return Err(ServiceError::NotStartable(closing)),
        }

        self.graph.start_all().await?;
        self.state.advance(ServiceState::Running);
        info!(tenant = %self.tenant, "service running");
        Ok(())
    }

    /// Shuts every component down. A no-op when already closing or closed.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        let _guard = self.lifecycle.lock().await;
        if !self.state.advance(ServiceState::Closing) {
            return Ok(());
        }

        let result = self.graph.shutdown_all().await;
        self.state.advance(ServiceState::Closed);
        info!(tenant = %self.tenant, "service closed");
        result.map_err(ServiceError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigProvider, TenantConfig, YamlConfigProvider};
    use crate::factory::{ExporterBuilder, ProcessorBuilder, ReceiverBuilder};
    use crate::testing::{test_factories, EventLog};

    const CONFIG: &str = r#"
receivers:
  nop:
processors:
  nop:
  nop/broken:
    failOnStart: true
exporters:
  nop:
"#;

    async fn service(processor: &str, events: &EventLog) -> Service {
        let factories = test_factories(events.clone());
        let config = YamlConfigProvider::from_yaml(CONFIG)
            .get(&factories)
            .await
            .unwrap();
        let pipeline = TenantConfig {
            receivers: vec!["nop".parse().unwrap()],
            processors: vec![processor.parse().unwrap()],
            exporters: vec!["nop".parse().unwrap()],
        };
        Service::new(GraphSettings {
            tenant: "acme".to_string(),
            pipeline,
            receivers: ReceiverBuilder::new(config.receivers, factories.receivers),
            processors: ProcessorBuilder::new(config.processors, factories.processors),
            exporters: ExporterBuilder::new(config.exporters, factories.exporters),
        })
        .unwrap()
    }

    #[test]
    fn test_state_only_moves_forward() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ServiceState::Starting);
        assert!(cell.advance(ServiceState::Running));
        assert!(cell.advance(ServiceState::Closed));
        assert!(!cell.advance(ServiceState::Closing));
        assert_eq!(cell.get(), ServiceState::Closed);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let events = EventLog::default();
        let service = service("nop", &events).await;

        service.start().await.unwrap();
        service.start().await.unwrap();

        assert_eq!(service.state(), ServiceState::Running);
        assert_eq!(events.filtered("start:").len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let events = EventLog::default();
        let service = service("nop", &events).await;
        service.start().await.unwrap();

        service.shutdown().await.unwrap();
        service.shutdown().await.unwrap();

        assert_eq!(service.state(), ServiceState::Closed);
        assert_eq!(events.filtered("shutdown:").len(), 3);
        assert!(matches!(
            service.start().await,
            Err(ServiceError::NotStartable(ServiceState::Closed))
        ));
    }

    #[tokio::test]
    async fn test_failed_start_stays_starting() {
        let events = EventLog::default();
        let service = service("nop/broken", &events).await;

        assert!(service.start().await.is_err());
        assert_eq!(service.state(), ServiceState::Starting);

        // rollback still shuts everything down
        service.shutdown().await.unwrap();
        assert_eq!(service.state(), ServiceState::Closed);
        assert_eq!(events.filtered("shutdown:").len(), 3);
    }
}
