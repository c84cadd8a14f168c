//! Top-level collector: loads configuration, runs one service per tenant, and
//! shuts everything down on signal or cancellation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigError, ConfigProvider};
use crate::error::{BoxError, MultiError};
use crate::factory::{ExporterBuilder, Factories, ProcessorBuilder, ReceiverBuilder};
use crate::graph::GraphSettings;
use crate::service::{Service, ServiceError, ServiceState, StateCell};
use crate::validate::Validate;

/// Produces the factory set on every setup.
pub type FactoriesFn = Arc<dyn Fn() -> Result<Factories, BoxError> + Send + Sync>;

/// Collector errors
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("a config provider must be supplied")]
    MissingConfigProvider,
    #[error("failed to initialize factories: {0}")]
    Factories(#[source] BoxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("tenant {tenant:?}: {source}")]
    Tenant {
        tenant: String,
        #[source]
        source: ServiceError,
    },
    #[error("collector is {0}")]
    NotStartable(ServiceState),
    #[error("shutdown failed: {0}")]
    Shutdown(#[source] MultiError),
    #[error("collector task failed: {0}")]
    Task(String),
}

/// Settings for [`Collector`]
#[derive(Clone)]
pub struct CollectorSettings {
    pub factories: FactoriesFn,
    pub config_provider: Option<Arc<dyn ConfigProvider>>,
    /// Upper bound on waiting for each tenant's shutdown. A tenant that takes
    /// longer keeps shutting down in its own task, which is cut short only if
    /// the runtime itself stops first.
    pub shutdown_timeout: Duration,
}

impl CollectorSettings {
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new<F>(factories: F) -> Self
    where
        F: Fn() -> Result<Factories, BoxError> + Send + Sync + 'static,
    {
        Self {
            factories: Arc::new(factories),
            config_provider: None,
            shutdown_timeout: Self::DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_config_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.config_provider = Some(provider);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Handle to a collector running in the background, see [`Collector::run`].
pub struct RunHandle {
    ready: Option<oneshot::Receiver<()>>,
    join: JoinHandle<Result<(), CollectorError>>,
}

impl RunHandle {
    /// True once every tenant is running; false if setup failed, in which
    /// case [`wait`](Self::wait) returns the error.
    pub async fn ready(&mut self) -> bool {
        match self.ready.take() {
            Some(ready) => ready.await.is_ok(),
            None => !self.join.is_finished(),
        }
    }

    /// Waits for the collector to stop.
    pub async fn wait(self) -> Result<(), CollectorError> {
        self.join
            .await
            .map_err(|e| CollectorError::Task(e.to_string()))?
    }
}

pub struct Collector {
    factories: FactoriesFn,
    provider: Arc<dyn ConfigProvider>,
    shutdown_timeout: Duration,
    state: StateCell,
    services: Mutex<BTreeMap<String, Arc<Service>>>,
}

impl Collector {
    pub fn new(settings: CollectorSettings) -> Result<Self, CollectorError> {
        let provider = settings
            .config_provider
            .ok_or(CollectorError::MissingConfigProvider)?;
        Ok(Self {
            factories: settings.factories,
            provider,
            shutdown_timeout: settings.shutdown_timeout,
            state: StateCell::new(),
            services: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn state(&self) -> ServiceState {
        self.state.get()
    }

    /// Names of the tenants with a service, in order.
    pub async fn tenants(&self) -> Vec<String> {
        self.services.lock().await.keys().cloned().collect()
    }

    /// Loads and validates the config, then builds and starts every tenant.
    ///
    /// If any tenant fails, everything started so far is shut down again.
    async fn setup(&self) -> Result<(), CollectorError> {
        let state = self.state.get();
        if state != ServiceState::Starting {
            return Err(CollectorError::NotStartable(state));
        }

        let factories = (self.factories)().map_err(CollectorError::Factories)?;
        let config = self.provider.get(&factories).await?;
        config.validate().map_err(ConfigError::Invalid)?;
        if config.tenants.is_empty() {
            warn!("no tenants configured");
        }

        let receivers = ReceiverBuilder::new(config.receivers.clone(), factories.receivers.clone());
        let processors = ProcessorBuilder::new(config.processors.clone(), factories.processors.clone());
        let exporters = ExporterBuilder::new(config.exporters.clone(), factories.exporters.clone());

        for (tenant, pipeline) in &config.tenants {
            let settings = GraphSettings {
                tenant: tenant.clone(),
                pipeline: pipeline.clone(),
                receivers: receivers.clone(),
                processors: processors.clone(),
                exporters: exporters.clone(),
            };

            let started = match Service::new(settings) {
                Ok(service) => {
                    let service = Arc::new(service);
                    self.services
                        .lock()
                        .await
                        .insert(tenant.clone(), Arc::clone(&service));
                    service.start().await
                }
                Err(err) => Err(err),
            };

            if let Err(source) = started {
                error!(tenant = %tenant, error = %source, "failed to start tenant, rolling back");
                if let Err(rollback) = self.shutdown().await {
                    warn!(error = %rollback, "rollback shutdown reported errors");
                }
                return Err(CollectorError::Tenant {
                    tenant: tenant.clone(),
                    source,
                });
            }
        }

        self.state.advance(ServiceState::Running);
        info!(tenants = config.tenants.len(), "collector running");
        Ok(())
    }

    /// Runs until a signal arrives or `cancel` fires, then shuts down.
    pub async fn run_in_one(&self, cancel: CancellationToken) -> Result<(), CollectorError> {
        self.setup().await?;
        wait_for_shutdown(&cancel).await;
        self.shutdown().await
    }

    /// Like [`run_in_one`](Self::run_in_one) but in a background task.
    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> RunHandle {
        let (ready_tx, ready_rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            self.setup().await?;
            let _ = ready_tx.send(());
            wait_for_shutdown(&cancel).await;
            self.shutdown().await
        });
        RunHandle {
            ready: Some(ready_rx),
            join,
        }
    }

    /// Shuts every tenant down, each bounded by the shutdown timeout.
    /// A no-op once closing has begun.
    pub async fn shutdown(&self) -> Result<(), CollectorError> {
        if !self.state.advance(ServiceState::Closing) {
            return Ok(());
        }

        let services: Vec<(String, Arc<Service>)> = self
            .services
            .lock()
            .await
            .iter()
            .map(|(tenant, service)| (tenant.clone(), Arc::clone(service)))
            .collect();

        let mut errors = MultiError::new();
        for (tenant, service) in services {
            // dropping a JoinHandle detaches the task, so a timed-out drain continues
            let shutdown = tokio::spawn(async move { service.shutdown().await });
            match tokio::time::timeout(self.shutdown_timeout, shutdown).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(source))) => errors.push(CollectorError::Tenant { tenant, source }),
                Ok(Err(join_err)) => {
                    error!(tenant = %tenant, error = %join_err, "tenant shutdown task failed");
                    errors.push(format!("tenant {tenant:?}: shutdown task failed: {join_err}"));
                }
                Err(_) => {
                    error!(
                        tenant = %tenant,
                        timeout = ?self.shutdown_timeout,
                        "tenant shutdown timed out, still draining in the background"
                    );
                    errors.push(format!(
                        "tenant {tenant:?}: shutdown timed out after {:?}",
                        self.shutdown_timeout
                    ));
                }
            }
        }

        self.state.advance(ServiceState::Closed);
        info!("collector closed");
        errors.into_result().map_err(CollectorError::Shutdown)
    }
}

/// Resolves on ctrl-c, SIGTERM, or cancellation of `cancel`.
async fn wait_for_shutdown(cancel: &CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = cancel.cancelled() => info!("shutdown requested"),
        () = ctrl_c => info!("received ctrl-c, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::YamlConfigProvider;
    use crate::testing::{test_factories_with, EventLog, TestFactory};

    const CONFIG: &str = r#"
receivers:
  nop:
processors:
  nop:
  nop/broken:
    failOnStart: true
exporters:
  nop:
tenants:
  alpha:
    receivers: [nop]
    processors: [nop]
    exporters: [nop]
  beta:
    receivers: [nop]
    processors: [nop/broken]
    exporters: [nop]
"#;

    fn collector(yaml: &str, factory: &Arc<TestFactory>) -> Collector {
        let factory = Arc::clone(factory);
        let settings = CollectorSettings::new(move || Ok(test_factories_with(&factory)))
            .with_config_provider(Arc::new(YamlConfigProvider::from_yaml(yaml)))
            .with_shutdown_timeout(Duration::from_secs(5));
        Collector::new(settings).unwrap()
    }

    fn healthy_config() -> String {
        CONFIG.replace("processors: [nop/broken]", "processors: [nop]")
    }

    #[test]
    fn test_config_provider_is_required() {
        let settings = CollectorSettings::new(|| Ok(Factories::default()));
        assert!(matches!(
            Collector::new(settings),
            Err(CollectorError::MissingConfigProvider)
        ));
    }

    #[tokio::test]
    async fn test_failing_tenant_rolls_back_everything() {
        let events = EventLog::default();
        let factory = Arc::new(TestFactory::new("nop", events.clone()));
        let collector = collector(CONFIG, &factory);

        let err = collector
            .run_in_one(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CollectorError::Tenant { ref tenant, .. } if tenant == "beta"));
        assert!(err.to_string().contains("beta"));
        assert_eq!(collector.state(), ServiceState::Closed);

        // alpha started fully and was shut down; beta's components too
        let stops = events.filtered("shutdown:");
        assert_eq!(stops.len(), 6);
    }

    #[tokio::test]
    async fn test_invalid_config_creates_nothing() {
        let events = EventLog::default();
        let factory = Arc::new(TestFactory::new("nop", events.clone()));
        let yaml = CONFIG.replace("exporters: [nop]\n  beta", "exporters: [nop/missing]\n  beta");
        let collector = collector(&yaml, &factory);

        let err = collector
            .run_in_one(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CollectorError::Config(ConfigError::Invalid(_))));
        assert!(err
            .to_string()
            .contains("exporter \"nop/missing\" which is not configured"));
        assert_eq!(factory.created(), 0);
        assert!(events.events().is_empty());
    }

    #[tokio::test]
    async fn test_factories_error_is_reported() {
        let settings = CollectorSettings::new(|| Err("no factories today".into()))
            .with_config_provider(Arc::new(YamlConfigProvider::from_yaml(CONFIG)));
        let collector = Collector::new(settings).unwrap();

        let err = collector
            .run_in_one(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::Factories(_)));
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let events = EventLog::default();
        let factory = Arc::new(TestFactory::new("nop", events.clone()));
        let collector = Arc::new(collector(&healthy_config(), &factory));
        let cancel = CancellationToken::new();

        let mut handle = Arc::clone(&collector).run(cancel.clone());
        assert!(handle.ready().await);
        assert_eq!(collector.state(), ServiceState::Running);
        assert_eq!(collector.tenants().await, vec!["alpha", "beta"]);
        assert_eq!(events.filtered("start:").len(), 6);

        cancel.cancel();
        handle.wait().await.unwrap();

        assert_eq!(collector.state(), ServiceState::Closed);
        assert_eq!(events.filtered("shutdown:").len(), 6);

        // second shutdown is a no-op
        collector.shutdown().await.unwrap();
        assert_eq!(events.filtered("shutdown:").len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_tenant_keeps_shutting_down() {
        const SLOW: &str = r#"
receivers:
  nop:
processors:
  nop/slow:
    shutdownDelayMs: 1000
exporters:
  nop:
tenants:
  alpha:
    receivers: [nop]
    processors: [nop/slow]
    exporters: [nop]
"#;
        let events = EventLog::default();
        let factory = Arc::new(TestFactory::new("nop", events.clone()));
        let settings = CollectorSettings::new(move || Ok(test_factories_with(&factory)))
            .with_config_provider(Arc::new(YamlConfigProvider::from_yaml(SLOW)))
            .with_shutdown_timeout(Duration::from_millis(100));
        let collector = Arc::new(Collector::new(settings).unwrap());
        let cancel = CancellationToken::new();

        let mut handle = Arc::clone(&collector).run(cancel.clone());
        assert!(handle.ready().await);
        cancel.cancel();

        let err = handle.wait().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(collector.state(), ServiceState::Closed);
        assert!(events.filtered("drained:").is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(events.filtered("drained:"), vec!["drained:processor:nop/slow"]);
        assert_eq!(events.filtered("shutdown:").len(), 3);
    }

    #[tokio::test]
    async fn test_run_reports_setup_failure() {
        let events = EventLog::default();
        let factory = Arc::new(TestFactory::new("nop", events));
        let collector = Arc::new(collector(CONFIG, &factory));

        let mut handle = collector.run(CancellationToken::new());
        assert!(!handle.ready().await);
        assert!(matches!(handle.wait().await, Err(CollectorError::Tenant { .. })));
    }
}
