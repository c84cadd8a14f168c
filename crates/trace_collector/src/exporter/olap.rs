use async_trait::async_trait;
use pipeline_core::confmap::duration;
use pipeline_core::{
    Component, ComponentConfig, ComponentError, ComponentId, ComponentType, Consumer,
    ConsumerError, CreateSettings, Exporter, ExporterFactory, Factory, Span, Traces, Ttl,
    Validate, ValidationErrors,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::repository::{InsertSpansParam, RepositoryError, TraceRepository};
use super::retry::{RetryConfig, RetryingRepository};

pub const EXPORTER_TYPE: &str = "olap";

/// Configuration for [`TraceExporter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct OlapExporterConfig {
    pub database: String,
    pub table: String,
    /// Bound on one bucket's insert, retries included
    #[serde(with = "duration")]
    pub insert_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for OlapExporterConfig {
    fn default() -> Self {
        Self {
            database: "observability".to_string(),
            table: "spans".to_string(),
            insert_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

impl Validate for OlapExporterConfig {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        errors.ensure(!self.database.trim().is_empty(), "database must not be empty");
        errors.ensure(!self.table.trim().is_empty(), "table must not be empty");
        errors.ensure(!self.insert_timeout.is_zero(), "insertTimeout must be positive");
        errors.merge_with_context("retry", self.retry.validate());
        errors.into_result()
    }
}

/// Writes spans to a [`TraceRepository`], one insert per retention class.
pub struct TraceExporter {
    id: ComponentId,
    tenant: String,
    config: OlapExporterConfig,
    repository: Arc<dyn TraceRepository>,
}

impl TraceExporter {
    pub fn new(
        settings: &CreateSettings,
        config: OlapExporterConfig,
        repository: Arc<dyn TraceRepository>,
    ) -> Self {
        Self {
            id: settings.id.clone(),
            tenant: settings.tenant.clone(),
            config,
            repository,
        }
    }

    async fn insert(&self, param: &InsertSpansParam) -> Result<(), RepositoryError> {
        let timeout = self.config.insert_timeout;
        match tokio::time::timeout(timeout, self.repository.insert_spans(param)).await {
            Ok(result) => result,
            Err(_) => Err(RepositoryError::Timeout(timeout)),
        }
    }
}

/// Groups spans by retention class, keeping arrival order within a class.
fn bucket_by_ttl(traces: Traces) -> BTreeMap<Ttl, Vec<Span>> {
    let mut buckets: BTreeMap<Ttl, Vec<Span>> = BTreeMap::new();
    for data in traces.trace_data {
        if data.span_list.is_empty() {
            continue;
        }
        buckets
            .entry(data.tenant_info.ttl)
            .or_default()
            .extend(data.span_list);
    }
    buckets
}

#[async_trait]
impl Consumer for TraceExporter {
    async fn consume_traces(&self, traces: Traces) -> Result<(), ConsumerError> {
        let tenant = traces.tenant.clone();
        for (ttl, spans) in bucket_by_ttl(traces) {
            let param = InsertSpansParam {
                database: self.config.database.clone(),
                table: self.config.table.clone(),
                tenant: tenant.clone(),
                ttl,
                spans,
            };
            let count = param.spans.len();
            if let Err(e) = self.insert(&param).await {
                error!(
                    exporter = %self.id,
                    repository = %self.repository.name(),
                    tenant = %tenant,
                    ttl = %ttl,
                    spans = count,
                    error = %e,
                    "fail to insert spans"
                );
                return Err(ConsumerError::sink(e));
            }
            debug!(exporter = %self.id, tenant = %tenant, ttl = %ttl, spans = count, "inserted spans");
        }
        Ok(())
    }
}

#[async_trait]
impl Component for TraceExporter {
    async fn start(&self) -> Result<(), ComponentError> {
        info!(
            exporter = %self.id,
            tenant = %self.tenant,
            repository = %self.repository.name(),
            database = %self.config.database,
            table = %self.config.table,
            "olap exporter started"
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        info!(exporter = %self.id, tenant = %self.tenant, "olap exporter stopped");
        Ok(())
    }
}

impl Exporter for TraceExporter {}

/// Builds [`TraceExporter`]s over a shared repository.
pub struct OlapExporterFactory {
    repository: Arc<dyn TraceRepository>,
}

impl OlapExporterFactory {
    pub fn new(repository: Arc<dyn TraceRepository>) -> Self {
        Self { repository }
    }
}

impl Factory for OlapExporterFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static(EXPORTER_TYPE)
    }

    fn create_default_config(&self) -> Arc<dyn ComponentConfig> {
        Arc::new(OlapExporterConfig::default())
    }
}

impl ExporterFactory for OlapExporterFactory {
    fn create_traces_exporter(
        &self,
        settings: &CreateSettings,
        config: &dyn ComponentConfig,
    ) -> Result<Arc<dyn Exporter>, ComponentError> {
        let config = config
            .downcast_ref::<OlapExporterConfig>()
            .ok_or_else(|| ComponentError::ConfigType {
                id: settings.id.clone(),
                expected: "OlapExporterConfig",
            })?;
        config
            .validate()
            .map_err(|e| ComponentError::invalid_config(&settings.id, e))?;
        let repository = Arc::new(RetryingRepository::new(
            Arc::clone(&self.repository),
            config.retry.clone(),
        ));
        Ok(Arc::new(TraceExporter::new(settings, config.clone(), repository)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::repository::MemoryTraceRepository;
    use pipeline_core::testing::span;
    use pipeline_core::{TenantInfo, TraceData};

    fn settings() -> CreateSettings {
        CreateSettings::new("olap".parse().unwrap(), "acme")
    }

    fn data(ttl: Ttl, ids: &[&str]) -> TraceData {
        TraceData {
            tenant: "acme".to_string(),
            tenant_info: TenantInfo { ttl },
            span_list: ids.iter().map(|id| span("t", id)).collect(),
        }
    }

    /// Fails every insert for one retention class.
    struct RejectTtl {
        ttl: Ttl,
        inner: MemoryTraceRepository,
    }

    #[async_trait]
    impl TraceRepository for RejectTtl {
        async fn insert_spans(&self, param: &InsertSpansParam) -> Result<(), RepositoryError> {
            if param.ttl == self.ttl {
                return Err(RepositoryError::Serialization("rejected".to_string()));
            }
            self.inner.insert_spans(param).await
        }

        fn name(&self) -> &str {
            "reject"
        }
    }

    struct StuckRepository;

    #[async_trait]
    impl TraceRepository for StuckRepository {
        async fn insert_spans(&self, _param: &InsertSpansParam) -> Result<(), RepositoryError> {
            std::future::pending().await
        }

        fn name(&self) -> &str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn test_spans_are_bucketed_by_ttl() {
        let repo = Arc::new(MemoryTraceRepository::new());
        let exporter = TraceExporter::new(&settings(), OlapExporterConfig::default(), repo.clone());

        let traces = Traces::new(
            "acme",
            vec![
                data(Ttl::SevenDays, &["a"]),
                data(Ttl::ThreeDays, &["b", "c"]),
                data(Ttl::SevenDays, &["d"]),
                data(Ttl::OneYear, &[]),
            ],
        );
        exporter.consume_traces(traces).await.unwrap();

        let inserts = repo.inserts();
        assert_eq!(inserts.len(), 2);
        assert!(inserts.iter().all(|i| i.tenant == "acme" && i.table == "spans"));
        let seven: Vec<_> = repo
            .spans_for("acme", Ttl::SevenDays)
            .into_iter()
            .map(|s| s.span_id)
            .collect();
        assert_eq!(seven, vec!["a", "d"]);
        assert_eq!(repo.spans_for("acme", Ttl::ThreeDays).len(), 2);
    }

    #[tokio::test]
    async fn test_first_failure_is_returned_and_earlier_buckets_kept() {
        let repo = Arc::new(RejectTtl {
            ttl: Ttl::ThirtyDays,
            inner: MemoryTraceRepository::new(),
        });
        let exporter = TraceExporter::new(&settings(), OlapExporterConfig::default(), repo.clone());

        let traces = Traces::new(
            "acme",
            vec![
                data(Ttl::NinetyDays, &["late"]),
                data(Ttl::ThirtyDays, &["bad"]),
                data(Ttl::ThreeDays, &["early"]),
            ],
        );
        let err = exporter.consume_traces(traces).await.unwrap_err();

        assert!(err.to_string().contains("rejected"));
        // buckets are written in retention order
        assert_eq!(repo.inner.span_count(), 1);
        assert_eq!(repo.inner.spans_for("acme", Ttl::ThreeDays)[0].span_id, "early");
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_timeout() {
        let config = OlapExporterConfig {
            insert_timeout: Duration::from_millis(200),
            ..OlapExporterConfig::default()
        };
        let exporter = TraceExporter::new(&settings(), config, Arc::new(StuckRepository));

        let err = exporter
            .consume_traces(Traces::new("acme", vec![data(Ttl::ThreeDays, &["a"])]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_factory_builds_exporter() {
        let repo = Arc::new(MemoryTraceRepository::new());
        let factory = OlapExporterFactory::new(repo.clone());
        let config = factory.create_default_config();

        let exporter = factory
            .create_traces_exporter(&settings(), config.as_ref())
            .unwrap();
        exporter.start().await.unwrap();
        exporter
            .consume_traces(Traces::new("acme", vec![data(Ttl::HalfYear, &["a", "b"])]))
            .await
            .unwrap();
        exporter.shutdown().await.unwrap();

        assert_eq!(repo.spans_for("acme", Ttl::HalfYear).len(), 2);
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        let factory = OlapExporterFactory::new(Arc::new(MemoryTraceRepository::new()));
        let config = OlapExporterConfig {
            insert_timeout: Duration::ZERO,
            retry: RetryConfig {
                backoff_multiplier: 0.5,
                ..RetryConfig::default()
            },
            ..OlapExporterConfig::default()
        };
        let Err(err) = factory.create_traces_exporter(&settings(), &config) else {
            panic!("exporter with a zero insert timeout was created");
        };
        assert!(matches!(err, ComponentError::InvalidConfig { .. }));
        let message = err.to_string();
        assert!(message.contains("insertTimeout must be positive"));
        assert!(message.contains("backoffMultiplier must be at least 1.0"));
    }

    #[test]
    fn test_config_decoding_and_validation() {
        let config: OlapExporterConfig = serde_yaml::from_str(
            "database: traces\ninsertTimeout: 2s\nretry:\n  maxRetries: 1\n",
        )
        .unwrap();
        assert_eq!(config.database, "traces");
        assert_eq!(config.table, "spans");
        assert_eq!(config.insert_timeout, Duration::from_secs(2));
        assert_eq!(config.retry.max_retries, 1);
        assert!(config.validate().is_ok());

        let invalid = OlapExporterConfig {
            table: String::new(),
            insert_timeout: Duration::ZERO,
            retry: RetryConfig {
                backoff_multiplier: 0.0,
                ..RetryConfig::default()
            },
            ..OlapExporterConfig::default()
        };
        let err = invalid.validate().unwrap_err();
        assert!(err.contains("table must not be empty"));
        assert!(err.contains("insertTimeout must be positive"));
        assert!(err.contains("backoffMultiplier"));
    }
}
