//! Collector configuration: decoding, validation and providers.
//!
//! The YAML document has four top-level sections:
//!
//! ```yaml
//! receivers:   { <id>: <config> }
//! processors:  { <id>: <config> }
//! exporters:   { <id>: <config> }
//! tenants:
//!   <name>: { receivers: [<id>], processors: [<id>], exporters: [<id>] }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::component::ComponentKind;
use crate::component_id::{ComponentId, ComponentIdError};
use crate::confmap::ComponentConfig;
use crate::factory::Factories;
use crate::validate::{Validate, ValidationErrors};

const SECTIONS: [&str; 4] = ["receivers", "processors", "exporters", "tenants"];

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{0} must be a mapping")]
    NotAMapping(String),
    #[error("unknown config section {0:?}")]
    UnknownSection(String),
    #[error("invalid {kind} id {key:?}: {source}")]
    InvalidId {
        kind: ComponentKind,
        key: String,
        #[source]
        source: ComponentIdError,
    },
    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: ComponentKind, id: ComponentId },
    #[error("unknown {kind} type {:?} for {id}", .id.component_type().as_str())]
    UnknownType { kind: ComponentKind, id: ComponentId },
    #[error("error decoding {kind} {id}: {source}")]
    Decode {
        kind: ComponentKind,
        id: ComponentId,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("error decoding tenant {tenant:?}: {source}")]
    Tenant {
        tenant: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),
}

/// Which components make up one tenant's pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TenantConfig {
    pub receivers: Vec<ComponentId>,
    pub processors: Vec<ComponentId>,
    pub exporters: Vec<ComponentId>,
}

impl TenantConfig {
    pub fn ids(&self, kind: ComponentKind) -> &[ComponentId] {
        match kind {
            ComponentKind::Receiver => &self.receivers,
            ComponentKind::Processor => &self.processors,
            ComponentKind::Exporter => &self.exporters,
        }
    }

    /// Checks that every referenced id is configured in `config`.
    pub fn validate_references(&self, config: &CollectorConfig) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        for kind in [
            ComponentKind::Receiver,
            ComponentKind::Processor,
            ComponentKind::Exporter,
        ] {
            let configured = config.components(kind);
            for id in self.ids(kind) {
                errors.ensure(
                    configured.contains_key(id),
                    format!("references {kind} \"{id}\" which is not configured"),
                );
            }
        }
        errors.into_result()
    }
}

impl Validate for TenantConfig {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        errors.ensure(!self.receivers.is_empty(), "must reference at least one receiver");
        errors.ensure(!self.processors.is_empty(), "must reference at least one processor");
        errors.ensure(!self.exporters.is_empty(), "must reference at least one exporter");
        errors.into_result()
    }
}

/// The fully decoded collector configuration.
#[derive(Debug, Clone, Default)]
pub struct CollectorConfig {
    pub receivers: HashMap<ComponentId, Arc<dyn ComponentConfig>>,
    pub processors: HashMap<ComponentId, Arc<dyn ComponentConfig>>,
    pub exporters: HashMap<ComponentId, Arc<dyn ComponentConfig>>,
    pub tenants: BTreeMap<String, TenantConfig>,
}

impl CollectorConfig {
    pub fn components(&self, kind: ComponentKind) -> &HashMap<ComponentId, Arc<dyn ComponentConfig>> {
        match kind {
            ComponentKind::Receiver => &self.receivers,
            ComponentKind::Processor => &self.processors,
            ComponentKind::Exporter => &self.exporters,
        }
    }

    /// Decodes a parsed YAML document against the known factories.
    pub fn decode(raw: &Value, factories: &Factories) -> Result<Self, ConfigError> {
        let empty = Mapping::new();
        let root = match raw {
            Value::Mapping(map) => map,
            Value::Null => &empty,
            _ => return Err(ConfigError::NotAMapping("top-level config".to_string())),
        };

        for key in root.keys() {
            let known = key.as_str().is_some_and(|k| SECTIONS.contains(&k));
            if !known {
                return Err(ConfigError::UnknownSection(describe_key(key)));
            }
        }

        Ok(Self {
            receivers: decode_components(root.get("receivers"), ComponentKind::Receiver, factories)?,
            processors: decode_components(root.get("processors"), ComponentKind::Processor, factories)?,
            exporters: decode_components(root.get("exporters"), ComponentKind::Exporter, factories)?,
            tenants: decode_tenants(root.get("tenants"))?,
        })
    }
}

impl Validate for CollectorConfig {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        errors.ensure(!self.receivers.is_empty(), "at least one receiver must be configured");
        errors.ensure(!self.processors.is_empty(), "at least one processor must be configured");
        errors.ensure(!self.exporters.is_empty(), "at least one exporter must be configured");

        errors.merge_with_context("receivers", self.receivers.validate());
        errors.merge_with_context("processors", self.processors.validate());
        errors.merge_with_context("exporters", self.exporters.validate());

        for (name, tenant) in &self.tenants {
            let context = format!("tenant \"{name}\"");
            errors.merge_with_context(&context, tenant.validate());
            errors.merge_with_context(&context, tenant.validate_references(self));
        }
        errors.into_result()
    }
}

fn describe_key(key: &Value) -> String {
    match key.as_str() {
        Some(text) => text.to_string(),
        None => format!("{key:?}"),
    }
}

fn section<'a>(value: Option<&'a Value>, name: &str) -> Result<Option<&'a Mapping>, ConfigError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Mapping(map)) => Ok(Some(map)),
        Some(_) => Err(ConfigError::NotAMapping(name.to_string())),
    }
}

fn decode_components(
    value: Option<&Value>,
    kind: ComponentKind,
    factories: &Factories,
) -> Result<HashMap<ComponentId, Arc<dyn ComponentConfig>>, ConfigError> {
    let mut decoded = HashMap::new();
    let Some(map) = section(value, &format!("{kind}s"))? else {
        return Ok(decoded);
    };

    for (key, raw) in map {
        let text = key.as_str().ok_or_else(|| ConfigError::InvalidId {
            kind,
            key: describe_key(key),
            source: ComponentIdError::Empty,
        })?;
        let id = ComponentId::parse(text).map_err(|source| ConfigError::InvalidId {
            kind,
            key: text.to_string(),
            source,
        })?;
        let default = factories
            .default_config(kind, id.component_type())
            .ok_or_else(|| ConfigError::UnknownType { kind, id: id.clone() })?;
        let config = default.overlay(raw).map_err(|source| ConfigError::Decode {
            kind,
            id: id.clone(),
            source,
        })?;
        // "x/y" and " x / y " are different keys in YAML but the same id
        if decoded.insert(id.clone(), config).is_some() {
            return Err(ConfigError::DuplicateId { kind, id });
        }
    }
    Ok(decoded)
}

fn decode_tenants(value: Option<&Value>) -> Result<BTreeMap<String, TenantConfig>, ConfigError> {
    let mut tenants = BTreeMap::new();
    let Some(map) = section(value, "tenants")? else {
        return Ok(tenants);
    };

    for (key, raw) in map {
        let name = describe_key(key);
        let tenant = match raw {
            Value::Null => TenantConfig::default(),
            raw => serde_yaml::from_value(raw.clone())
                .map_err(|source| ConfigError::Tenant { tenant: name.clone(), source })?,
        };
        tenants.insert(name, tenant);
    }
    Ok(tenants)
}

fn parse_yaml(text: &str) -> Result<Value, ConfigError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_yaml::from_str(text)?)
}

/// Produces the raw YAML tree for the collector.
pub trait ConfigLoader: Send + Sync {
    fn load(&self) -> Result<Value, ConfigError>;
}

/// Reads the config from a YAML file on every load.
#[derive(Debug, Clone)]
pub struct FileConfigLoader {
    path: PathBuf,
}

impl FileConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigLoader for FileConfigLoader {
    fn load(&self) -> Result<Value, ConfigError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        parse_yaml(&text)
    }
}

/// Serves a config held in memory.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    yaml: String,
}

impl StaticConfigLoader {
    pub fn new(yaml: impl Into<String>) -> Self {
        Self { yaml: yaml.into() }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Value, ConfigError> {
        parse_yaml(&self.yaml)
    }
}

/// Source of the decoded collector configuration.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn get(&self, factories: &Factories) -> Result<CollectorConfig, ConfigError>;
}

/// Loads YAML through a [`ConfigLoader`] and decodes it against the factories.
#[derive(Debug, Clone)]
pub struct YamlConfigProvider<L> {
    loader: L,
}

impl<L: ConfigLoader> YamlConfigProvider<L> {
    pub fn new(loader: L) -> Self {
        Self { loader }
    }
}

impl YamlConfigProvider<FileConfigLoader> {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::new(FileConfigLoader::new(path))
    }
}

impl YamlConfigProvider<StaticConfigLoader> {
    pub fn from_yaml(yaml: impl Into<String>) -> Self {
        Self::new(StaticConfigLoader::new(yaml))
    }
}

#[async_trait]
impl<L: ConfigLoader> ConfigProvider for YamlConfigProvider<L> {
    async fn get(&self, factories: &Factories) -> Result<CollectorConfig, ConfigError> {
        let raw = self.loader.load()?;
        CollectorConfig::decode(&raw, factories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_factories, EventLog, TestComponentConfig};

    const VALID: &str = r#"
receivers:
  nop/in:
processors:
  nop:
    failOnStart: false
exporters:
  nop/out: {}
tenants:
  acme:
    receivers: [nop/in]
    processors: [nop]
    exporters: [nop/out]
"#;

    async fn decode(yaml: &str) -> Result<CollectorConfig, ConfigError> {
        let factories = test_factories(EventLog::default());
        YamlConfigProvider::from_yaml(yaml).get(&factories).await
    }

    fn id(text: &str) -> ComponentId {
        text.parse().unwrap()
    }

    #[tokio::test]
    async fn test_decode_valid_config() {
        let config = decode(VALID).await.unwrap();

        assert_eq!(config.receivers.len(), 1);
        assert_eq!(config.processors.len(), 1);
        assert_eq!(config.exporters.len(), 1);
        assert_eq!(config.tenants["acme"].processors, vec![id("nop")]);
        config.validate().unwrap();

        let processor = config.processors[&id("nop")]
            .downcast_ref::<TestComponentConfig>()
            .unwrap();
        assert!(!processor.fail_on_start);
    }

    #[tokio::test]
    async fn test_null_entry_uses_defaults() {
        let config = decode(VALID).await.unwrap();
        let receiver = config.receivers[&id("nop/in")]
            .downcast_ref::<TestComponentConfig>()
            .unwrap();
        assert_eq!(receiver, &TestComponentConfig::default());
    }

    #[tokio::test]
    async fn test_unknown_type_is_rejected() {
        let err = decode("receivers:\n  kafka/in:\n").await.unwrap_err();
        assert!(matches!(err, ConfigError::UnknownType { kind: ComponentKind::Receiver, .. }));
        assert!(err.to_string().contains("\"kafka\""));
    }

    #[tokio::test]
    async fn test_malformed_id_is_rejected() {
        let err = decode("exporters:\n  \"nop/\":\n").await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidId { kind: ComponentKind::Exporter, .. }));
    }

    #[tokio::test]
    async fn test_duplicate_id_after_trimming() {
        let err = decode("processors:\n  nop/a:\n  \" nop / a \":\n").await.unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateId { .. }));
    }

    #[tokio::test]
    async fn test_unknown_section_and_fields() {
        let err = decode("extensions: {}\n").await.unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSection(ref s) if s == "extensions"));

        let err = decode("processors:\n  nop:\n    bogus: 1\n").await.unwrap_err();
        assert!(matches!(err, ConfigError::Decode { .. }));

        let err = decode("tenants:\n  acme:\n    pipelines: []\n").await.unwrap_err();
        assert!(matches!(err, ConfigError::Tenant { .. }));
    }

    #[tokio::test]
    async fn test_unresolved_reference_names_the_id() {
        let yaml = VALID.replace("exporters: [nop/out]", "exporters: [nop/missing]");
        let config = decode(&yaml).await.unwrap();

        let err = config.validate().unwrap_err();
        assert!(err.contains("exporter \"nop/missing\" which is not configured"));
        assert!(err.contains("tenant \"acme\""));
    }

    #[tokio::test]
    async fn test_empty_sections_fail_validation() {
        let config = decode("").await.unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.contains("at least one receiver"));
        assert!(err.contains("at least one processor"));
        assert!(err.contains("at least one exporter"));
    }

    #[tokio::test]
    async fn test_tenant_lists_must_not_be_empty() {
        let yaml = VALID.replace("processors: [nop]", "processors: []");
        let err = decode(&yaml).await.unwrap().validate().unwrap_err();
        assert!(err.contains("must reference at least one processor"));
    }

    #[tokio::test]
    async fn test_missing_file_reports_path() {
        let factories = test_factories(EventLog::default());
        let err = YamlConfigProvider::from_file("/nonexistent/collector.yaml")
            .get(&factories)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/collector.yaml"));
    }
}
