//! Component factories and the per-kind builders that resolve ids to instances.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::component::{ComponentError, ComponentKind, CreateSettings, Exporter, Processor, Receiver};
use crate::component_id::{ComponentId, ComponentType};
use crate::confmap::ComponentConfig;
use crate::consumer::Consumer;

/// Common surface of every factory.
pub trait Factory: Send + Sync {
    /// The type part of the ids this factory builds.
    fn component_type(&self) -> ComponentType;

    /// Fully-populated config that user YAML is overlaid onto.
    fn create_default_config(&self) -> Arc<dyn ComponentConfig>;
}

pub trait ReceiverFactory: Factory {
    fn create_traces_receiver(
        &self,
        settings: &CreateSettings,
        config: &dyn ComponentConfig,
        next: Arc<dyn Consumer>,
    ) -> Result<Arc<dyn Receiver>, ComponentError>;
}

pub trait ProcessorFactory: Factory {
    fn create_traces_processor(
        &self,
        settings: &CreateSettings,
        config: &dyn ComponentConfig,
        next: Arc<dyn Consumer>,
    ) -> Result<Arc<dyn Processor>, ComponentError>;
}

pub trait ExporterFactory: Factory {
    fn create_traces_exporter(
        &self,
        settings: &CreateSettings,
        config: &dyn ComponentConfig,
    ) -> Result<Arc<dyn Exporter>, ComponentError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FactoryError {
    #[error("duplicate factory for component type {0:?}")]
    Duplicate(ComponentType),
}

/// Indexes factories by component type, rejecting duplicates.
pub fn make_factory_map<F>(
    factories: impl IntoIterator<Item = Arc<F>>,
) -> Result<HashMap<ComponentType, Arc<F>>, FactoryError>
where
    F: Factory + ?Sized,
{
    let mut map = HashMap::new();
    for factory in factories {
        let ty = factory.component_type();
        if map.contains_key(&ty) {
            return Err(FactoryError::Duplicate(ty));
        }
        map.insert(ty, factory);
    }
    Ok(map)
}

/// Every factory the collector knows, by kind.
#[derive(Clone, Default)]
pub struct Factories {
    pub receivers: HashMap<ComponentType, Arc<dyn ReceiverFactory>>,
    pub processors: HashMap<ComponentType, Arc<dyn ProcessorFactory>>,
    pub exporters: HashMap<ComponentType, Arc<dyn ExporterFactory>>,
}

impl Factories {
    /// Default config for `ty` of the given kind, if a factory exists.
    pub fn default_config(&self, kind: ComponentKind, ty: &ComponentType) -> Option<Arc<dyn ComponentConfig>> {
        match kind {
            ComponentKind::Receiver => self.receivers.get(ty).map(|f| f.create_default_config()),
            ComponentKind::Processor => self.processors.get(ty).map(|f| f.create_default_config()),
            ComponentKind::Exporter => self.exporters.get(ty).map(|f| f.create_default_config()),
        }
    }
}

/// Error types for resolving a component id to an instance
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{kind} {id} is not configured")]
    NotConfigured { kind: ComponentKind, id: ComponentId },
    #[error("{kind} factory not available for {id}")]
    FactoryNotAvailable { kind: ComponentKind, id: ComponentId },
    #[error("failed to create {kind} {id}: {source}")]
    Create {
        kind: ComponentKind,
        id: ComponentId,
        #[source]
        source: ComponentError,
    },
}

type ConfigMap = HashMap<ComponentId, Arc<dyn ComponentConfig>>;

fn resolve<'a, F: ?Sized>(
    kind: ComponentKind,
    id: &ComponentId,
    configs: &'a ConfigMap,
    factories: &'a HashMap<ComponentType, Arc<F>>,
) -> Result<(&'a dyn ComponentConfig, &'a F), BuildError> {
    let config = configs.get(id).ok_or_else(|| BuildError::NotConfigured {
        kind,
        id: id.clone(),
    })?;
    let factory = factories
        .get(id.component_type())
        .ok_or_else(|| BuildError::FactoryNotAvailable {
            kind,
            id: id.clone(),
        })?;
    Ok((config.as_ref(), factory.as_ref()))
}

fn create_error(kind: ComponentKind, id: &ComponentId) -> impl FnOnce(ComponentError) -> BuildError + '_ {
    move |source| BuildError::Create {
        kind,
        id: id.clone(),
        source,
    }
}

/// Creates receivers from the decoded configs.
#[derive(Clone)]
pub struct ReceiverBuilder {
    configs: ConfigMap,
    factories: HashMap<ComponentType, Arc<dyn ReceiverFactory>>,
}

impl ReceiverBuilder {
    pub fn new(configs: ConfigMap, factories: HashMap<ComponentType, Arc<dyn ReceiverFactory>>) -> Self {
        Self { configs, factories }
    }

    pub fn create(&self, settings: &CreateSettings, next: Arc<dyn Consumer>) -> Result<Arc<dyn Receiver>, BuildError> {
        let kind = ComponentKind::Receiver;
        let (config, factory) = resolve(kind, &settings.id, &self.configs, &self.factories)?;
        factory
            .create_traces_receiver(settings, config, next)
            .map_err(create_error(kind, &settings.id))
    }
}

/// Creates processors from the decoded configs.
#[derive(Clone)]
pub struct ProcessorBuilder {
    configs: ConfigMap,
    factories: HashMap<ComponentType, Arc<dyn ProcessorFactory>>,
}

impl ProcessorBuilder {
    pub fn new(configs: ConfigMap, factories: HashMap<ComponentType, Arc<dyn ProcessorFactory>>) -> Self {
        Self { configs, factories }
    }

    pub fn create(&self, settings: &CreateSettings, next: Arc<dyn Consumer>) -> Result<Arc<dyn Processor>, BuildError> {
        let kind = ComponentKind::Processor;
        let (config, factory) = resolve(kind, &settings.id, &self.configs, &self.factories)?;
        factory
            .create_traces_processor(settings, config, next)
            .map_err(create_error(kind, &settings.id))
    }
}

/// Creates exporters from the decoded configs.
#[derive(Clone)]
pub struct ExporterBuilder {
    configs: ConfigMap,
    factories: HashMap<ComponentType, Arc<dyn ExporterFactory>>,
}

impl ExporterBuilder {
    pub fn new(configs: ConfigMap, factories: HashMap<ComponentType, Arc<dyn ExporterFactory>>) -> Self {
        Self { configs, factories }
    }

    pub fn create(&self, settings: &CreateSettings) -> Result<Arc<dyn Exporter>, BuildError> {
        let kind = ComponentKind::Exporter;
        let (config, factory) = resolve(kind, &settings.id, &self.configs, &self.factories)?;
        factory
            .create_traces_exporter(settings, config)
            .map_err(create_error(kind, &settings.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EventLog, TestFactory};

    fn id(text: &str) -> ComponentId {
        text.parse().unwrap()
    }

    #[test]
    fn test_factory_map_rejects_duplicates() {
        let events = EventLog::default();
        let a: Arc<dyn ProcessorFactory> = Arc::new(TestFactory::new("nop", events.clone()));
        let b: Arc<dyn ProcessorFactory> = Arc::new(TestFactory::new("nop", events.clone()));
        let c: Arc<dyn ProcessorFactory> = Arc::new(TestFactory::new("other", events));

        let err = make_factory_map([a.clone(), b]).err().unwrap();
        assert_eq!(err, FactoryError::Duplicate(ComponentType::new("nop").unwrap()));

        let map = make_factory_map([a, c]).unwrap();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_builder_reports_missing_config_and_factory() {
        let events = EventLog::default();
        let factory = Arc::new(TestFactory::new("nop", events));
        let default_config = Factory::create_default_config(factory.as_ref());

        let mut configs = ConfigMap::new();
        configs.insert(id("nop/a"), default_config.clone());
        configs.insert(id("ghost"), default_config);

        let factories = make_factory_map([factory as Arc<dyn ExporterFactory>]).unwrap();
        let builder = ExporterBuilder::new(configs, factories);

        assert!(builder.create(&CreateSettings::new(id("nop/a"), "t")).is_ok());

        let err = builder.create(&CreateSettings::new(id("nop/b"), "t")).err().unwrap();
        assert_eq!(err.to_string(), "exporter nop/b is not configured");

        let err = builder.create(&CreateSettings::new(id("ghost"), "t")).err().unwrap();
        assert_eq!(err.to_string(), "exporter factory not available for ghost");
    }

    #[test]
    fn test_default_config_lookup_by_kind() {
        let factory = Arc::new(TestFactory::new("nop", EventLog::default()));
        let factories = Factories {
            receivers: make_factory_map([factory.clone() as Arc<dyn ReceiverFactory>]).unwrap(),
            ..Factories::default()
        };
        let ty = ComponentType::new("nop").unwrap();

        assert!(factories.default_config(ComponentKind::Receiver, &ty).is_some());
        assert!(factories.default_config(ComponentKind::Exporter, &ty).is_none());
    }
}
