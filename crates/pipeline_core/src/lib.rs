//! Pipeline core for the multi-tenant trace collector
//!
//! Provides the component model (receivers, processors, exporters), the YAML
//! configuration layer, and the per-tenant pipeline graph that wires components
//! together and drives their lifecycle.
//!
//! Each tenant gets its own [`Service`], which owns a [`Graph`]:
//!
//! ```text
//! receivers -> processor_1 -> ... -> processor_N -> fan-out -> exporters
//! ```
//!
//! The [`Collector`] loads configuration, builds one service per tenant, and
//! shuts everything down on signal or cancellation.

pub mod collector;
pub mod component;
pub mod component_id;
pub mod config;
pub mod confmap;
pub mod consumer;
pub mod error;
pub mod factory;
pub mod fanout;
pub mod graph;
pub mod pdata;
pub mod service;
pub mod validate;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export main types
pub use collector::{Collector, CollectorError, CollectorSettings, RunHandle};
pub use component::{
    Component, ComponentError, ComponentKind, CreateSettings, Exporter, Processor, Receiver,
};
pub use component_id::{ComponentId, ComponentIdError, ComponentType};
pub use config::{
    CollectorConfig, ConfigError, ConfigLoader, ConfigProvider, FileConfigLoader,
    StaticConfigLoader, TenantConfig, YamlConfigProvider,
};
pub use confmap::ComponentConfig;
pub use consumer::{Consumer, ConsumerError};
pub use error::{BoxError, MultiError};
pub use factory::{
    make_factory_map, BuildError, ExporterBuilder, ExporterFactory, Factories, Factory,
    FactoryError, ProcessorBuilder, ProcessorFactory, ReceiverBuilder, ReceiverFactory,
};
pub use fanout::FanOut;
pub use graph::{Graph, GraphError, GraphSettings};
pub use pdata::{AttributeValue, InvalidSpan, Span, TenantInfo, TraceData, Traces, Ttl};
pub use service::{Service, ServiceError, ServiceState};
pub use validate::{Validate, ValidationErrors};
