use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::component_id::ComponentId;
use crate::consumer::Consumer;
use crate::error::{BoxError, MultiError};
use crate::validate::ValidationErrors;

/// The three roles a configured component can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentKind {
    Receiver,
    Processor,
    Exporter,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Receiver => "receiver",
            ComponentKind::Processor => "processor",
            ComponentKind::Exporter => "exporter",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Passed to factories when a component instance is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSettings {
    pub id: ComponentId,
    /// Tenant whose pipeline owns the component
    pub tenant: String,
}

impl CreateSettings {
    pub fn new(id: ComponentId, tenant: impl Into<String>) -> Self {
        Self {
            id,
            tenant: tenant.into(),
        }
    }
}

/// Error types for component creation and lifecycle
#[derive(Debug, Error)]
pub enum ComponentError {
    /// The config handed to a factory is not the factory's own type
    #[error("{id}: unexpected config type, expected {expected}")]
    ConfigType {
        id: ComponentId,
        expected: &'static str,
    },
    #[error("{id}: invalid config: {source}")]
    InvalidConfig {
        id: ComponentId,
        #[source]
        source: ValidationErrors,
    },
    #[error("{id}: {source}")]
    Failed {
        id: ComponentId,
        #[source]
        source: BoxError,
    },
    #[error(transparent)]
    Multiple(#[from] MultiError),
}

impl ComponentError {
    pub fn failed(id: &ComponentId, source: impl Into<BoxError>) -> Self {
        Self::Failed {
            id: id.clone(),
            source: source.into(),
        }
    }

    pub fn invalid_config(id: &ComponentId, source: ValidationErrors) -> Self {
        Self::InvalidConfig {
            id: id.clone(),
            source,
        }
    }
}

/// Lifecycle shared by every component.
///
/// `start` may spawn background work and must return promptly. `shutdown`
/// releases resources and flushes buffered data; calling it twice is harmless.
#[async_trait]
pub trait Component: Send + Sync {
    async fn start(&self) -> Result<(), ComponentError>;

    async fn shutdown(&self) -> Result<(), ComponentError>;
}

/// Pulls data from an external source and pushes it to its next consumer.
pub trait Receiver: Component {}

/// Transforms or buffers traces between receivers and exporters.
pub trait Processor: Component + Consumer {}

/// Writes traces to a sink.
pub trait Exporter: Component + Consumer {}
