//! Component identifiers of the form `type` or `type/name`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SEPARATOR: char = '/';

/// Errors produced when parsing a component identifier
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComponentIdError {
    #[error("id must not be empty")]
    Empty,
    #[error("type part of id {0:?} must not be empty")]
    EmptyType(String),
    #[error("name part of id {0:?} must not be empty when '/' is present")]
    EmptyName(String),
    #[error("type {0:?} must not contain '/'")]
    InvalidType(String),
}

/// Names the factory that builds a component, e.g. `queue`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ComponentType(String);

impl ComponentType {
    pub fn new(ty: impl Into<String>) -> Result<Self, ComponentIdError> {
        let ty = ty.into();
        let trimmed = ty.trim();
        if trimmed.is_empty() {
            return Err(ComponentIdError::EmptyType(ty));
        }
        if trimmed.contains(SEPARATOR) {
            return Err(ComponentIdError::InvalidType(ty));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// For types spelled as literals in factory code.
    ///
    /// The literal must be non-empty and free of `/`; this is checked in debug builds.
    pub fn from_static(ty: &'static str) -> Self {
        debug_assert!(
            !ty.trim().is_empty() && !ty.contains(SEPARATOR),
            "invalid component type literal {ty:?}"
        );
        Self(ty.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ComponentType {
    type Error = ComponentIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ComponentType> for String {
    fn from(ty: ComponentType) -> Self {
        ty.0
    }
}

/// Identifies one configured component instance.
///
/// The textual form is `type` or `type/name`. Only the first `/` separates the
/// two parts, so `x/y/z` has type `x` and name `y/z`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ComponentId {
    ty: ComponentType,
    name: String,
}

impl ComponentId {
    /// An id with no name part.
    pub fn new(ty: ComponentType) -> Self {
        Self {
            ty,
            name: String::new(),
        }
    }

    pub fn with_name(ty: ComponentType, name: impl Into<String>) -> Result<Self, ComponentIdError> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(ComponentIdError::EmptyName(format!("{ty}{SEPARATOR}{name}")));
        }
        Ok(Self {
            ty,
            name: trimmed.to_string(),
        })
    }

    /// Parses `type` or `type/name`, trimming whitespace around both parts.
    pub fn parse(text: &str) -> Result<Self, ComponentIdError> {
        if text.is_empty() {
            return Err(ComponentIdError::Empty);
        }

        let Some((ty, name)) = text.split_once(SEPARATOR) else {
            let ty = text.trim();
            if ty.is_empty() {
                return Err(ComponentIdError::EmptyType(text.to_string()));
            }
            return Ok(Self {
                ty: ComponentType(ty.to_string()),
                name: String::new(),
            });
        };

        let ty = ty.trim();
        if ty.is_empty() {
            return Err(ComponentIdError::EmptyType(text.to_string()));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(ComponentIdError::EmptyName(text.to_string()));
        }

        Ok(Self {
            ty: ComponentType(ty.to_string()),
            name: name.to_string(),
        })
    }

    pub fn component_type(&self) -> &ComponentType {
        &self.ty
    }

    /// Empty when the id has no name part.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.ty)
        } else {
            write!(f, "{}{SEPARATOR}{}", self.ty, self.name)
        }
    }
}

impl FromStr for ComponentId {
    type Err = ComponentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ComponentId {
    type Error = ComponentIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ComponentId> for String {
    fn from(id: ComponentId) -> Self {
        id.to_string()
    }
}
