//! Structural validation of decoded configuration.
//!
//! Every config type checks its own fields and then descends into nested
//! values. Containers forward to their elements so nested configs are reached
//! without per-type walking code; scalars are always valid.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::component_id::{ComponentId, ComponentType};

/// Implemented by every config value that can be checked after decoding.
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationErrors>;
}

/// All problems found while validating a value, joined with `"; "`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{}", .errors.join("; "))]
pub struct ValidationErrors {
    errors: Vec<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Records `message` unless `condition` holds.
    pub fn ensure(&mut self, condition: bool, message: impl Into<String>) {
        if !condition {
            self.push(message);
        }
    }

    /// Absorbs the failures of a nested validation.
    pub fn merge(&mut self, result: Result<(), ValidationErrors>) {
        if let Err(nested) = result {
            self.errors.extend(nested.errors);
        }
    }

    /// Absorbs the failures of a nested validation, prefixing each with `context`.
    pub fn merge_with_context(&mut self, context: impl fmt::Display, result: Result<(), ValidationErrors>) {
        if let Err(nested) = result {
            self.errors
                .extend(nested.errors.into_iter().map(|e| format!("{context}: {e}")));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(String::as_str)
    }

    /// Returns true if any message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.errors.iter().any(|e| e.contains(needle))
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl<T: Validate + ?Sized> Validate for Box<T> {
    fn validate(&self) -> Result<(), ValidationErrors> {
        (**self).validate()
    }
}

impl<T: Validate + ?Sized> Validate for Arc<T> {
    fn validate(&self) -> Result<(), ValidationErrors> {
        (**self).validate()
    }
}

impl<T: Validate + ?Sized> Validate for &T {
    fn validate(&self) -> Result<(), ValidationErrors> {
        (**self).validate()
    }
}

impl<T: Validate> Validate for Option<T> {
    fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            Some(value) => value.validate(),
            None => Ok(()),
        }
    }
}

impl<T: Validate> Validate for [T] {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        for (i, item) in self.iter().enumerate() {
            errors.merge_with_context(format_args!("[{i}]"), item.validate());
        }
        errors.into_result()
    }
}

impl<T: Validate> Validate for Vec<T> {
    fn validate(&self) -> Result<(), ValidationErrors> {
        self.as_slice().validate()
    }
}

impl<T: Validate, const N: usize> Validate for [T; N] {
    fn validate(&self) -> Result<(), ValidationErrors> {
        self.as_slice().validate()
    }
}

impl<K, V, S> Validate for HashMap<K, V, S>
where
    K: Validate + fmt::Display + Ord,
    V: Validate,
    S: BuildHasher,
{
    fn validate(&self) -> Result<(), ValidationErrors> {
        // Sorted so messages come out in a stable order
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        validate_entries(entries)
    }
}

impl<K, V> Validate for BTreeMap<K, V>
where
    K: Validate + fmt::Display,
    V: Validate,
{
    fn validate(&self) -> Result<(), ValidationErrors> {
        validate_entries(self.iter())
    }
}

fn validate_entries<'a, K, V>(entries: impl IntoIterator<Item = (&'a K, &'a V)>) -> Result<(), ValidationErrors>
where
    K: Validate + fmt::Display + 'a,
    V: Validate + 'a,
{
    let mut errors = ValidationErrors::new();
    for (key, value) in entries {
        errors.merge_with_context(key, key.validate());
        errors.merge_with_context(key, value.validate());
    }
    errors.into_result()
}

macro_rules! always_valid {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Validate for $ty {
                fn validate(&self) -> Result<(), ValidationErrors> {
                    Ok(())
                }
            }
        )*
    };
}

always_valid!(
    bool, u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64, char, String, str,
    Duration, ComponentId, ComponentType,
);
