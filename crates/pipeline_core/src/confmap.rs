//! Typed component configs over a generic YAML tree.
//!
//! Every factory hands out a default config. The user-supplied section for a
//! component is overlaid onto that default (maps merge key by key, everything
//! else is replaced, `null` keeps the default) and the result is decoded back
//! into the factory's concrete type.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::validate::Validate;

/// A decoded, type-erased component configuration.
///
/// Implemented automatically for every `Serialize + DeserializeOwned + Validate`
/// type; factories downcast back to their own type with
/// [`downcast_ref`](trait.ComponentConfig.html#method.downcast_ref).
pub trait ComponentConfig: Validate + fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    /// Overlays `raw` on top of this config and decodes the result as the same type.
    fn overlay(&self, raw: &Value) -> Result<Arc<dyn ComponentConfig>, serde_yaml::Error>;
}

impl<T> ComponentConfig for T
where
    T: Validate + Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn overlay(&self, raw: &Value) -> Result<Arc<dyn ComponentConfig>, serde_yaml::Error> {
        let mut base = serde_yaml::to_value(self)?;
        merge(&mut base, raw);
        let decoded: T = serde_yaml::from_value(base)?;
        Ok(Arc::new(decoded))
    }
}

impl dyn ComponentConfig {
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Deep-merges `overlay` into `base`.
pub fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Serde adapter for durations written as integer milliseconds or humantime
/// strings (`250ms`, `5s`, `1m 30s`). Serializes as a humantime string.
pub mod duration {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(text) => humantime::parse_duration(text.trim())
                .map_err(|e| D::Error::custom(format!("invalid duration {text:?}: {e}"))),
        }
    }
}

/// Serde adapter for string lists written as a sequence or a comma-separated string.
pub mod string_list {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    pub fn serialize<S: Serializer>(value: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        let items = match Raw::deserialize(deserializer)? {
            Raw::One(text) => text.split(',').map(str::to_string).collect(),
            Raw::Many(items) => items,
        };
        Ok(items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }
}
