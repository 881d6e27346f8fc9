//! Handler rules: the flat property set pushed to configurable interceptors.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DispatchError, DispatchResult};

/// Rule key listing additional interceptors to instantiate by name.
pub const LOAD_KEY: &str = "load";

/// Flat `key → value` rule set. Replaced wholesale, never merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerRules {
    properties: BTreeMap<String, String>,
}

impl HandlerRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Boolean rule; accepts `true/false`, `yes/no`, `on/off`, `1/0`.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)?.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.trim().parse().ok()
    }

    /// Duration rule expressed in whole seconds.
    pub fn get_secs(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).map(Duration::from_secs)
    }

    /// Comma-separated list rule with blanks dropped.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of interceptors to instantiate from the catalog.
    pub fn load(&self) -> Vec<String> {
        self.get_list(LOAD_KEY)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Build rules from a flat JSON object. Scalars are stringified, arrays of
    /// scalars are joined with commas; nested objects are rejected.
    pub fn from_json(value: &Value) -> DispatchResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| DispatchError::InvalidRules("rules must be a JSON object".into()))?;

        let mut rules = Self::new();
        for (key, value) in object {
            let text = match value {
                Value::Array(items) => items
                    .iter()
                    .map(|item| scalar_text(key, item))
                    .collect::<DispatchResult<Vec<_>>>()?
                    .join(","),
                other => scalar_text(key, other)?,
            };
            rules.set(key.clone(), text);
        }
        Ok(rules)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.properties
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }
}

fn scalar_text(key: &str, value: &Value) -> DispatchResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        _ => Err(DispatchError::InvalidRules(format!(
            "value of {key} must be a scalar"
        ))),
    }
}
