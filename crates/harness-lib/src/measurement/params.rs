//! Typed access to measurement parameters

use crate::error::{HarnessError, Result};
use crate::models::Selector;
use serde_json::{Map, Value};
use std::time::Duration;

/// Parameters of a measurement step
///
/// Lookups are exact first, then case-insensitive, since layered
/// configuration sources may fold key case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Map<String, Value>);

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object; anything else yields empty params
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Merge `other` on top of `self`
    pub fn merged(&self, other: &Params) -> Params {
        let mut map = self.0.clone();
        for (k, v) in &other.0 {
            map.insert(k.clone(), v.clone());
        }
        Params(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).or_else(|| {
            self.0
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        match self.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(type_error(key, "string", other)),
            None => Err(missing(key)),
        }
    }

    pub fn get_string_or_default(&self, key: &str, default: &str) -> Result<String> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(default.to_string()),
            Some(_) => self.get_string(key),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        match self.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .ok_or_else(|| type_error(key, "integer", &Value::Number(n.clone()))),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map_err(|_| type_error(key, "integer", &Value::String(s.clone()))),
            Some(other) => Err(type_error(key, "integer", other)),
            None => Err(missing(key)),
        }
    }

    pub fn get_int_or_default(&self, key: &str, default: i64) -> Result<i64> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(_) => self.get_int(key),
        }
    }

    pub fn get_bool_or_default(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => s
                .parse()
                .map_err(|_| type_error(key, "bool", &Value::String(s.clone()))),
            Some(other) => Err(type_error(key, "bool", other)),
        }
    }

    /// Durations are humantime strings such as `30s` or `5m`
    pub fn get_duration_or_default(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::String(s)) => humantime::parse_duration(s)
                .map_err(|e| HarnessError::Config(format!("param {key}: invalid duration {s:?}: {e}"))),
            Some(other) => Err(type_error(key, "duration", other)),
        }
    }

    /// `namespace`, `labelSelector` and `fieldSelector`, all optional
    pub fn selector(&self) -> Result<Selector> {
        let namespace = self.get_string_or_default("namespace", "")?;
        Ok(Selector::new(
            Some(namespace),
            self.get_string_or_default("labelSelector", "")?,
            self.get_string_or_default("fieldSelector", "")?,
        ))
    }
}

fn missing(key: &str) -> HarnessError {
    HarnessError::Config(format!("missing param {key}"))
}

fn type_error(key: &str, expected: &str, got: &Value) -> HarnessError {
    HarnessError::Config(format!("param {key}: expected {expected}, got {got}"))
}
