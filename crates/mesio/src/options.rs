//! Typed option store.
//!
//! Keys are flat strings (`hls-live-edge`, `http-headers`,
//! `plugin.<name>.<key>`). Every key has a default; session overrides sit
//! on top. Components read options lazily when they need them, so changes
//! made after construction apply to the next stream opened.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::buffer::DEFAULT_BUFFER_SIZE;
use crate::error::StreamError;

pub type OptionMap = BTreeMap<String, OptionValue>;

/// Options shared between the session and the streams it creates.
pub type SharedOptions = Arc<RwLock<Options>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    #[serde(with = "duration_secs")]
    Duration(Duration),
    List(Vec<OptionValue>),
    Map(OptionMap),
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Parse `"90"`, `"1.5"`, `"01:30"`, `"1:02:03"` or `"1h2m3s"` into a duration.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if let Ok(secs) = input.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }

    if input.contains(':') {
        let mut total = 0.0;
        let parts: Vec<&str> = input.split(':').collect();
        if parts.len() > 3 {
            return None;
        }
        for part in parts {
            total = total * 60.0 + part.parse::<f64>().ok()?;
        }
        return Duration::try_from_secs_f64(total).ok();
    }

    let mut total = 0.0;
    let mut number = String::new();
    for ch in input.chars() {
        match ch {
            '0'..='9' | '.' => number.push(ch),
            'h' | 'm' | 's' => {
                let value = number.parse::<f64>().ok()?;
                number.clear();
                total += value
                    * match ch {
                        'h' => 3600.0,
                        'm' => 60.0,
                        _ => 1.0,
                    };
            }
            _ => return None,
        }
    }
    if !number.is_empty() {
        return None;
    }
    Duration::try_from_secs_f64(total).ok()
}

impl OptionValue {
    pub fn is_null(&self) -> bool {
        matches!(self, OptionValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            OptionValue::Int(i) => Some(*i != 0),
            OptionValue::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Some(true),
                "false" | "no" | "0" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Integral value. Floats convert only when they have no fractional
    /// part, so `2.7` is rejected rather than truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OptionValue::Int(i) => Some(*i),
            OptionValue::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            OptionValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|i| u64::try_from(i).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OptionValue::Float(f) => Some(*f),
            OptionValue::Int(i) => Some(*i as f64),
            OptionValue::Duration(d) => Some(d.as_secs_f64()),
            OptionValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            OptionValue::Duration(d) => Some(*d),
            OptionValue::Int(i) => u64::try_from(*i).ok().map(Duration::from_secs),
            OptionValue::Float(f) => Duration::try_from_secs_f64(*f).ok(),
            OptionValue::String(s) => parse_duration(s),
            _ => None,
        }
    }

    /// Lists as-is; comma separated strings are split.
    pub fn as_list(&self) -> Option<Vec<OptionValue>> {
        match self {
            OptionValue::List(items) => Some(items.clone()),
            OptionValue::String(s) => Some(
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| OptionValue::String(s.to_string()))
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<Vec<String>> {
        self.as_list().map(|items| {
            items
                .iter()
                .filter_map(|v| match v {
                    OptionValue::String(s) => Some(s.clone()),
                    OptionValue::Int(i) => Some(i.to_string()),
                    OptionValue::Float(f) => Some(f.to_string()),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn as_map(&self) -> Option<&OptionMap> {
        match self {
            OptionValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// String pairs of a map value, e.g. HTTP headers.
    pub fn as_string_pairs(&self) -> Option<Vec<(String, String)>> {
        self.as_map().map(|map| {
            map.iter()
                .filter_map(|(k, v)| {
                    let value = match v {
                        OptionValue::String(s) => s.clone(),
                        OptionValue::Int(i) => i.to_string(),
                        OptionValue::Float(f) => f.to_string(),
                        OptionValue::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some((k.clone(), value))
                })
                .collect()
        })
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<u32> for OptionValue {
    fn from(value: u32) -> Self {
        OptionValue::Int(i64::from(value))
    }
}

impl From<usize> for OptionValue {
    fn from(value: usize) -> Self {
        OptionValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Float(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::String(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::String(value)
    }
}

impl From<Duration> for OptionValue {
    fn from(value: Duration) -> Self {
        OptionValue::Duration(value)
    }
}

impl From<Vec<OptionValue>> for OptionValue {
    fn from(value: Vec<OptionValue>) -> Self {
        OptionValue::List(value)
    }
}

impl From<OptionMap> for OptionValue {
    fn from(value: OptionMap) -> Self {
        OptionValue::Map(value)
    }
}

impl<T: Into<OptionValue>> From<Option<T>> for OptionValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(OptionValue::Null, Into::into)
    }
}

/// Defaults of every option the core understands.
pub fn session_defaults() -> Vec<(&'static str, OptionValue)> {
    vec![
        // HTTP
        ("http-headers", OptionValue::Map(OptionMap::new())),
        ("http-query-params", OptionValue::Map(OptionMap::new())),
        ("http-cookies", OptionValue::Map(OptionMap::new())),
        ("http-proxy", OptionValue::Null),
        ("http-timeout", OptionValue::Float(20.0)),
        ("http-ssl-verify", OptionValue::Bool(true)),
        ("http-disable-dh", OptionValue::Bool(false)),
        ("http-trust-env", OptionValue::Bool(true)),
        // Streams
        ("ringbuffer-size", DEFAULT_BUFFER_SIZE.into()),
        ("stream-timeout", OptionValue::Float(60.0)),
        ("stream-types", OptionValue::Null),
        ("mux-subtitles", OptionValue::Bool(false)),
        // HLS
        ("hls-live-edge", OptionValue::Int(3)),
        ("hls-live-restart", OptionValue::Bool(false)),
        ("hls-playlist-reload-attempts", OptionValue::Int(3)),
        ("hls-playlist-reload-time", OptionValue::from("default")),
        ("hls-playlist-timeout", OptionValue::Float(10.0)),
        ("hls-segment-queue-threshold", OptionValue::Float(3.0)),
        ("hls-segment-attempts", OptionValue::Int(3)),
        ("hls-segment-threads", OptionValue::Int(1)),
        ("hls-segment-timeout", OptionValue::Float(10.0)),
        ("hls-segment-stream-data", OptionValue::Bool(false)),
        ("hls-segment-ignore-names", OptionValue::List(Vec::new())),
        ("hls-segment-key-uri", OptionValue::Null),
        ("hls-start-offset", OptionValue::Null),
        ("hls-duration", OptionValue::Null),
    ]
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    defaults: FxHashMap<String, OptionValue>,
    overrides: FxHashMap<String, OptionValue>,
}

impl Options {
    /// An empty store with no defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults<K, I>(defaults: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, OptionValue)>,
    {
        Self {
            defaults: defaults.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            overrides: FxHashMap::default(),
        }
    }

    /// Store seeded with every core default.
    pub fn session() -> Self {
        Self::with_defaults(session_defaults())
    }

    /// Session defaults overridden by the entries of a JSON object.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, StreamError> {
        let object = value.as_object().ok_or_else(|| StreamError::InvalidOption {
            key: "<root>".to_string(),
            reason: "expected a JSON object".to_string(),
        })?;
        let mut options = Self::session();
        for (key, raw) in object {
            let value: OptionValue =
                serde_json::from_value(raw.clone()).map_err(|e| StreamError::InvalidOption {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            options.set(key.clone(), value);
        }
        Ok(options)
    }

    pub fn shared(self) -> SharedOptions {
        Arc::new(RwLock::new(self))
    }

    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        self.defaults.insert(key.into(), value.into());
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        self.overrides.insert(key.into(), value.into());
    }

    /// Drop the override so the default applies again.
    pub fn clear(&mut self, key: &str) {
        self.overrides.remove(key);
    }

    pub fn is_known(&self, key: &str) -> bool {
        self.defaults.contains_key(key) || self.overrides.contains_key(key)
    }

    /// Override if set, otherwise the default. Null counts as unset.
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.overrides
            .get(key)
            .or_else(|| self.defaults.get(key))
            .filter(|v| !v.is_null())
    }

    pub fn get_default(&self, key: &str) -> Option<&OptionValue> {
        self.defaults.get(key).filter(|v| !v.is_null())
    }

    /// Resolve `key` for a stream created by `plugin`.
    ///
    /// Precedence: `explicit` > session override > `plugin.<name>.<key>` >
    /// default.
    pub fn resolve(
        &self,
        key: &str,
        plugin: Option<&str>,
        explicit: Option<&OptionMap>,
    ) -> Option<OptionValue> {
        if let Some(value) = explicit.and_then(|m| m.get(key)).filter(|v| !v.is_null()) {
            return Some(value.clone());
        }
        if let Some(value) = self.overrides.get(key).filter(|v| !v.is_null()) {
            return Some(value.clone());
        }
        if let Some(name) = plugin {
            let namespaced = format!("plugin.{name}.{key}");
            if let Some(value) = self.get(&namespaced) {
                return Some(value.clone());
            }
        }
        self.get_default(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(OptionValue::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(OptionValue::as_i64)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(OptionValue::as_u64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(OptionValue::as_f64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(OptionValue::as_str)
    }

    pub fn get_duration(&self, key: &str) -> Option<Duration> {
        self.get(key).and_then(OptionValue::as_duration)
    }

    pub fn get_list(&self, key: &str) -> Option<Vec<OptionValue>> {
        self.get(key).and_then(OptionValue::as_list)
    }

    pub fn get_map(&self, key: &str) -> Option<&OptionMap> {
        self.get(key).and_then(OptionValue::as_map)
    }

    /// Snapshot of every key with its effective value.
    pub fn to_map(&self) -> OptionMap {
        let mut out = OptionMap::new();
        for (k, v) in &self.defaults {
            out.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.overrides {
            out.insert(k.clone(), v.clone());
        }
        out
    }
}
