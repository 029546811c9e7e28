use super::telemetry::TelemetryItem;
use crate::sender::SerializationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const MAX_NAME_LENGTH: usize = 1024;
pub const MAX_TAG_KEY_LENGTH: usize = 64;
pub const MAX_TAG_VALUE_LENGTH: usize = 1024;
pub const MAX_PROPERTY_KEY_LENGTH: usize = 150;
pub const MAX_PROPERTY_VALUE_LENGTH: usize = 8192;
pub const MAX_MESSAGE_LENGTH: usize = 32768;

/// A generic telemetry record.
///
/// The envelope carries the routing fields every record shares and keeps the
/// type-specific payload as free-form JSON under `data.baseData`, so requests,
/// dependencies, traces and metrics all travel through the same type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "iKey", default, skip_serializing_if = "Option::is_none")]
    pub instrumentation_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub data: EnvelopeData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeData {
    #[serde(rename = "baseType")]
    pub base_type: String,
    #[serde(rename = "baseData")]
    pub base_data: Value,
}

impl Envelope {
    pub fn new(name: impl Into<String>, base_type: impl Into<String>, base_data: Value) -> Self {
        Self {
            name: name.into(),
            time: Utc::now(),
            instrumentation_key: None,
            tags: BTreeMap::new(),
            data: EnvelopeData {
                base_type: base_type.into(),
                base_data,
            },
        }
    }

    /// A trace (log message) record.
    pub fn trace(message: impl Into<String>) -> Self {
        Self::new(
            "Message",
            "MessageData",
            serde_json::json!({ "ver": 2, "message": message.into() }),
        )
    }

    /// A custom event record.
    pub fn event(name: impl Into<String>) -> Self {
        Self::new(
            "Event",
            "EventData",
            serde_json::json!({ "ver": 2, "name": name.into() }),
        )
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    pub fn with_instrumentation_key(mut self, key: impl Into<String>) -> Self {
        self.instrumentation_key = Some(key.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Adds a custom property under `baseData.properties`.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if !self.data.base_data.is_object() {
            self.data.base_data = Value::Object(Map::new());
        }
        if let Value::Object(base) = &mut self.data.base_data {
            let properties = base
                .entry("properties")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(properties) = properties {
                properties.insert(key.into(), Value::String(value.into()));
            }
        }
        self
    }
}

impl TelemetryItem for Envelope {
    fn timestamp(&self) -> DateTime<Utc> {
        self.time
    }

    fn sanitize(&mut self) {
        truncate_in_place(&mut self.name, MAX_NAME_LENGTH);

        if self
            .tags
            .iter()
            .any(|(k, v)| k.chars().count() > MAX_TAG_KEY_LENGTH || v.chars().count() > MAX_TAG_VALUE_LENGTH)
        {
            let tags = std::mem::take(&mut self.tags);
            self.tags = sanitize_map(tags, MAX_TAG_KEY_LENGTH, MAX_TAG_VALUE_LENGTH);
        }

        if let Value::Object(base) = &mut self.data.base_data {
            if let Some(Value::String(message)) = base.get_mut("message") {
                truncate_in_place(message, MAX_MESSAGE_LENGTH);
            }
            if let Some(Value::Object(properties)) = base.get_mut("properties") {
                let entries: BTreeMap<String, String> = std::mem::take(properties)
                    .into_iter()
                    .map(|(k, v)| match v {
                        Value::String(s) => (k, s),
                        other => (k, other.to_string()),
                    })
                    .collect();
                *properties = sanitize_map(entries, MAX_PROPERTY_KEY_LENGTH, MAX_PROPERTY_VALUE_LENGTH)
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect();
            }
        }
    }

    fn serialize(&self) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Truncates keys and values; keys that collide after truncation get a
/// numeric suffix so no entry is silently overwritten.
fn sanitize_map(
    map: BTreeMap<String, String>,
    max_key: usize,
    max_value: usize,
) -> BTreeMap<String, String> {
    let mut sanitized = BTreeMap::new();
    for (key, mut value) in map {
        truncate_in_place(&mut value, max_value);
        let key = truncate(&key, max_key);
        let key = if sanitized.contains_key(&key) {
            unique_key(&sanitized, &key, max_key)
        } else {
            key
        };
        sanitized.insert(key, value);
    }
    sanitized
}

fn unique_key(existing: &BTreeMap<String, String>, key: &str, max_key: usize) -> String {
    let mut counter = 1u32;
    loop {
        let suffix = format!("{counter:03}");
        let base = truncate(key, max_key.saturating_sub(suffix.len()));
        let candidate = format!("{base}{suffix}");
        if !existing.contains_key(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

fn truncate_in_place(value: &mut String, max_chars: usize) {
    if let Some((idx, _)) = value.char_indices().nth(max_chars) {
        value.truncate(idx);
    }
}
