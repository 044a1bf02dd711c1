// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CloudEvent envelope and attribute values.
//!
//! Events are immutable once built. Every attribute lookup the correlation
//! engine performs goes through [`Event::try_get`], which resolves the
//! CloudEvents context attributes, extension attributes, and `data.<path>`
//! lookups into object data.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// CloudEvents specification version emitted by [`Event::new`].
pub const SPEC_VERSION: &str = "1.0";

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// JSON null.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Numeric value.
    Number(serde_json::Number),
    /// String value.
    String(String),
}

impl AttributeValue {
    /// Convert a JSON value. Objects and arrays are kept as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.clone()),
            Value::String(s) => Self::String(s.clone()),
            other => Self::String(other.to_string()),
        }
    }

    /// Convert back into a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
        }
    }

    /// The textual form used for pattern matching.
    pub fn to_match_string(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::String(s) => s.clone(),
        }
    }

    /// Borrow the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

/// A CloudEvent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier, unique per source. Generated when absent.
    #[serde(default = "generate_id")]
    pub id: String,
    /// Event type (reverse-DNS or URI-like).
    #[serde(rename = "type")]
    pub event_type: String,
    /// URI of the producer; empty when the producer sent none.
    #[serde(default)]
    pub source: String,
    /// CloudEvents spec version.
    #[serde(default = "default_spec_version")]
    pub specversion: String,
    /// Subject of the event in the context of the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// When the occurrence happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Content type of `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Extension attributes.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, AttributeValue>,
}

impl Event {
    /// Create a new event with a generated id and the current time.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            event_type: event_type.into(),
            source: source.into(),
            specversion: default_spec_version(),
            subject: None,
            time: Some(Utc::now()),
            datacontenttype: None,
            data: None,
            extensions: BTreeMap::new(),
        }
    }

    /// Set the subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the JSON payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.datacontenttype = Some("application/json".to_string());
        self.data = Some(data);
        self
    }

    /// Add an extension attribute.
    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    /// Look up an attribute by name.
    ///
    /// Returns `None` when the attribute is not defined on the event.
    pub fn try_get(&self, name: &str) -> Option<AttributeValue> {
        match name {
            "id" => Some(self.id.as_str().into()),
            "type" => Some(self.event_type.as_str().into()),
            "source" => Some(self.source.as_str().into()),
            "specversion" => Some(self.specversion.as_str().into()),
            "subject" => self.subject.as_deref().map(Into::into),
            "time" => self
                .time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true).into()),
            "datacontenttype" => self.datacontenttype.as_deref().map(Into::into),
            "data" => self.data.as_ref().map(AttributeValue::from_json),
            _ => match name.strip_prefix("data.") {
                Some(path) => self.data_at(path).map(AttributeValue::from_json),
                None => self.extensions.get(name).cloned(),
            },
        }
    }

    /// Whether `other` has the same `(type, source)` identity.
    pub fn is_duplicate_of(&self, other: &Event) -> bool {
        self.event_type == other.event_type && self.source == other.source
    }

    fn data_at(&self, path: &str) -> Option<&Value> {
        let mut current = self.data.as_ref()?;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}
