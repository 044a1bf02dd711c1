// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation contexts.
//!
//! A context accumulates correlation-attribute values extracted from the
//! events that belong to it. Attribute values are set exactly once per key
//! and never overwritten. Operations return a new context value; nothing is
//! mutated in place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::filter::CorrelationKeys;
use crate::error::CorrelationError;
use crate::event::{AttributeValue, Event};

/// State of a context. Released contexts are removed from their trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    /// Accepting events.
    #[default]
    Open,
    /// Conditions satisfied; the outcome is being realized.
    Fired,
}

/// An event recorded in a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedEvent {
    /// The event.
    pub event: Event,
    /// When it was correlated.
    pub correlated_at: DateTime<Utc>,
    /// Whether it was recorded as a bootstrap event.
    pub bootstrap: bool,
}

/// Partial event-matching state en route to firing a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationContext {
    /// Context id.
    pub id: String,
    /// Correlation key → value, each set once from the first event supplying it.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Recorded events, in correlation order.
    pub events: Vec<CorrelatedEvent>,
    /// Lifecycle state.
    #[serde(default)]
    pub state: ContextState,
    /// When the context was opened.
    pub created_at: DateTime<Utc>,
    /// When the context last changed.
    pub last_modified: DateTime<Utc>,
}

impl CorrelationContext {
    /// Open an empty context.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            attributes: BTreeMap::new(),
            events: Vec::new(),
            state: ContextState::Open,
            created_at: now,
            last_modified: now,
        }
    }

    /// Whether the context still accepts events.
    pub fn is_open(&self) -> bool {
        self.state == ContextState::Open
    }

    /// Whether the event belongs to this context.
    ///
    /// An event duplicating the `(type, source)` of a recorded event never
    /// correlates. Otherwise every attribute already present in the context
    /// must equal the event's value for that key; keys not yet present are
    /// not checked. A key's `expect` constraint must hold when the event
    /// supplies the key.
    pub fn correlates_to(&self, event: &Event, keys: &CorrelationKeys) -> bool {
        if !self.is_open() || self.events.iter().any(|e| e.event.is_duplicate_of(event)) {
            return false;
        }
        keys.iter().all(|(key, definition)| {
            let value = event.try_get(&definition.from);
            if let Some(value) = &value
                && !definition.accepts(value)
            {
                return false;
            }
            match self.attributes.get(key) {
                Some(expected) => value.as_ref() == Some(expected),
                None => true,
            }
        })
    }

    /// Record the event, extracting every key not yet present.
    ///
    /// Fails if the event lacks the attribute a missing key reads from.
    pub fn correlate(
        &self,
        event: &Event,
        keys: &CorrelationKeys,
        bootstrap: bool,
        now: DateTime<Utc>,
    ) -> Result<CorrelationContext, CorrelationError> {
        let mut next = self.clone();
        for (key, definition) in keys {
            if next.attributes.contains_key(key) {
                continue;
            }
            let value = event
                .try_get(&definition.from)
                .ok_or_else(|| CorrelationError::MissingAttribute {
                    event_id: event.id.clone(),
                    attribute: definition.from.clone(),
                })?;
            next.attributes.insert(key.clone(), value);
        }
        next.events.push(CorrelatedEvent {
            event: event.clone(),
            correlated_at: now,
            bootstrap,
        });
        next.last_modified = now;
        Ok(next)
    }

    /// The recorded events' payloads as JSON.
    pub fn event_payloads(&self) -> Vec<serde_json::Value> {
        self.events
            .iter()
            .map(|e| serde_json::to_value(&e.event).unwrap_or(serde_json::Value::Null))
            .collect()
    }
}
