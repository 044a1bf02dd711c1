// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event filters.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::event::{AttributeValue, Event};

/// Where a correlation key reads its value from, and what it must be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationKeyDefinition {
    /// Attribute name on the event (`data.<path>` reads into the payload).
    pub from: String,
    /// Expected value, when the key is also a constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<String>,
}

impl CorrelationKeyDefinition {
    /// Key read from the given attribute.
    pub fn from_attribute(attribute: impl Into<String>) -> Self {
        Self {
            from: attribute.into(),
            expect: None,
        }
    }

    /// Whether `value` satisfies the `expect` constraint (if any).
    pub fn accepts(&self, value: &AttributeValue) -> bool {
        self.expect
            .as_deref()
            .is_none_or(|expected| pattern_matches(expected, &value.to_match_string()))
    }
}

/// Correlation keys declared by a filter, by key name.
pub type CorrelationKeys = BTreeMap<String, CorrelationKeyDefinition>;

/// Matches a single event's attributes against patterns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Attribute name → expected value or anchored regular expression.
    #[serde(rename = "with", default)]
    pub attributes: BTreeMap<String, String>,
    /// Correlation key name → extraction rule.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub correlate: CorrelationKeys,
    #[serde(skip)]
    compiled: CompiledPatterns,
}

/// Regexes compiled from a filter's attribute patterns, keyed by pattern.
///
/// Filled on first use. Never part of equality.
#[derive(Debug, Clone, Default)]
struct CompiledPatterns(Arc<OnceLock<BTreeMap<String, Option<Regex>>>>);

impl CompiledPatterns {
    fn matches(&self, attributes: &BTreeMap<String, String>, pattern: &str, value: &str) -> bool {
        let compiled = self.0.get_or_init(|| {
            attributes
                .values()
                .map(|pattern| (pattern.clone(), compile(pattern)))
                .collect()
        });
        if trim_quotes(pattern) == value {
            return true;
        }
        match compiled.get(pattern) {
            Some(regex) => regex.as_ref().is_some_and(|re| re.is_match(value)),
            // Pattern added after the cache was filled.
            None => pattern_matches(pattern, value),
        }
    }
}

impl PartialEq for CompiledPatterns {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl Eq for CompiledPatterns {}

impl EventFilter {
    /// Empty filter (matches every event).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute constraint.
    pub fn with(mut self, attribute: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.attributes.insert(attribute.into(), pattern.into());
        self
    }

    /// Add a correlation key read from the attribute of the same name.
    pub fn correlate_on(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.correlate
            .insert(key.clone(), CorrelationKeyDefinition::from_attribute(key));
        self
    }

    /// Add a correlation key with an explicit definition.
    pub fn correlate_with(mut self, key: impl Into<String>, definition: CorrelationKeyDefinition) -> Self {
        self.correlate.insert(key.into(), definition);
        self
    }

    /// Whether every attribute constraint matches the event.
    ///
    /// An attribute missing from the event never matches.
    pub fn filters(&self, event: &Event) -> bool {
        self.attributes.iter().all(|(name, pattern)| {
            event.try_get(name).is_some_and(|value| {
                self.compiled
                    .matches(&self.attributes, pattern, &value.to_match_string())
            })
        })
    }

    /// The correlation keys this filter extracts.
    pub fn correlation_keys(&self) -> &CorrelationKeys {
        &self.correlate
    }
}

/// Strip one pair of surrounding quotes.
fn trim_quotes(pattern: &str) -> &str {
    let trimmed = pattern.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    trimmed
}

/// Exact match after trimming quotes, otherwise an anchored regex match.
///
/// A pattern that is not a valid regex only matches exactly.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    trim_quotes(pattern) == value || compile(pattern).is_some_and(|re| re.is_match(value))
}

fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(&format!("^(?:{})$", trim_quotes(pattern))).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_attribute_never_matches() {
        let filter = EventFilter::new().with("type", "order.created").with("region", ".*");
        let event = Event::new("order.created", "svc-a");
        assert!(!filter.filters(&event));
    }

    #[test]
    fn test_exact_and_regex_patterns() {
        let event = Event::new("order.created", "svc-a");
        assert!(EventFilter::new().with("type", "order.created").filters(&event));
        assert!(EventFilter::new().with("type", "order\\.created").filters(&event));
        assert!(EventFilter::new().with("type", "order\\..*").filters(&event));
        assert!(!EventFilter::new().with("type", "order").filters(&event));
        assert!(!EventFilter::new().with("type", "payment\\..*").filters(&event));
    }

    #[test]
    fn test_quoted_patterns_are_trimmed() {
        let event = Event::new("order.created", "svc-a");
        assert!(EventFilter::new().with("source", "\"svc-a\"").filters(&event));
        assert!(EventFilter::new().with("source", "'svc-a'").filters(&event));
    }

    #[test]
    fn test_invalid_regex_falls_back_to_equality() {
        let event = Event::new("weird(", "svc-a");
        assert!(EventFilter::new().with("type", "weird(").filters(&event));
        assert!(!EventFilter::new().with("type", "other(").filters(&event));
    }

    #[test]
    fn test_patterns_compile_once_per_filter() {
        let filter = EventFilter::new().with("type", "order\\..*");
        assert!(filter.filters(&Event::new("order.created", "svc-a")));
        let compiled = filter.compiled.0.get().unwrap();
        assert!(compiled["order\\..*"].is_some());

        // Clones share the compiled patterns; later edits still match.
        let mut edited = filter.clone();
        assert!(Arc::ptr_eq(&filter.compiled.0, &edited.compiled.0));
        edited.attributes.insert("type".to_string(), "payment\\..*".to_string());
        assert!(edited.filters(&Event::new("payment.completed", "svc-a")));
        assert!(!edited.filters(&Event::new("order.created", "svc-a")));
        assert_eq!(filter, EventFilter::new().with("type", "order\\..*"));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(EventFilter::new().filters(&Event::new("anything", "anywhere")));
    }

    #[test]
    fn test_filter_deserializes_with_and_correlate() {
        let filter: EventFilter = serde_json::from_value(json!({
            "with": {"type": "order\\.created"},
            "correlate": {"orderId": {"from": "orderId", "expect": "1.*"}}
        }))
        .unwrap();
        assert_eq!(filter.attributes.len(), 1);
        let key = &filter.correlation_keys()["orderId"];
        assert!(key.accepts(&"123".into()));
        assert!(!key.accepts(&"923".into()));
    }
}
