// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger conditions.

use serde::{Deserialize, Serialize};

use super::context::CorrelationContext;
use super::filter::EventFilter;
use crate::event::Event;

/// How a trigger combines its conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionType {
    /// Any condition satisfies the trigger.
    #[default]
    AnyOf,
    /// Every condition must be satisfied, possibly by different events.
    AllOf,
}

/// An ordered group of filters; satisfied when any filter matches.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TriggerCondition {
    /// Filters, evaluated in order.
    pub filters: Vec<EventFilter>,
}

impl TriggerCondition {
    /// Create a condition from filters.
    pub fn new(filters: Vec<EventFilter>) -> Self {
        Self { filters }
    }

    /// Whether any filter matches the event.
    pub fn matches(&self, event: &Event) -> bool {
        self.filters.iter().any(|f| f.filters(event))
    }

    /// First filter (in list order) matching the event.
    pub fn matching_filter_for(&self, event: &Event) -> Option<&EventFilter> {
        self.filters.iter().find(|f| f.filters(event))
    }

    /// Whether any event recorded in the context satisfies any filter.
    pub fn matches_context(&self, context: &CorrelationContext) -> bool {
        context.events.iter().any(|e| self.matches(&e.event))
    }
}
