// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The trigger aggregate and its reducer.
//!
//! Every mutating operation takes `&self` and returns a [`TriggerTransition`]
//! carrying the next trigger value, the domain events it produced and the
//! contexts that fired. Callers persist `transition.trigger` and only then act
//! on the fired contexts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::condition::{ConditionType, TriggerCondition};
use super::context::{ContextState, CorrelationContext};
use super::filter::CorrelationKeys;
use crate::definition::{DurationDefinition, WorkflowReference};
use crate::error::CorrelationError;
use crate::event::Event;
use crate::resource::{Resource, ResourceMetadata};

/// How events are distributed over open contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationMode {
    /// A single open context at a time. Events that do not correlate to it
    /// are ignored until it fires or expires.
    #[default]
    Exclusive,
    /// Any number of concurrent contexts. An event advances every context it
    /// correlates to, or opens a new one.
    Parallel,
}

/// Whether a trigger survives its first fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationLifetime {
    /// Kept until explicitly deleted.
    #[default]
    Durable,
    /// Deleted once it has fired.
    Ephemeral,
}

/// What happens when a context fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CorrelationOutcome {
    /// Start a new instance of a workflow.
    Start {
        /// Workflow to instantiate.
        workflow: WorkflowReference,
        /// Instance input. Defaults to the correlated events.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    /// Deliver the context to a waiting task of an existing instance.
    Correlate {
        /// Instance id.
        instance: String,
        /// Correlation key the instance waits on (the task id).
        key: String,
    },
}

/// Immutable trigger definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    /// Context distribution mode.
    #[serde(default)]
    pub mode: CorrelationMode,
    /// Lifetime.
    #[serde(default)]
    pub lifetime: CorrelationLifetime,
    /// How conditions combine.
    #[serde(default)]
    pub condition_type: ConditionType,
    /// Ordered conditions.
    pub conditions: Vec<TriggerCondition>,
    /// Outcome realized when a context fires.
    pub outcome: CorrelationOutcome,
    /// Maximum time a context may stay active before being evicted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DurationDefinition>,
}

impl TriggerSpec {
    /// Durable exclusive trigger with `AnyOf` conditions.
    pub fn new(conditions: Vec<TriggerCondition>, outcome: CorrelationOutcome) -> Self {
        Self {
            mode: CorrelationMode::default(),
            lifetime: CorrelationLifetime::default(),
            condition_type: ConditionType::default(),
            conditions,
            outcome,
            expiration: None,
        }
    }

    /// Set the condition type.
    pub fn with_condition_type(mut self, condition_type: ConditionType) -> Self {
        self.condition_type = condition_type;
        self
    }

    /// Set the mode.
    pub fn with_mode(mut self, mode: CorrelationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the lifetime.
    pub fn with_lifetime(mut self, lifetime: CorrelationLifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Set the context expiration.
    pub fn with_expiration(mut self, expiration: DurationDefinition) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

/// Mutable trigger state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStatus {
    /// Open and fired (not yet released) contexts.
    #[serde(default)]
    pub contexts: Vec<CorrelationContext>,
    /// How many contexts have fired.
    #[serde(default)]
    pub fired: u64,
    /// When a context last fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
}

/// Domain event produced by a trigger transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    /// A context was opened.
    ContextCreated {
        /// Context id.
        context_id: String,
    },
    /// An event was recorded in a context.
    ContextCorrelated {
        /// Context id.
        context_id: String,
        /// Event id.
        event_id: String,
    },
    /// A context satisfied the trigger's conditions.
    Fired {
        /// Context id.
        context_id: String,
    },
    /// A context was removed.
    ContextReleased {
        /// Context id.
        context_id: String,
    },
    /// A context was removed because it outlived its maximum active duration.
    ContextExpired {
        /// Context id.
        context_id: String,
    },
}

/// Result of a trigger operation.
#[derive(Debug, Clone)]
pub struct TriggerTransition {
    /// Next trigger value.
    pub trigger: Trigger,
    /// Events produced, in order.
    pub events: Vec<TriggerEvent>,
    /// Contexts that fired during this transition.
    pub fired: Vec<CorrelationContext>,
}

impl TriggerTransition {
    fn unchanged(trigger: &Trigger) -> Self {
        Self {
            trigger: trigger.clone(),
            events: Vec::new(),
            fired: Vec::new(),
        }
    }
}

/// Declarative rule mapping event patterns to a workflow start or resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Resource metadata.
    pub metadata: ResourceMetadata,
    /// Definition.
    pub spec: TriggerSpec,
    /// State.
    #[serde(default)]
    pub status: TriggerStatus,
}

impl Resource for Trigger {
    const KIND: &'static str = "Trigger";

    fn metadata(&self) -> &ResourceMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ResourceMetadata {
        &mut self.metadata
    }
}

impl Trigger {
    /// Create a trigger with no contexts.
    pub fn new(metadata: ResourceMetadata, spec: TriggerSpec) -> Self {
        Self {
            metadata,
            spec,
            status: TriggerStatus::default(),
        }
    }

    /// First condition (in list order) matching the event.
    pub fn matching_condition_for(&self, event: &Event) -> Option<&TriggerCondition> {
        self.spec.conditions.iter().find(|c| c.matches(event))
    }

    /// Correlation keys of the first filter matching the event.
    pub fn correlation_keys_for(&self, event: &Event) -> Option<CorrelationKeys> {
        self.matching_condition_for(event)
            .and_then(|c| c.matching_filter_for(event))
            .map(|f| f.correlation_keys().clone())
    }

    /// Whether the context satisfies the trigger's conditions.
    pub fn try_fire_in(&self, context: &CorrelationContext) -> bool {
        if self.spec.conditions.is_empty() {
            return false;
        }
        match self.spec.condition_type {
            ConditionType::AnyOf => self.spec.conditions.iter().any(|c| c.matches_context(context)),
            ConditionType::AllOf => self.spec.conditions.iter().all(|c| c.matches_context(context)),
        }
    }

    /// A context by id.
    pub fn context(&self, context_id: &str) -> Option<&CorrelationContext> {
        self.status.contexts.iter().find(|c| c.id == context_id)
    }

    /// Contexts still accepting events.
    pub fn open_contexts(&self) -> impl Iterator<Item = &CorrelationContext> {
        self.status.contexts.iter().filter(|c| c.is_open())
    }

    /// Maximum active duration of a context, falling back to `default`.
    pub fn max_active_duration(&self, default: Option<Duration>) -> Option<Duration> {
        self.spec
            .expiration
            .as_ref()
            .map(DurationDefinition::to_std)
            .or(default)
    }

    /// Open a new context bootstrapped with the event.
    pub fn create_context(
        &self,
        event: &Event,
        keys: &CorrelationKeys,
        now: DateTime<Utc>,
    ) -> Result<TriggerTransition, CorrelationError> {
        let context = CorrelationContext::new(now).correlate(event, keys, true, now)?;
        let mut transition = TriggerTransition::unchanged(self);
        transition.events.push(TriggerEvent::ContextCreated {
            context_id: context.id.clone(),
        });
        transition.events.push(TriggerEvent::ContextCorrelated {
            context_id: context.id.clone(),
            event_id: event.id.clone(),
        });
        transition.trigger.status.contexts.push(context);
        let index = transition.trigger.status.contexts.len() - 1;
        transition.fire_if_satisfied(index, now);
        Ok(transition)
    }

    /// Record the event in the first open context it correlates to.
    pub fn correlate(
        &self,
        event: &Event,
        keys: &CorrelationKeys,
        now: DateTime<Utc>,
    ) -> Result<TriggerTransition, CorrelationError> {
        let index = self
            .status
            .contexts
            .iter()
            .position(|c| c.correlates_to(event, keys))
            .ok_or_else(|| CorrelationError::NoMatchingContext {
                trigger: self.id(),
                event_id: event.id.clone(),
            })?;
        let mut transition = TriggerTransition::unchanged(self);
        transition.correlate_at(&[index], event, keys, now)?;
        Ok(transition)
    }

    /// Route an event through the trigger according to its mode.
    ///
    /// Returns `None` when no condition matches the event or the event is
    /// ignored (exclusive mode with a non-correlating open context).
    pub fn evaluate(
        &self,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<Option<TriggerTransition>, CorrelationError> {
        let Some(keys) = self.correlation_keys_for(event) else {
            return Ok(None);
        };
        let correlating: Vec<usize> = self
            .status
            .contexts
            .iter()
            .enumerate()
            .filter(|(_, c)| c.correlates_to(event, &keys))
            .map(|(i, _)| i)
            .collect();

        if correlating.is_empty() {
            if self.spec.mode == CorrelationMode::Exclusive && self.open_contexts().next().is_some() {
                return Ok(None);
            }
            return self.create_context(event, &keys, now).map(Some);
        }

        let targets = match self.spec.mode {
            CorrelationMode::Exclusive => &correlating[..1],
            CorrelationMode::Parallel => &correlating[..],
        };
        let mut transition = TriggerTransition::unchanged(self);
        transition.correlate_at(targets, event, &keys, now)?;
        Ok(Some(transition))
    }

    /// Remove a context.
    pub fn release_context(&self, context_id: &str) -> Result<TriggerTransition, CorrelationError> {
        let index = self
            .status
            .contexts
            .iter()
            .position(|c| c.id == context_id)
            .ok_or_else(|| CorrelationError::ContextNotFound {
                trigger: self.id(),
                context_id: context_id.to_string(),
            })?;
        let mut transition = TriggerTransition::unchanged(self);
        transition.trigger.status.contexts.remove(index);
        transition.events.push(TriggerEvent::ContextReleased {
            context_id: context_id.to_string(),
        });
        Ok(transition)
    }

    /// Remove contexts older than the maximum active duration.
    pub fn evict_expired(&self, now: DateTime<Utc>, default: Option<Duration>) -> TriggerTransition {
        let mut transition = TriggerTransition::unchanged(self);
        let Some(ttl) = self
            .max_active_duration(default)
            .and_then(|d| chrono::Duration::from_std(d).ok())
        else {
            return transition;
        };
        transition.trigger.status.contexts.retain(|c| {
            let alive = now - c.created_at <= ttl;
            if !alive {
                transition.events.push(TriggerEvent::ContextExpired {
                    context_id: c.id.clone(),
                });
            }
            alive
        });
        transition
    }
}

impl TriggerTransition {
    fn correlate_at(
        &mut self,
        indices: &[usize],
        event: &Event,
        keys: &CorrelationKeys,
        now: DateTime<Utc>,
    ) -> Result<(), CorrelationError> {
        for &index in indices {
            let next = self.trigger.status.contexts[index].correlate(event, keys, true, now)?;
            self.events.push(TriggerEvent::ContextCorrelated {
                context_id: next.id.clone(),
                event_id: event.id.clone(),
            });
            self.trigger.status.contexts[index] = next;
            self.fire_if_satisfied(index, now);
        }
        Ok(())
    }

    fn fire_if_satisfied(&mut self, index: usize, now: DateTime<Utc>) {
        let context = &self.trigger.status.contexts[index];
        if !context.is_open() || !self.trigger.try_fire_in(context) {
            return;
        }
        let context = &mut self.trigger.status.contexts[index];
        context.state = ContextState::Fired;
        context.last_modified = now;
        let fired = context.clone();
        self.trigger.status.fired += 1;
        self.trigger.status.last_fired_at = Some(now);
        self.events.push(TriggerEvent::Fired {
            context_id: fired.id.clone(),
        });
        self.fired.push(fired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::filter::EventFilter;

    fn outcome() -> CorrelationOutcome {
        CorrelationOutcome::Correlate {
            instance: "i.default".to_string(),
            key: "t".to_string(),
        }
    }

    fn conditions() -> Vec<TriggerCondition> {
        vec![
            TriggerCondition::new(vec![
                EventFilter::new().with("type", "order\\.created").correlate_on("orderId"),
            ]),
            TriggerCondition::new(vec![
                EventFilter::new().with("type", "payment\\.completed").correlate_on("orderId"),
            ]),
        ]
    }

    fn trigger(condition_type: ConditionType, mode: CorrelationMode) -> Trigger {
        Trigger::new(
            ResourceMetadata::new("orders", "default"),
            TriggerSpec::new(conditions(), outcome())
                .with_condition_type(condition_type)
                .with_mode(mode),
        )
    }

    fn order(order_id: &str) -> Event {
        Event::new("order.created", "svc-a").with_extension("orderId", order_id)
    }

    fn payment(order_id: &str) -> Event {
        Event::new("payment.completed", "svc-b").with_extension("orderId", order_id)
    }

    #[test]
    fn test_any_of_versus_all_of() {
        let now = Utc::now();
        let any = trigger(ConditionType::AnyOf, CorrelationMode::Exclusive);
        let all = trigger(ConditionType::AllOf, CorrelationMode::Exclusive);
        let keys = any.correlation_keys_for(&order("1")).unwrap();
        let context = CorrelationContext::new(now).correlate(&order("1"), &keys, true, now).unwrap();
        assert!(any.try_fire_in(&context));
        assert!(!all.try_fire_in(&context));
    }

    #[test]
    fn test_all_of_fires_once_both_conditions_are_seen() {
        let now = Utc::now();
        let t = trigger(ConditionType::AllOf, CorrelationMode::Exclusive);
        let first = t.evaluate(&order("123"), now).unwrap().unwrap();
        assert!(first.fired.is_empty());
        assert_eq!(first.trigger.status.contexts.len(), 1);

        let second = first.trigger.evaluate(&payment("123"), now).unwrap().unwrap();
        assert_eq!(second.fired.len(), 1);
        assert_eq!(second.trigger.status.fired, 1);
        assert!(second.events.contains(&TriggerEvent::Fired {
            context_id: second.fired[0].id.clone()
        }));
        assert_eq!(second.trigger.status.contexts[0].state, ContextState::Fired);
        // The original value is untouched
        assert_eq!(first.trigger.status.fired, 0);
    }

    #[test]
    fn test_exclusive_ignores_non_correlating_events_while_open() {
        let now = Utc::now();
        let t = trigger(ConditionType::AllOf, CorrelationMode::Exclusive);
        let first = t.evaluate(&order("1"), now).unwrap().unwrap();
        assert!(first.trigger.evaluate(&payment("2"), now).unwrap().is_none());
    }

    #[test]
    fn test_parallel_opens_one_context_per_key() {
        let now = Utc::now();
        let t = trigger(ConditionType::AllOf, CorrelationMode::Parallel);
        let first = t.evaluate(&order("1"), now).unwrap().unwrap();
        let second = first.trigger.evaluate(&order("2"), now).unwrap().unwrap();
        assert_eq!(second.trigger.status.contexts.len(), 2);
        let third = second.trigger.evaluate(&payment("2"), now).unwrap().unwrap();
        assert_eq!(third.fired.len(), 1);
        assert_eq!(third.fired[0].attributes["orderId"], "2".into());
    }

    #[test]
    fn test_unrelated_event_is_not_evaluated() {
        let t = trigger(ConditionType::AnyOf, CorrelationMode::Parallel);
        let event = Event::new("user.created", "svc-c");
        assert!(t.evaluate(&event, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn test_correlate_without_matching_context_fails() {
        let t = trigger(ConditionType::AllOf, CorrelationMode::Exclusive);
        let keys = t.correlation_keys_for(&order("1")).unwrap();
        let err = t.correlate(&order("1"), &keys, Utc::now()).unwrap_err();
        assert!(matches!(err, CorrelationError::NoMatchingContext { .. }));
    }

    #[test]
    fn test_release_and_expire_contexts() {
        let now = Utc::now();
        let t = trigger(ConditionType::AllOf, CorrelationMode::Parallel);
        let opened = t.evaluate(&order("1"), now).unwrap().unwrap().trigger;
        let id = opened.status.contexts[0].id.clone();

        let released = opened.release_context(&id).unwrap();
        assert!(released.trigger.status.contexts.is_empty());
        assert!(matches!(
            released.trigger.release_context(&id),
            Err(CorrelationError::ContextNotFound { .. })
        ));

        let later = now + chrono::Duration::seconds(120);
        let kept = opened.evict_expired(later, Some(Duration::from_secs(300)));
        assert_eq!(kept.trigger.status.contexts.len(), 1);
        let evicted = opened.evict_expired(later, Some(Duration::from_secs(60)));
        assert!(evicted.trigger.status.contexts.is_empty());
        assert_eq!(evicted.events, vec![TriggerEvent::ContextExpired { context_id: id }]);
    }

    #[test]
    fn test_fired_context_accepts_no_more_events() {
        let now = Utc::now();
        let t = trigger(ConditionType::AnyOf, CorrelationMode::Parallel);
        let fired = t.evaluate(&order("1"), now).unwrap().unwrap();
        assert_eq!(fired.fired.len(), 1);
        let next = fired.trigger.evaluate(&payment("1"), now).unwrap().unwrap();
        // A new context is opened rather than re-firing the fired one
        assert_eq!(next.trigger.status.contexts.len(), 2);
    }
}
