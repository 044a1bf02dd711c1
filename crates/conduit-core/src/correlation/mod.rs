// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event correlation and triggers.
//!
//! An [`EventFilter`] matches a single event. A [`TriggerCondition`] groups
//! filters. A [`Trigger`] accumulates matching events into
//! [`CorrelationContext`]s keyed by the correlation attributes its filters
//! extract, and fires a context once its conditions are satisfied. The
//! [`CorrelationEngine`] routes inbound events through stored triggers and
//! hands fired contexts to an [`OutcomeRealizer`].
//!
//! Per context: `Open → Fired → Released`. Released contexts are removed
//! from the trigger; nothing transitions out of `Released`.

mod condition;
mod context;
mod engine;
mod filter;
mod outcome;
mod trigger;

pub use condition::{ConditionType, TriggerCondition};
pub use context::{ContextState, CorrelatedEvent, CorrelationContext};
pub use engine::{CorrelationEngine, FiredContext, IngestReport, TriggerFailure};
pub use filter::{CorrelationKeyDefinition, CorrelationKeys, EventFilter, pattern_matches};
pub use outcome::{OutcomeRealizer, Realization, StoreOutcomeRealizer, TRIGGER_LABEL};
pub use trigger::{
    CorrelationLifetime, CorrelationMode, CorrelationOutcome, Trigger, TriggerEvent, TriggerSpec,
    TriggerStatus, TriggerTransition,
};
