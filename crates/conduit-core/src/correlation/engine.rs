// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation engine.
//!
//! Routes inbound events through every stored trigger. Each trigger is
//! evaluated under its own async mutex, so concurrent events never lose an
//! update to the same trigger's contexts, while different triggers progress
//! independently. Persistence goes through [`mutate`], which re-runs the
//! reducer against the latest stored copy when another writer got there
//! first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use super::context::CorrelationContext;
use super::outcome::{OutcomeRealizer, Realization};
use super::trigger::{CorrelationLifetime, Trigger, TriggerEvent, TriggerTransition};
use crate::config::CoreConfig;
use crate::error::{CoreError, CorrelationError, Result};
use crate::event::Event;
use crate::resource::Resource;
use crate::store::{ResourceStore, mutate};

/// A context that fired and had its outcome realized.
#[derive(Debug, Clone)]
pub struct FiredContext {
    /// Trigger the context belonged to.
    pub trigger_id: String,
    /// The context as it was when it fired.
    pub context: CorrelationContext,
    /// What realizing the outcome produced.
    pub realization: Realization,
}

/// A trigger that failed to process an event.
#[derive(Debug)]
pub struct TriggerFailure {
    /// Trigger id.
    pub trigger_id: String,
    /// The error.
    pub error: CoreError,
}

/// Result of ingesting one event.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Contexts that fired.
    pub fired: Vec<FiredContext>,
    /// Triggers that failed. Other triggers were still evaluated.
    pub failures: Vec<TriggerFailure>,
}

/// Evaluates events against triggers and realizes their outcomes.
pub struct CorrelationEngine {
    triggers: Arc<dyn ResourceStore<Trigger>>,
    realizer: Arc<dyn OutcomeRealizer>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    max_active_duration: Option<Duration>,
}

impl CorrelationEngine {
    /// Create an engine without a default context expiration.
    pub fn new(triggers: Arc<dyn ResourceStore<Trigger>>, realizer: Arc<dyn OutcomeRealizer>) -> Self {
        Self {
            triggers,
            realizer,
            locks: Mutex::new(HashMap::new()),
            max_active_duration: None,
        }
    }

    /// Create an engine configured from [`CoreConfig`].
    pub fn from_config(
        config: &CoreConfig,
        triggers: Arc<dyn ResourceStore<Trigger>>,
        realizer: Arc<dyn OutcomeRealizer>,
    ) -> Self {
        Self::new(triggers, realizer).with_max_active_duration(config.correlation_max_active)
    }

    /// Set the default maximum active duration of contexts.
    ///
    /// Triggers declaring their own expiration override it.
    pub fn with_max_active_duration(mut self, duration: Option<Duration>) -> Self {
        self.max_active_duration = duration;
        self
    }

    /// The trigger store.
    pub fn triggers(&self) -> &Arc<dyn ResourceStore<Trigger>> {
        &self.triggers
    }

    fn lock_for(&self, trigger_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(trigger_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn forget_lock(&self, trigger_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(trigger_id);
    }

    /// Evaluate the event against every trigger.
    ///
    /// A failing trigger does not prevent the others from being evaluated.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn ingest(&self, event: &Event) -> Result<IngestReport> {
        let triggers = self.triggers.list(None).await?;
        let mut report = IngestReport::default();
        for trigger in triggers {
            if trigger.matching_condition_for(event).is_none() {
                continue;
            }
            let trigger_id = trigger.id();
            match self.evaluate(&trigger_id, event).await {
                Ok(fired) => report.fired.extend(fired),
                Err(e) => {
                    warn!(trigger = %trigger_id, error = %e, "Failed to correlate event");
                    report.failures.push(TriggerFailure {
                        trigger_id,
                        error: e,
                    });
                }
            }
        }
        debug!(
            fired = report.fired.len(),
            failures = report.failures.len(),
            "Event ingested"
        );
        Ok(report)
    }

    /// Evaluate the event against a single trigger.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn evaluate(&self, trigger_id: &str, event: &Event) -> Result<Vec<FiredContext>> {
        let lock = self.lock_for(trigger_id);
        let _guard = lock.lock().await;
        let now = Utc::now();

        let transition = self
            .commit(trigger_id, |trigger| Ok(trigger.evaluate(event, now)?))
            .await?;
        match transition {
            Some(transition) => self.settle(trigger_id, transition).await,
            None => Ok(Vec::new()),
        }
    }

    /// Open a context on a trigger, bootstrapped with the event.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn create_context(&self, trigger_id: &str, event: &Event) -> Result<Vec<FiredContext>> {
        let lock = self.lock_for(trigger_id);
        let _guard = lock.lock().await;
        let now = Utc::now();

        let transition = self
            .commit(trigger_id, |trigger| {
                let keys = trigger.correlation_keys_for(event).unwrap_or_default();
                Ok(Some(trigger.create_context(event, &keys, now)?))
            })
            .await?;
        match transition {
            Some(transition) => self.settle(trigger_id, transition).await,
            None => Ok(Vec::new()),
        }
    }

    /// Release (abandon) a context.
    #[instrument(skip(self))]
    pub async fn release_context(&self, trigger_id: &str, context_id: &str) -> Result<()> {
        let lock = self.lock_for(trigger_id);
        let _guard = lock.lock().await;
        self.commit(trigger_id, |trigger| Ok(Some(trigger.release_context(context_id)?)))
            .await?;
        Ok(())
    }

    /// Evict expired contexts from every trigger. Returns how many were evicted.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut evicted = 0;
        for trigger in self.triggers.list(None).await? {
            let trigger_id = trigger.id();
            let lock = self.lock_for(&trigger_id);
            let _guard = lock.lock().await;
            let default = self.max_active_duration;
            let transition = self
                .commit(&trigger_id, |trigger| {
                    let transition = trigger.evict_expired(now, default);
                    Ok((!transition.events.is_empty()).then_some(transition))
                })
                .await;
            match transition {
                Ok(Some(transition)) => {
                    for event in &transition.events {
                        if let TriggerEvent::ContextExpired { context_id } = event {
                            info!(trigger = %trigger_id, context_id = %context_id, "Correlation context expired");
                            evicted += 1;
                        }
                    }
                }
                Ok(None) => {}
                // Deleted between list and lock
                Err(CoreError::Correlation(CorrelationError::TriggerNotFound(_))) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(evicted)
    }

    /// Periodically evict expired contexts until `shutdown` is notified.
    pub async fn run_expiry_sweeper(self: Arc<Self>, interval: Duration, shutdown: Arc<Notify>) {
        info!(interval_secs = interval.as_secs(), "Correlation expiry sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Correlation expiry sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep_expired(Utc::now()).await {
                        error!(error = %e, "Failed to sweep expired correlation contexts");
                    }
                }
            }
        }
    }

    /// Run `reduce` against the stored trigger and persist its result.
    ///
    /// The returned transition is the one that was actually committed.
    async fn commit<F>(&self, trigger_id: &str, mut reduce: F) -> Result<Option<TriggerTransition>>
    where
        F: FnMut(&Trigger) -> Result<Option<TriggerTransition>> + Send,
    {
        let mut committed = None;
        let saved = mutate(&*self.triggers, trigger_id, |trigger: &Trigger| {
            committed = reduce(trigger)?;
            Ok::<_, CoreError>(committed.as_ref().map(|t| t.trigger.clone()))
        })
        .await?;
        let saved = saved.ok_or_else(|| CorrelationError::TriggerNotFound(trigger_id.to_string()))?;
        Ok(committed.map(|mut transition| {
            transition.trigger = saved;
            transition
        }))
    }

    /// Realize the outcome of every fired context, then release it.
    async fn settle(&self, trigger_id: &str, transition: TriggerTransition) -> Result<Vec<FiredContext>> {
        for event in &transition.events {
            debug!(trigger = %trigger_id, event = ?event, "Trigger transition");
        }
        if transition.fired.is_empty() {
            return Ok(Vec::new());
        }

        let mut fired = Vec::with_capacity(transition.fired.len());
        let mut first_error = None;
        for context in transition.fired {
            match self.realizer.realize(&transition.trigger, &context).await {
                Ok(realization) => fired.push(FiredContext {
                    trigger_id: trigger_id.to_string(),
                    context: context.clone(),
                    realization,
                }),
                Err(e) => {
                    error!(
                        trigger = %trigger_id,
                        context_id = %context.id,
                        error = %e,
                        "Failed to realize trigger outcome"
                    );
                    first_error.get_or_insert(e);
                }
            }
            // Fired contexts never re-fire, so they are released whether or not
            // the outcome could be realized.
            if transition.trigger.spec.lifetime == CorrelationLifetime::Durable {
                self.commit(trigger_id, |trigger| match trigger.release_context(&context.id) {
                    Ok(t) => Ok(Some(t)),
                    Err(CorrelationError::ContextNotFound { .. }) => Ok(None),
                    Err(e) => Err(e.into()),
                })
                .await?;
            }
        }

        if transition.trigger.spec.lifetime == CorrelationLifetime::Ephemeral {
            self.triggers.delete(trigger_id).await?;
            self.forget_lock(trigger_id);
            info!(trigger = %trigger_id, "Deleted ephemeral trigger after firing");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(fired),
        }
    }
}
