// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Realization of trigger outcomes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::context::CorrelationContext;
use super::trigger::{CorrelationOutcome, Trigger};
use crate::definition::Workflow;
use crate::error::{CoreError, CorrelationError, Result};
use crate::instance::WorkflowInstance;
use crate::resource::{Resource, ResourceMetadata};
use crate::store::{ResourceStore, mutate};

/// Label set on instances started by a trigger.
pub const TRIGGER_LABEL: &str = "conduit.io/trigger";

/// What realizing an outcome produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Realization {
    /// A new instance was created.
    Started {
        /// Instance id.
        instance_id: String,
    },
    /// The context was delivered to an existing instance.
    Correlated {
        /// Instance id.
        instance_id: String,
        /// Correlation key.
        key: String,
    },
}

/// Realizes the outcome of a fired context.
#[async_trait]
pub trait OutcomeRealizer: Send + Sync {
    /// Realize `trigger`'s outcome for a fired context.
    async fn realize(&self, trigger: &Trigger, context: &CorrelationContext) -> Result<Realization>;
}

/// Realizes outcomes by writing workflow instances to the resource store.
pub struct StoreOutcomeRealizer {
    workflows: Arc<dyn ResourceStore<Workflow>>,
    instances: Arc<dyn ResourceStore<WorkflowInstance>>,
}

impl StoreOutcomeRealizer {
    /// Create a realizer over the given stores.
    pub fn new(
        workflows: Arc<dyn ResourceStore<Workflow>>,
        instances: Arc<dyn ResourceStore<WorkflowInstance>>,
    ) -> Self {
        Self { workflows, instances }
    }
}

#[async_trait]
impl OutcomeRealizer for StoreOutcomeRealizer {
    async fn realize(&self, trigger: &Trigger, context: &CorrelationContext) -> Result<Realization> {
        match &trigger.spec.outcome {
            CorrelationOutcome::Start { workflow, input } => {
                let definition = self
                    .workflows
                    .find(&workflow.id())
                    .await?
                    .ok_or_else(|| CorrelationError::WorkflowNotFound(workflow.to_string()))?;
                let input = input
                    .clone()
                    .unwrap_or_else(|| json!({ "events": context.event_payloads() }));
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                let metadata = ResourceMetadata::new(
                    format!("{}-{}", definition.spec.document.name, &suffix[..8]),
                    definition.spec.document.namespace.clone(),
                )
                .with_label(TRIGGER_LABEL, trigger.metadata.name.clone());
                let instance = self
                    .instances
                    .create(WorkflowInstance::new(metadata, definition.reference(), input))
                    .await?;
                info!(
                    trigger = %trigger.id(),
                    context_id = %context.id,
                    instance_id = %instance.id(),
                    "Started workflow instance from trigger"
                );
                Ok(Realization::Started {
                    instance_id: instance.id(),
                })
            }
            CorrelationOutcome::Correlate { instance, key } => {
                let updated = mutate(&*self.instances, instance, |current: &WorkflowInstance| {
                    if current.status.phase.is_terminal() {
                        return Err(CoreError::from(CorrelationError::InstanceUnavailable(
                            instance.clone(),
                        )));
                    }
                    match current.status.correlation.get(key) {
                        Some(delivered) if delivered.id == context.id => return Ok(None),
                        Some(_) => {
                            return Err(CoreError::from(CorrelationError::AlreadyCorrelated {
                                instance_id: instance.clone(),
                                key: key.clone(),
                            }));
                        }
                        None => {}
                    }
                    let mut next = current.clone();
                    next.status.correlation.insert(key.clone(), context.clone());
                    Ok(Some(next))
                })
                .await?;
                if updated.is_none() {
                    return Err(CorrelationError::InstanceUnavailable(instance.clone()).into());
                }
                info!(
                    trigger = %trigger.id(),
                    context_id = %context.id,
                    instance_id = %instance,
                    key = %key,
                    "Delivered correlation context to instance"
                );
                Ok(Realization::Correlated {
                    instance_id: instance.clone(),
                    key: key.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::TriggerSpec;
    use crate::definition::WorkflowReference;
    use crate::event::Event;
    use crate::store::InMemoryStore;
    use chrono::Utc;

    fn setup() -> (StoreOutcomeRealizer, Arc<InMemoryStore<WorkflowInstance>>, Trigger) {
        let instances = Arc::new(InMemoryStore::<WorkflowInstance>::new());
        let realizer = StoreOutcomeRealizer::new(Arc::new(InMemoryStore::<Workflow>::new()), instances.clone());
        let trigger = Trigger::new(
            ResourceMetadata::new("order-await", "default"),
            TriggerSpec::new(
                Vec::new(),
                CorrelationOutcome::Correlate {
                    instance: "order.default".to_string(),
                    key: "await".to_string(),
                },
            ),
        );
        (realizer, instances, trigger)
    }

    fn fired_context() -> CorrelationContext {
        let now = Utc::now();
        CorrelationContext::new(now)
            .correlate(&Event::new("payment.completed", "/payments"), &Default::default(), true, now)
            .unwrap()
    }

    async fn create_instance(instances: &InMemoryStore<WorkflowInstance>) {
        let reference = WorkflowReference {
            name: "order".to_string(),
            namespace: "default".to_string(),
            version: "1.0.0".to_string(),
        };
        instances
            .create(WorkflowInstance::new(
                ResourceMetadata::new("order", "default"),
                reference,
                json!({}),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_redelivering_same_context_is_idempotent() {
        let (realizer, instances, trigger) = setup();
        create_instance(&instances).await;
        let context = fired_context();

        let first = realizer.realize(&trigger, &context).await.unwrap();
        let again = realizer.realize(&trigger, &context).await.unwrap();
        assert_eq!(first, again);
        let stored = instances.find("order.default").await.unwrap().unwrap();
        assert_eq!(stored.status.correlation["await"].id, context.id);
    }

    #[tokio::test]
    async fn test_second_context_for_key_is_rejected() {
        let (realizer, instances, trigger) = setup();
        create_instance(&instances).await;
        let delivered = fired_context();
        realizer.realize(&trigger, &delivered).await.unwrap();

        let err = realizer.realize(&trigger, &fired_context()).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Correlation(CorrelationError::AlreadyCorrelated { ref key, .. }) if key == "await"
        ));
        let stored = instances.find("order.default").await.unwrap().unwrap();
        assert_eq!(stored.status.correlation["await"].id, delivered.id);
    }

    #[tokio::test]
    async fn test_missing_instance_is_unavailable() {
        let (realizer, _, trigger) = setup();
        let err = realizer.realize(&trigger, &fired_context()).await.unwrap_err();
        assert!(matches!(err, CoreError::Correlation(CorrelationError::InstanceUnavailable(_))));
    }
}
