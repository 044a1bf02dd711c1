// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle event stream.
//!
//! Each subscriber owns a bounded channel. Publishing waits for room in every
//! matching subscriber's channel, so a slow auditor slows the producer down
//! instead of losing events. Subscribers that dropped their receiver are
//! pruned on the next publish.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::DEFAULT_LIFECYCLE_BUFFER;

/// What a lifecycle event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LifecycleSubject {
    /// The workflow instance itself.
    Workflow,
    /// One task of the instance.
    Task {
        /// Task id.
        id: String,
        /// Task definition path.
        path: String,
    },
}

/// The transition an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    /// Created.
    Initialized,
    /// Started.
    Running,
    /// Suspended.
    Suspended,
    /// Resumed after suspension.
    Resumed,
    /// Re-entered running after a fault.
    Retrying,
    /// Cancelled.
    Cancelled,
    /// Faulted.
    Faulted,
    /// Completed.
    Completed,
    /// Skipped.
    Skipped,
}

/// One committed transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Instance id.
    pub instance_id: String,
    /// Subject.
    pub subject: LifecycleSubject,
    /// Transition.
    pub kind: LifecycleKind,
    /// Commit time.
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Event about the workflow instance.
    pub fn workflow(instance_id: impl Into<String>, kind: LifecycleKind, at: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.into(),
            subject: LifecycleSubject::Workflow,
            kind,
            at,
        }
    }

    /// Event about a task.
    pub fn task(
        instance_id: impl Into<String>,
        id: impl Into<String>,
        path: impl Into<String>,
        kind: LifecycleKind,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            subject: LifecycleSubject::Task {
                id: id.into(),
                path: path.into(),
            },
            kind,
            at,
        }
    }

    /// Whether the event is about the workflow instance itself.
    pub fn is_workflow(&self) -> bool {
        self.subject == LifecycleSubject::Workflow
    }
}

/// Selects the events a subscriber receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleFilter {
    /// Only events of this instance.
    pub instance_id: Option<String>,
    /// Only workflow-level events.
    pub workflow_only: bool,
}

impl LifecycleFilter {
    /// Every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Events of one instance.
    pub fn instance(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
            workflow_only: false,
        }
    }

    /// Restrict to workflow-level events.
    pub fn workflow_only(mut self) -> Self {
        self.workflow_only = true;
        self
    }

    /// Whether the event passes the filter.
    pub fn matches(&self, event: &LifecycleEvent) -> bool {
        self.instance_id.as_ref().is_none_or(|id| *id == event.instance_id)
            && (!self.workflow_only || event.is_workflow())
    }
}

struct Subscriber {
    filter: LifecycleFilter,
    sender: mpsc::Sender<LifecycleEvent>,
}

/// Fan-out of lifecycle events to bounded subscriber channels.
pub struct LifecycleBus {
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new(DEFAULT_LIFECYCLE_BUFFER)
    }
}

impl LifecycleBus {
    /// Create a bus whose subscriber channels hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to the events passing `filter`.
    pub fn subscribe(&self, filter: LifecycleFilter) -> mpsc::Receiver<LifecycleEvent> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.lock().push(Subscriber { filter, sender });
        receiver
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().iter().filter(|s| !s.sender.is_closed()).count()
    }

    /// Deliver an event to every matching subscriber, waiting for channel room.
    pub async fn publish(&self, event: LifecycleEvent) {
        let targets: Vec<mpsc::Sender<LifecycleEvent>> = self
            .lock()
            .iter()
            .filter(|s| s.filter.matches(&event))
            .map(|s| s.sender.clone())
            .collect();

        let mut closed = false;
        for sender in targets {
            if sender.send(event.clone()).await.is_err() {
                closed = true;
            }
        }
        trace!(instance_id = %event.instance_id, kind = ?event.kind, "Lifecycle event published");

        if closed {
            self.lock().retain(|s| !s.sender.is_closed());
        }
    }

    /// Deliver events in order.
    pub async fn publish_all(&self, events: Vec<LifecycleEvent>) {
        for event in events {
            self.publish(event).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
