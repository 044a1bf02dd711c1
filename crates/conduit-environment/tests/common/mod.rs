// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for conduit-environment integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::definition::Workflow;
use conduit_core::instance::WorkflowInstance;
use conduit_core::{InMemoryStore, ResourceMetadata, ResourceStore, ServiceAccount};
use conduit_core::definition::WorkflowReference;
use conduit_environment::runtime::{PullPolicy, RuntimeSettings};
use serde_json::json;

pub const IMAGE: &str = "ghcr.io/conduit-workflows/runner:test";

pub fn settings(pull_policy: PullPolicy) -> RuntimeSettings {
    RuntimeSettings {
        image: IMAGE.to_string(),
        pull_policy,
        api_uri: "http://conduit-api:8080".to_string(),
        secrets_directory: PathBuf::from("/run/secrets/conduit"),
        skip_certificate_validation: false,
    }
}

pub fn workflow(name: &str, secrets: &[&str]) -> Workflow {
    Workflow::new(
        serde_json::from_value(json!({
            "document": {"namespace": "default", "name": name, "version": "1.0.0"},
            "secrets": secrets,
            "do": [{"hello": {"set": {"greeting": "hi"}}}]
        }))
        .unwrap(),
    )
}

pub fn instance(workflow: &Workflow, name: &str) -> WorkflowInstance {
    WorkflowInstance::new(
        ResourceMetadata::new(name, "default"),
        WorkflowReference {
            name: workflow.spec.document.name.clone(),
            namespace: workflow.spec.document.namespace.clone(),
            version: workflow.spec.document.version.clone(),
        },
        json!({"order": 1}),
    )
}

pub fn service_account() -> ServiceAccount {
    ServiceAccount::new("default", "default")
}

/// Stores pre-populated with a service account.
pub struct Stores {
    pub workflows: Arc<InMemoryStore<Workflow>>,
    pub instances: Arc<InMemoryStore<WorkflowInstance>>,
    pub service_accounts: Arc<InMemoryStore<ServiceAccount>>,
}

impl Stores {
    pub async fn new() -> Self {
        let service_accounts = Arc::new(InMemoryStore::<ServiceAccount>::new());
        service_accounts.create(service_account()).await.unwrap();
        Self {
            workflows: Arc::new(InMemoryStore::new()),
            instances: Arc::new(InMemoryStore::new()),
            service_accounts,
        }
    }
}

/// Poll `check` until it holds or the timeout elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
