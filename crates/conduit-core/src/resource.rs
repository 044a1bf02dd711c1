// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource metadata shared by every aggregate kept in the resource store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default namespace for resources created without one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Metadata carried by every stored resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    /// Resource name, unique within its namespace.
    pub name: String,
    /// Namespace the resource belongs to.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Optimistic-concurrency version. Zero until first persisted.
    #[serde(default)]
    pub version: u64,
    /// Free-form labels used for selection.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// When the resource was first created.
    pub created_at: DateTime<Utc>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl ResourceMetadata {
    /// Create metadata for a new resource.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            version: 0,
            labels: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Qualified name (`{name}.{namespace}`), used as the store key.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }

    /// Add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Whether every selector entry is present in the labels.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// A versioned aggregate kept in a [`ResourceStore`](crate::store::ResourceStore).
pub trait Resource: Clone + Send + Sync + 'static {
    /// Resource kind, used in errors and logs.
    const KIND: &'static str;

    /// Resource metadata.
    fn metadata(&self) -> &ResourceMetadata;

    /// Mutable resource metadata.
    fn metadata_mut(&mut self) -> &mut ResourceMetadata;

    /// Store key.
    fn id(&self) -> String {
        self.metadata().qualified_name()
    }
}

/// Identity the runner uses to authenticate against the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccount {
    /// Resource metadata.
    pub metadata: ResourceMetadata,
    /// Shared key presented by the runner.
    pub key: String,
}

impl ServiceAccount {
    /// Create a service account with a generated key.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            metadata: ResourceMetadata::new(name, namespace),
            key: uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

impl Resource for ServiceAccount {
    const KIND: &'static str = "ServiceAccount";

    fn metadata(&self) -> &ResourceMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ResourceMetadata {
        &mut self.metadata
    }
}
