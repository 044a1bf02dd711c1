// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource store seam.
//!
//! The orchestration core depends on a generic resource store through the
//! narrow [`ResourceStore`] trait: find, list, create, versioned update,
//! delete and watch. The storage engine itself is an external collaborator;
//! [`InMemoryStore`] is provided for embedding and tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::resource::Resource;

/// Maximum number of reload-and-reapply rounds in [`mutate`].
pub const MAX_CONFLICT_RETRIES: usize = 16;

/// Capacity of the watch channel of [`InMemoryStore`].
const WATCH_CAPACITY: usize = 1024;

/// Errors from resource store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// A resource with the same id already exists.
    #[error("{kind} '{id}' already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: &'static str,
        /// Resource id.
        id: String,
    },

    /// The resource does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// Resource id.
        id: String,
    },

    /// The stored version differs from the version being written.
    #[error("{kind} '{id}' version conflict: expected {expected}, found {actual}")]
    Conflict {
        /// Resource kind.
        kind: &'static str,
        /// Resource id.
        id: String,
        /// Version carried by the write.
        expected: u64,
        /// Version in the store.
        actual: u64,
    },

    /// The backing store is unreachable or failed.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Change notification emitted by [`ResourceStore::watch`].
#[derive(Debug, Clone)]
pub enum WatchEvent<R> {
    /// A resource was created.
    Created(R),
    /// A resource was updated.
    Updated(R),
    /// A resource was deleted.
    Deleted(R),
}

impl<R> WatchEvent<R> {
    /// The resource carried by the event.
    pub fn resource(&self) -> &R {
        match self {
            Self::Created(r) | Self::Updated(r) | Self::Deleted(r) => r,
        }
    }
}

/// Generic CRUD + watch over one resource kind.
#[async_trait]
pub trait ResourceStore<R: Resource>: Send + Sync {
    /// Find a resource by id.
    async fn find(&self, id: &str) -> Result<Option<R>, StoreError>;

    /// List resources, optionally filtered by a label selector.
    async fn list(&self, selector: Option<&BTreeMap<String, String>>) -> Result<Vec<R>, StoreError>;

    /// Create a resource. The stored copy starts at version 1.
    async fn create(&self, resource: R) -> Result<R, StoreError>;

    /// Update a resource if its version matches the stored one.
    ///
    /// Returns the stored copy with its version incremented.
    async fn update(&self, resource: R) -> Result<R, StoreError>;

    /// Delete a resource, returning it if it existed.
    async fn delete(&self, id: &str) -> Result<Option<R>, StoreError>;

    /// Subscribe to changes.
    fn watch(&self) -> broadcast::Receiver<WatchEvent<R>>;
}

/// Apply `f` to the latest copy of a resource and write it back, reloading
/// and re-applying on version conflicts.
///
/// `f` returns `Ok(None)` to leave the resource untouched. Returns the stored
/// resource (or the unchanged one), or `None` if the resource does not exist.
pub async fn mutate<R, S, F, E>(store: &S, id: &str, mut f: F) -> Result<Option<R>, E>
where
    R: Resource,
    S: ResourceStore<R> + ?Sized,
    F: FnMut(&R) -> Result<Option<R>, E>,
    E: From<StoreError>,
{
    for attempt in 0..MAX_CONFLICT_RETRIES {
        let Some(current) = store.find(id).await? else {
            return Ok(None);
        };
        let Some(next) = f(&current)? else {
            return Ok(Some(current));
        };
        match store.update(next).await {
            Ok(saved) => return Ok(Some(saved)),
            Err(StoreError::Conflict { .. }) => {
                debug!(kind = R::KIND, id, attempt, "Version conflict, reapplying");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let actual = store.find(id).await?.map(|r| r.metadata().version).unwrap_or(0);
    Err(StoreError::Conflict {
        kind: R::KIND,
        id: id.to_string(),
        expected: actual,
        actual,
    }
    .into())
}

/// In-memory resource store.
pub struct InMemoryStore<R: Resource> {
    resources: RwLock<HashMap<String, R>>,
    changes: broadcast::Sender<WatchEvent<R>>,
}

impl<R: Resource> Default for InMemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Resource> InMemoryStore<R> {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            resources: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Number of stored resources.
    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }

    fn notify(&self, event: WatchEvent<R>) {
        // No receivers is not an error
        let _ = self.changes.send(event);
    }
}

#[async_trait]
impl<R: Resource> ResourceStore<R> for InMemoryStore<R> {
    async fn find(&self, id: &str) -> Result<Option<R>, StoreError> {
        Ok(self.resources.read().await.get(id).cloned())
    }

    async fn list(&self, selector: Option<&BTreeMap<String, String>>) -> Result<Vec<R>, StoreError> {
        let resources = self.resources.read().await;
        let mut items: Vec<R> = resources
            .values()
            .filter(|r| selector.is_none_or(|s| r.metadata().matches_labels(s)))
            .cloned()
            .collect();
        items.sort_by_key(|r| r.metadata().created_at);
        Ok(items)
    }

    async fn create(&self, mut resource: R) -> Result<R, StoreError> {
        let id = resource.id();
        let mut resources = self.resources.write().await;
        if resources.contains_key(&id) {
            return Err(StoreError::AlreadyExists { kind: R::KIND, id });
        }
        resource.metadata_mut().version = 1;
        resources.insert(id, resource.clone());
        drop(resources);

        self.notify(WatchEvent::Created(resource.clone()));
        Ok(resource)
    }

    async fn update(&self, mut resource: R) -> Result<R, StoreError> {
        let id = resource.id();
        let mut resources = self.resources.write().await;
        let Some(stored) = resources.get(&id) else {
            return Err(StoreError::NotFound { kind: R::KIND, id });
        };
        let actual = stored.metadata().version;
        let expected = resource.metadata().version;
        if actual != expected {
            return Err(StoreError::Conflict {
                kind: R::KIND,
                id,
                expected,
                actual,
            });
        }
        resource.metadata_mut().version = actual + 1;
        resources.insert(id, resource.clone());
        drop(resources);

        self.notify(WatchEvent::Updated(resource.clone()));
        Ok(resource)
    }

    async fn delete(&self, id: &str) -> Result<Option<R>, StoreError> {
        let removed = self.resources.write().await.remove(id);
        if let Some(resource) = &removed {
            self.notify(WatchEvent::Deleted(resource.clone()));
        }
        Ok(removed)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<R>> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ServiceAccount;

    #[tokio::test]
    async fn test_create_find_and_duplicate() {
        let store = InMemoryStore::new();
        let created = store.create(ServiceAccount::new("runner", "default")).await.unwrap();
        assert_eq!(created.metadata.version, 1);

        let found = store.find("runner.default").await.unwrap().unwrap();
        assert_eq!(found, created);

        let err = store
            .create(ServiceAccount::new("runner", "default"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let store = InMemoryStore::new();
        let created = store.create(ServiceAccount::new("runner", "default")).await.unwrap();

        let mut first = created.clone();
        first.key = "first".to_string();
        let saved = store.update(first).await.unwrap();
        assert_eq!(saved.metadata.version, 2);

        let mut stale = created;
        stale.key = "stale".to_string();
        let err = store.update(stale).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                kind: "ServiceAccount",
                id: "runner.default".to_string(),
                expected: 1,
                actual: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_mutate_applies_to_latest_version() {
        let store = InMemoryStore::new();
        store.create(ServiceAccount::new("runner", "default")).await.unwrap();

        let saved = mutate::<_, _, _, StoreError>(&store, "runner.default", |sa: &ServiceAccount| {
            let mut next = sa.clone();
            next.key.push_str("-rotated");
            Ok(Some(next))
        })
        .await
        .unwrap()
        .unwrap();
        assert!(saved.key.ends_with("-rotated"));
        assert_eq!(saved.metadata.version, 2);

        let missing = mutate::<_, _, _, StoreError>(&store, "nope.default", |sa: &ServiceAccount| {
            Ok(Some(sa.clone()))
        })
        .await
        .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_watch_and_label_selector() {
        let store = InMemoryStore::new();
        let mut changes = store.watch();

        let mut labelled = ServiceAccount::new("a", "default");
        labelled.metadata = labelled.metadata.with_label("tier", "gold");
        store.create(labelled).await.unwrap();
        store.create(ServiceAccount::new("b", "default")).await.unwrap();
        store.delete("b.default").await.unwrap();

        assert!(matches!(changes.recv().await.unwrap(), WatchEvent::Created(_)));
        assert!(matches!(changes.recv().await.unwrap(), WatchEvent::Created(_)));
        assert!(matches!(changes.recv().await.unwrap(), WatchEvent::Deleted(_)));

        let selector = BTreeMap::from([("tier".to_string(), "gold".to_string())]);
        let gold = store.list(Some(&selector)).await.unwrap();
        assert_eq!(gold.len(), 1);
        assert_eq!(gold[0].metadata.name, "a");
    }
}
