// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process registry
//!
//! In-memory registry of live runner processes, keyed by process id. The
//! scheduler inserts a process once it is created and removes it after it has
//! been stopped, so a process is never reused across instances.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::runtime::WorkflowProcess;

/// A registered process with the instance it runs.
#[derive(Clone)]
pub struct ProcessEntry {
    /// Qualified name of the instance.
    pub instance_id: String,
    /// The process handle.
    pub process: Arc<dyn WorkflowProcess>,
}

impl std::fmt::Debug for ProcessEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEntry")
            .field("instance_id", &self.instance_id)
            .field("process_id", &self.process.id())
            .finish()
    }
}

/// Shared map of live processes.
#[derive(Default)]
pub struct ProcessRegistry {
    processes: RwLock<HashMap<String, ProcessEntry>>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process. Returns the entry previously stored under its id.
    pub async fn insert(&self, instance_id: impl Into<String>, process: Arc<dyn WorkflowProcess>) -> Option<ProcessEntry> {
        let entry = ProcessEntry {
            instance_id: instance_id.into(),
            process,
        };
        self.processes
            .write()
            .await
            .insert(entry.process.id().to_string(), entry)
    }

    /// Look up a process by id.
    pub async fn get(&self, process_id: &str) -> Option<ProcessEntry> {
        self.processes.read().await.get(process_id).cloned()
    }

    /// Remove a process by id.
    pub async fn remove(&self, process_id: &str) -> Option<ProcessEntry> {
        self.processes.write().await.remove(process_id)
    }

    /// Processes running `instance_id`.
    pub async fn find_by_instance(&self, instance_id: &str) -> Vec<ProcessEntry> {
        self.processes
            .read()
            .await
            .values()
            .filter(|entry| entry.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// Number of registered processes.
    pub async fn len(&self) -> usize {
        self.processes.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.processes.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockProcess;

    #[tokio::test]
    async fn test_insert_find_remove() {
        let registry = ProcessRegistry::new();
        let first: Arc<dyn WorkflowProcess> = Arc::new(MockProcess::new("proc-1"));
        let second: Arc<dyn WorkflowProcess> = Arc::new(MockProcess::new("proc-2"));

        assert!(registry.insert("orders-1.default", first).await.is_none());
        registry.insert("orders-2.default", second).await;
        assert_eq!(registry.len().await, 2);

        let found = registry.find_by_instance("orders-1.default").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].process.id(), "proc-1");

        let removed = registry.remove("proc-1").await.unwrap();
        assert_eq!(removed.instance_id, "orders-1.default");
        assert!(registry.get("proc-1").await.is_none());
        assert!(registry.remove("proc-1").await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts() {
        let registry = Arc::new(ProcessRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let process: Arc<dyn WorkflowProcess> = Arc::new(MockProcess::new(format!("proc-{}", i)));
                registry.insert(format!("instance-{}", i), process).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.len().await, 32);
    }
}
