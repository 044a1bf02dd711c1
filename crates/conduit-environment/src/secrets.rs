// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Secrets sources.
//!
//! Runtimes mount the secrets a workflow declares into its runner. A
//! [`SecretsManager`] provides their values; which backing store holds them is
//! up to the embedder.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use conduit_core::definition::Workflow;
use tracing::debug;

use crate::runtime::RuntimeError;

/// Provides secret values by name.
#[async_trait]
pub trait SecretsManager: Send + Sync {
    /// All known secrets.
    async fn get_secrets(&self) -> Result<BTreeMap<String, String>, RuntimeError>;
}

/// Reads secrets from a directory holding one file per secret.
///
/// The file name is the secret name and the file content its value.
#[derive(Debug, Clone)]
pub struct DirectorySecretsManager {
    directory: PathBuf,
}

impl DirectorySecretsManager {
    /// Read secrets from `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl SecretsManager for DirectorySecretsManager {
    async fn get_secrets(&self) -> Result<BTreeMap<String, String>, RuntimeError> {
        let mut secrets = BTreeMap::new();
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(directory = %self.directory.display(), "Secrets directory does not exist");
                return Ok(secrets);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let value = tokio::fs::read_to_string(entry.path()).await?;
            secrets.insert(name, value);
        }
        Ok(secrets)
    }
}

/// Fixed in-memory secrets.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretsManager {
    secrets: BTreeMap<String, String>,
}

impl StaticSecretsManager {
    /// Serve `secrets`.
    pub fn new(secrets: BTreeMap<String, String>) -> Self {
        Self { secrets }
    }

    /// Add a secret.
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretsManager for StaticSecretsManager {
    async fn get_secrets(&self) -> Result<BTreeMap<String, String>, RuntimeError> {
        Ok(self.secrets.clone())
    }
}

/// Whether `name` can be used as a mounted file name and a Secret key.
///
/// Allows ASCII alphanumerics, `-`, `_` and `.`, but never `.` or `..` alone.
pub fn is_valid_secret_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// The secrets `workflow` declares, with their values.
///
/// Fails with [`RuntimeError::InvalidSpec`] when a declared name could escape
/// the secrets directory, and with [`RuntimeError::SecretNotFound`] on the
/// first missing one.
pub async fn workflow_secrets(
    manager: &dyn SecretsManager,
    workflow: &Workflow,
) -> Result<BTreeMap<String, String>, RuntimeError> {
    if workflow.spec.secrets.is_empty() {
        return Ok(BTreeMap::new());
    }
    if let Some(name) = workflow.spec.secrets.iter().find(|name| !is_valid_secret_name(name)) {
        return Err(RuntimeError::InvalidSpec(format!("Invalid secret name '{}'", name)));
    }
    let mut available = manager.get_secrets().await?;
    workflow
        .spec
        .secrets
        .iter()
        .map(|name| {
            available
                .remove(name)
                .map(|value| (name.clone(), value))
                .ok_or_else(|| RuntimeError::SecretNotFound(name.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow(secrets: &[&str]) -> Workflow {
        Workflow::new(
            serde_json::from_value(json!({
                "document": {"namespace": "default", "name": "greet", "version": "1.0.0"},
                "secrets": secrets,
                "do": [{"hello": {"set": {"greeting": "hi"}}}]
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_directory_secrets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("db-password"), "hunter2").unwrap();
        std::fs::write(dir.path().join(".hidden"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let manager = DirectorySecretsManager::new(dir.path());
        let secrets = manager.get_secrets().await.unwrap();

        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets["db-password"], "hunter2");
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DirectorySecretsManager::new(dir.path().join("absent"));
        assert!(manager.get_secrets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_workflow_secrets_selects_declared() {
        let manager = StaticSecretsManager::default()
            .with_secret("db", "postgres://")
            .with_secret("other", "unused");

        let secrets = workflow_secrets(&manager, &workflow(&["db"])).await.unwrap();
        assert_eq!(secrets.keys().collect::<Vec<_>>(), vec!["db"]);

        let err = workflow_secrets(&manager, &workflow(&["db", "smtp"])).await.unwrap_err();
        assert!(matches!(err, RuntimeError::SecretNotFound(name) if name == "smtp"));
    }

    #[test]
    fn test_secret_names() {
        for name in ["db-password", "API_KEY", "tls.crt", "..hidden"] {
            assert!(is_valid_secret_name(name), "{name}");
        }
        for name in ["", ".", "..", "../escape", "nested/key", "back\\slash", "/etc/passwd"] {
            assert!(!is_valid_secret_name(name), "{name}");
        }
    }

    #[tokio::test]
    async fn test_workflow_secrets_rejects_traversal() {
        let manager = StaticSecretsManager::default().with_secret("../escape", "payload");

        let err = workflow_secrets(&manager, &workflow(&["../escape"])).await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidSpec(message) if message.contains("../escape")));
    }
}
