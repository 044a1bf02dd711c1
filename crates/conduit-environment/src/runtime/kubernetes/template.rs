// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job and Secret manifests.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::runtime::{PullPolicy, Result, RuntimeError};

const RUNNER_CONTAINER: &str = "runner";
const SECRETS_VOLUME: &str = "conduit-secrets";
const RESERVED_ENV_PREFIX: &str = "CONDUIT_";

/// Operator-controlled pod settings, loaded from an optional JSON file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PodTemplate {
    /// Extra labels on the Job and its pod.
    pub labels: BTreeMap<String, String>,
    /// Annotations on the pod.
    pub annotations: BTreeMap<String, String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Kubernetes service account of the pod.
    pub service_account_name: Option<String>,
    /// Node selector.
    pub node_selector: BTreeMap<String, String>,
    /// Container resources, as in a pod spec.
    pub resources: Option<Value>,
    /// Hard deadline of the Job.
    pub active_deadline_seconds: Option<i64>,
    /// Seconds a finished Job is kept before the cluster deletes it.
    pub ttl_seconds_after_finished: Option<i64>,
    /// Image pull secrets.
    pub image_pull_secrets: Vec<String>,
}

/// Runtime-owned settings of one Job.
#[derive(Debug, Clone)]
pub struct JobParams<'a> {
    /// Job name.
    pub name: &'a str,
    /// Namespace.
    pub namespace: &'a str,
    /// Runner image.
    pub image: &'a str,
    /// Pull policy.
    pub pull_policy: PullPolicy,
    /// Runner environment.
    pub env: Vec<(String, String)>,
    /// Secret mounted read-only at `secrets_directory`.
    pub secret: Option<&'a str>,
    /// Secrets mount path.
    pub secrets_directory: &'a Path,
    /// Runtime labels.
    pub labels: BTreeMap<String, String>,
}

impl PodTemplate {
    /// Load a template from a JSON file.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Render the Job manifest.
    pub fn render(&self, params: JobParams<'_>) -> Result<Value> {
        if params.name.is_empty() || params.name.len() > 63 {
            return Err(RuntimeError::InvalidSpec(format!(
                "job name '{}' must be 1 to 63 characters",
                params.name
            )));
        }
        if params.image.trim().is_empty() {
            return Err(RuntimeError::InvalidSpec("runner image is empty".to_string()));
        }
        if let Some(key) = self.env.keys().find(|k| k.starts_with(RESERVED_ENV_PREFIX)) {
            return Err(RuntimeError::InvalidSpec(format!(
                "template environment variable '{}' is reserved for the runtime",
                key
            )));
        }
        if !params.secrets_directory.is_absolute() {
            return Err(RuntimeError::InvalidSpec(format!(
                "secrets directory '{}' is not an absolute path",
                params.secrets_directory.display()
            )));
        }

        let mut labels = self.labels.clone();
        labels.extend(params.labels);

        let env: Vec<Value> = params
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();

        let mut container = Map::new();
        container.insert("name".to_string(), json!(RUNNER_CONTAINER));
        container.insert("image".to_string(), json!(params.image));
        container.insert("imagePullPolicy".to_string(), json!(params.pull_policy.as_str()));
        container.insert("env".to_string(), Value::Array(env));
        if let Some(resources) = &self.resources {
            container.insert("resources".to_string(), resources.clone());
        }

        let mut pod_spec = Map::new();
        pod_spec.insert("restartPolicy".to_string(), json!("Never"));
        if let Some(account) = &self.service_account_name {
            pod_spec.insert("serviceAccountName".to_string(), json!(account));
        }
        if !self.node_selector.is_empty() {
            pod_spec.insert("nodeSelector".to_string(), json!(self.node_selector));
        }
        if !self.image_pull_secrets.is_empty() {
            let secrets: Vec<Value> = self.image_pull_secrets.iter().map(|s| json!({"name": s})).collect();
            pod_spec.insert("imagePullSecrets".to_string(), Value::Array(secrets));
        }
        if let Some(secret) = params.secret {
            container.insert(
                "volumeMounts".to_string(),
                json!([{
                    "name": SECRETS_VOLUME,
                    "mountPath": params.secrets_directory.display().to_string(),
                    "readOnly": true,
                }]),
            );
            pod_spec.insert(
                "volumes".to_string(),
                json!([{
                    "name": SECRETS_VOLUME,
                    "secret": {"secretName": secret, "defaultMode": 0o400},
                }]),
            );
        }
        pod_spec.insert("containers".to_string(), json!([Value::Object(container)]));

        let mut job_spec = Map::new();
        job_spec.insert("backoffLimit".to_string(), json!(0));
        if let Some(deadline) = self.active_deadline_seconds {
            job_spec.insert("activeDeadlineSeconds".to_string(), json!(deadline));
        }
        if let Some(ttl) = self.ttl_seconds_after_finished {
            job_spec.insert("ttlSecondsAfterFinished".to_string(), json!(ttl));
        }
        job_spec.insert(
            "template".to_string(),
            json!({
                "metadata": {"labels": labels, "annotations": self.annotations},
                "spec": Value::Object(pod_spec),
            }),
        );

        Ok(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": params.name,
                "namespace": params.namespace,
                "labels": labels,
            },
            "spec": Value::Object(job_spec),
        }))
    }
}

/// Secret manifest holding the mounted workflow secrets.
pub fn secret_manifest(
    name: &str,
    namespace: &str,
    secrets: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": {"name": name, "namespace": namespace, "labels": labels},
        "stringData": secrets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn params<'a>(secret: Option<&'a str>, dir: &'a Path) -> JobParams<'a> {
        JobParams {
            name: "conduit-greet-1-abc",
            namespace: "workflows",
            image: "runner:1",
            pull_policy: PullPolicy::IfNotPresent,
            env: vec![("CONDUIT_RUNTIME_PLATFORM".to_string(), "kubernetes".to_string())],
            secret,
            secrets_directory: dir,
            labels: BTreeMap::from([("conduit.io/instance".to_string(), "greet-1.default".to_string())]),
        }
    }

    #[test]
    fn test_job_manifest() {
        let dir = PathBuf::from("/run/secrets/conduit");
        let template = PodTemplate {
            env: BTreeMap::from([("RUST_LOG".to_string(), "info".to_string())]),
            ttl_seconds_after_finished: Some(600),
            ..Default::default()
        };
        let job = template.render(params(Some("conduit-greet-1-abc"), &dir)).unwrap();

        assert_eq!(job["kind"], "Job");
        assert_eq!(job["metadata"]["namespace"], "workflows");
        assert_eq!(job["spec"]["backoffLimit"], 0);
        assert_eq!(job["spec"]["ttlSecondsAfterFinished"], 600);

        let pod = &job["spec"]["template"]["spec"];
        assert_eq!(pod["restartPolicy"], "Never");
        let container = &pod["containers"][0];
        assert_eq!(container["imagePullPolicy"], "IfNotPresent");
        assert_eq!(container["env"][0]["name"], "CONDUIT_RUNTIME_PLATFORM");
        assert_eq!(container["env"][1]["name"], "RUST_LOG");
        assert_eq!(container["volumeMounts"][0]["readOnly"], true);
        assert_eq!(container["volumeMounts"][0]["mountPath"], "/run/secrets/conduit");
        assert_eq!(pod["volumes"][0]["secret"]["secretName"], "conduit-greet-1-abc");
        assert_eq!(
            job["spec"]["template"]["metadata"]["labels"]["conduit.io/instance"],
            "greet-1.default"
        );
    }

    #[test]
    fn test_job_without_secrets_has_no_volume() {
        let dir = PathBuf::from("/run/secrets/conduit");
        let job = PodTemplate::default().render(params(None, &dir)).unwrap();
        let pod = &job["spec"]["template"]["spec"];
        assert!(pod.get("volumes").is_none());
        assert!(pod["containers"][0].get("volumeMounts").is_none());
    }

    #[test]
    fn test_invalid_job_specs() {
        let relative = PathBuf::from("secrets");
        assert!(matches!(
            PodTemplate::default().render(params(None, &relative)),
            Err(RuntimeError::InvalidSpec(_))
        ));

        let dir = PathBuf::from("/run/secrets/conduit");
        let reserved = PodTemplate {
            env: BTreeMap::from([("CONDUIT_API_URI".to_string(), "x".to_string())]),
            ..Default::default()
        };
        assert!(matches!(reserved.render(params(None, &dir)), Err(RuntimeError::InvalidSpec(_))));
    }

    #[test]
    fn test_secret_manifest_uses_string_data() {
        let secrets = BTreeMap::from([("db".to_string(), "postgres://".to_string())]);
        let manifest = secret_manifest("conduit-greet-1-abc", "workflows", &secrets, &BTreeMap::new());
        assert_eq!(manifest["kind"], "Secret");
        assert_eq!(manifest["stringData"]["db"], "postgres://");
    }
}
