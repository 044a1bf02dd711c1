// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtimes and platform APIs for testing.
//!
//! [`MockRuntime`] hands out [`MockProcess`]es that never touch a platform.
//! [`MockDockerApi`] and [`MockKubernetesApi`] stand in for the engine and the
//! cluster below the real runtimes and record every call they receive.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::ServiceAccount;
use conduit_core::definition::Workflow;
use conduit_core::instance::WorkflowInstance;
use conduit_core::resource::Resource;
use conduit_core::runner::RuntimePlatform;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};

use super::docker::{ContainerSpec, ContainerState, DockerApi};
use super::kubernetes::{JobPhase, JobStatus, KubernetesApi};
use super::{LogLine, ProcessOutput, Result, RuntimeError, WorkflowProcess, WorkflowRuntime};

pub use super::STOPPED_EXIT_CODE;

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn platform_error(operation: &'static str, message: &str) -> RuntimeError {
    RuntimeError::Platform {
        operation,
        message: message.to_string(),
        image: String::new(),
    }
}

/// A process that only exists in memory.
pub struct MockProcess {
    id: String,
    instance_id: Option<String>,
    output: ProcessOutput,
    starts: AtomicUsize,
    stops: AtomicUsize,
    releases: AtomicUsize,
}

impl MockProcess {
    /// Create a process.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance_id: None,
            output: ProcessOutput::new(),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    /// Qualified name of the instance the process was created for.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Emit an output line.
    pub fn emit(&self, line: LogLine) {
        self.output.push(line);
    }

    /// Terminate with `code`.
    pub fn finish(&self, code: i64) {
        self.output.resolve(code);
    }

    /// Number of `start` calls.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Number of times resources were released.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkflowProcess for MockProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.stops.fetch_add(1, Ordering::SeqCst) == 0 {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.output.resolve(STOPPED_EXIT_CODE);
        }
        Ok(())
    }

    fn stdout(&self) -> broadcast::Receiver<String> {
        self.output.stdout()
    }

    fn stderr(&self) -> broadcast::Receiver<String> {
        self.output.stderr()
    }

    fn exit_code(&self) -> watch::Receiver<Option<i64>> {
        self.output.exit_code()
    }
}

/// Runtime creating [`MockProcess`]es.
pub struct MockRuntime {
    platform: RuntimePlatform,
    processes: Mutex<Vec<Arc<MockProcess>>>,
    failure: Mutex<Option<String>>,
    create_delay: Mutex<Option<Duration>>,
    created: broadcast::Sender<Arc<MockProcess>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create a mock runtime reporting the Docker platform.
    pub fn new() -> Self {
        let (created, _) = broadcast::channel(64);
        Self {
            platform: RuntimePlatform::Docker,
            processes: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            create_delay: Mutex::new(None),
            created,
        }
    }

    /// Fail every `create_process` call with a platform error.
    pub fn fail_with(&self, message: impl Into<String>) {
        *locked(&self.failure) = Some(message.into());
    }

    /// Take `delay` for every `create_process` call, like a slow image pull.
    pub fn delay_creation(&self, delay: Duration) {
        *locked(&self.create_delay) = Some(delay);
    }

    /// Processes created so far.
    pub fn processes(&self) -> Vec<Arc<MockProcess>> {
        locked(&self.processes).clone()
    }

    /// Notifications of created processes.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<MockProcess>> {
        self.created.subscribe()
    }
}

#[async_trait]
impl WorkflowRuntime for MockRuntime {
    fn platform(&self) -> RuntimePlatform {
        self.platform
    }

    async fn create_process(
        &self,
        _workflow: &Workflow,
        instance: &WorkflowInstance,
        _service_account: &ServiceAccount,
    ) -> Result<Arc<dyn WorkflowProcess>> {
        let delay = *locked(&self.create_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = locked(&self.failure).clone() {
            return Err(platform_error("create process", &message));
        }
        let process = {
            let mut processes = locked(&self.processes);
            let mut process = MockProcess::new(format!("mock-{}-{}", instance.metadata.name, processes.len()));
            process.instance_id = Some(instance.id());
            let process = Arc::new(process);
            processes.push(process.clone());
            process
        };
        let _ = self.created.send(process.clone());
        Ok(process)
    }
}

/// A call received by [`MockDockerApi`].
#[derive(Debug, Clone, PartialEq)]
pub enum DockerCall {
    /// `image_exists`
    ImageExists(String),
    /// `pull_image`
    PullImage(String),
    /// `create_container`
    CreateContainer(ContainerSpec),
    /// `start_container`
    StartContainer(String),
    /// `follow_logs`
    FollowLogs(String),
    /// `wait_container`
    WaitContainer(String),
    /// `inspect_container`
    InspectContainer(String),
    /// `container_networks`
    ContainerNetworks(String),
    /// `stop_container`
    StopContainer(String),
    /// `remove_container`
    RemoveContainer(String),
}

#[derive(Default)]
struct DockerState {
    images: HashSet<String>,
    networks: HashMap<String, Vec<String>>,
    containers: HashMap<String, ContainerState>,
    logs: Vec<LogLine>,
    pull_failure: Option<String>,
    wait_failure: Option<String>,
    calls: Vec<DockerCall>,
}

/// In-memory Docker engine.
///
/// Containers run until [`exit`](Self::exit) or a stop; their output is the
/// configured log lines.
pub struct MockDockerApi {
    state: Mutex<DockerState>,
    exit: watch::Sender<Option<i64>>,
}

impl Default for MockDockerApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDockerApi {
    /// An engine without images.
    pub fn new() -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            state: Mutex::new(DockerState::default()),
            exit,
        }
    }

    /// Make `image` present locally.
    pub fn with_image(self, image: impl Into<String>) -> Self {
        locked(&self.state).images.insert(image.into());
        self
    }

    /// Attach container `id` to `networks`.
    pub fn with_networks(self, id: impl Into<String>, networks: &[&str]) -> Self {
        locked(&self.state)
            .networks
            .insert(id.into(), networks.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Output every container produces.
    pub fn with_logs(self, logs: Vec<LogLine>) -> Self {
        locked(&self.state).logs = logs;
        self
    }

    /// Fail image pulls with `message`.
    pub fn failing_pull(self, message: impl Into<String>) -> Self {
        locked(&self.state).pull_failure = Some(message.into());
        self
    }

    /// Fail waits on containers with `message`, as when the engine connection drops.
    pub fn failing_wait(self, message: impl Into<String>) -> Self {
        locked(&self.state).wait_failure = Some(message.into());
        self
    }

    /// Let every running container exit with `code`.
    pub fn exit(&self, code: i64) {
        let mut state = locked(&self.state);
        for container in state.containers.values_mut() {
            if container.status == "running" {
                container.status = "exited".to_string();
                container.exit_code = code;
            }
        }
        drop(state);
        self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(code);
            true
        });
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<DockerCall> {
        locked(&self.state).calls.clone()
    }

    /// Number of calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&DockerCall) -> bool) -> usize {
        locked(&self.state).calls.iter().filter(|c| predicate(c)).count()
    }

    /// Whether container `id` exists.
    pub fn has_container(&self, id: &str) -> bool {
        locked(&self.state).containers.contains_key(id)
    }

    fn record(&self, call: DockerCall) -> std::sync::MutexGuard<'_, DockerState> {
        let mut state = locked(&self.state);
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl DockerApi for MockDockerApi {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let state = self.record(DockerCall::ImageExists(image.to_string()));
        Ok(state.images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut state = self.record(DockerCall::PullImage(image.to_string()));
        if let Some(message) = &state.pull_failure {
            return Err(platform_error("pull image", message));
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.record(DockerCall::CreateContainer(spec.clone()));
        if !state.images.contains(&spec.image) {
            return Err(platform_error("create container", "No such image"));
        }
        let id = format!("container-{}", state.containers.len() + 1);
        state.containers.insert(
            id.clone(),
            ContainerState {
                status: "created".to_string(),
                exit_code: 0,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.record(DockerCall::StartContainer(id.to_string()));
        match state.containers.get_mut(id) {
            Some(container) => {
                container.status = "running".to_string();
                Ok(())
            }
            None => Err(platform_error("start container", "No such container")),
        }
    }

    async fn follow_logs(&self, id: &str) -> Result<mpsc::Receiver<LogLine>> {
        let logs = self.record(DockerCall::FollowLogs(id.to_string())).logs.clone();
        let (tx, rx) = mpsc::channel(logs.len().max(1));
        let mut exit = self.exit.subscribe();
        tokio::spawn(async move {
            for line in logs {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            let _ = exit.wait_for(Option::is_some).await;
        });
        Ok(rx)
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let failure = self.record(DockerCall::WaitContainer(id.to_string())).wait_failure.clone();
        if let Some(message) = failure {
            return Err(platform_error("wait container", &message));
        }
        let mut exit = self.exit.subscribe();
        let code = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| platform_error("wait container", "engine gone"))?
            .unwrap_or_default();
        Ok(code)
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerState>> {
        let state = self.record(DockerCall::InspectContainer(id.to_string()));
        Ok(state.containers.get(id).cloned())
    }

    async fn container_networks(&self, id: &str) -> Result<Vec<String>> {
        let state = self.record(DockerCall::ContainerNetworks(id.to_string()));
        Ok(state.networks.get(id).cloned().unwrap_or_default())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let stopped = {
            let mut state = self.record(DockerCall::StopContainer(id.to_string()));
            match state.containers.get_mut(id) {
                Some(container) if container.status == "running" => {
                    container.status = "exited".to_string();
                    container.exit_code = STOPPED_EXIT_CODE;
                    true
                }
                _ => false,
            }
        };
        if stopped {
            self.exit.send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                *current = Some(STOPPED_EXIT_CODE);
                true
            });
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.record(DockerCall::RemoveContainer(id.to_string()));
        state.containers.remove(id);
        Ok(())
    }
}

/// A call received by [`MockKubernetesApi`].
#[derive(Debug, Clone, PartialEq)]
pub enum KubernetesCall {
    /// `apply`
    Apply(Value),
    /// `job_status`
    JobStatus(String),
    /// `follow_logs`
    FollowLogs(String),
    /// `delete_job`
    DeleteJob(String),
    /// `delete_secret`
    DeleteSecret(String),
}

#[derive(Default)]
struct KubernetesState {
    jobs: HashMap<String, JobStatus>,
    secrets: HashSet<String>,
    logs: Vec<LogLine>,
    calls: Vec<KubernetesCall>,
    job_failure: Option<String>,
}

/// In-memory cluster.
///
/// Jobs stay active until [`complete`](Self::complete).
pub struct MockKubernetesApi {
    state: Mutex<KubernetesState>,
    done: watch::Sender<bool>,
}

impl Default for MockKubernetesApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKubernetesApi {
    /// An empty cluster.
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            state: Mutex::new(KubernetesState::default()),
            done,
        }
    }

    /// Output every Job produces.
    pub fn with_logs(self, logs: Vec<LogLine>) -> Self {
        locked(&self.state).logs = logs;
        self
    }

    /// Reject every Job manifest with `message`. Secrets are still accepted.
    pub fn failing_jobs(self, message: &str) -> Self {
        locked(&self.state).job_failure = Some(message.to_string());
        self
    }

    /// Remove Job `name` behind the runtime's back.
    pub fn evict_job(&self, name: &str) {
        locked(&self.state).jobs.remove(name);
    }

    /// Terminate every active Job with `exit_code`.
    pub fn complete(&self, exit_code: i64) {
        let mut state = locked(&self.state);
        for job in state.jobs.values_mut() {
            if job.phase == JobPhase::Active {
                job.phase = if exit_code == 0 {
                    JobPhase::Succeeded
                } else {
                    JobPhase::Failed
                };
                job.exit_code = Some(exit_code);
            }
        }
        drop(state);
        self.done.send_replace(true);
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<KubernetesCall> {
        locked(&self.state).calls.clone()
    }

    /// Number of calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&KubernetesCall) -> bool) -> usize {
        locked(&self.state).calls.iter().filter(|c| predicate(c)).count()
    }

    /// Whether Job `name` exists.
    pub fn has_job(&self, name: &str) -> bool {
        locked(&self.state).jobs.contains_key(name)
    }

    /// Whether Secret `name` exists.
    pub fn has_secret(&self, name: &str) -> bool {
        locked(&self.state).secrets.contains(name)
    }

    fn record(&self, call: KubernetesCall) -> std::sync::MutexGuard<'_, KubernetesState> {
        let mut state = locked(&self.state);
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl KubernetesApi for MockKubernetesApi {
    async fn apply(&self, manifest: &Value) -> Result<()> {
        let mut state = self.record(KubernetesCall::Apply(manifest.clone()));
        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or_else(|| platform_error("apply manifest", "metadata.name is required"))?
            .to_string();
        match manifest["kind"].as_str() {
            Some("Job") => {
                if let Some(message) = &state.job_failure {
                    return Err(platform_error("apply manifest", message));
                }
                state.jobs.insert(
                    name,
                    JobStatus {
                        phase: JobPhase::Active,
                        exit_code: None,
                    },
                );
            }
            Some("Secret") => {
                state.secrets.insert(name);
            }
            _ => return Err(platform_error("apply manifest", "unsupported kind")),
        }
        Ok(())
    }

    async fn job_status(&self, _namespace: &str, name: &str) -> Result<Option<JobStatus>> {
        let state = self.record(KubernetesCall::JobStatus(name.to_string()));
        Ok(state.jobs.get(name).cloned())
    }

    async fn follow_logs(&self, _namespace: &str, job: &str) -> Result<mpsc::Receiver<LogLine>> {
        let logs = self.record(KubernetesCall::FollowLogs(job.to_string())).logs.clone();
        let (tx, rx) = mpsc::channel(logs.len().max(1));
        let mut done = self.done.subscribe();
        tokio::spawn(async move {
            for line in logs {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            let _ = done.wait_for(|done| *done).await;
        });
        Ok(rx)
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.record(KubernetesCall::DeleteJob(name.to_string()));
        state.jobs.remove(name);
        Ok(())
    }

    async fn delete_secret(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.record(KubernetesCall::DeleteSecret(name.to_string()));
        state.secrets.remove(name);
        Ok(())
    }
}
