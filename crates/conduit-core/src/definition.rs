// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions.
//!
//! A structural subset of the Serverless Workflow DSL: a document header,
//! declared secrets, an optional event schedule and an ordered task list.
//! Tasks are serialized as single-key maps (`- greet: { set: {...} }`).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlation::{ConditionType, EventFilter, TriggerCondition};
use crate::error::ProblemDetails;
use crate::resource::{Resource, ResourceMetadata};

/// A named task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, TaskDefinition>",
    into = "BTreeMap<String, TaskDefinition>"
)]
pub struct NamedTask {
    /// Task name, unique among its siblings.
    pub name: String,
    /// Task definition.
    pub task: TaskDefinition,
}

impl NamedTask {
    /// Create a named task.
    pub fn new(name: impl Into<String>, task: TaskDefinition) -> Self {
        Self {
            name: name.into(),
            task,
        }
    }
}

impl TryFrom<BTreeMap<String, TaskDefinition>> for NamedTask {
    type Error = String;

    fn try_from(map: BTreeMap<String, TaskDefinition>) -> Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!(
                "a task entry must have exactly one key, found {}",
                map.len()
            ));
        }
        let (name, task) = map.into_iter().next().ok_or("empty task entry")?;
        Ok(Self { name, task })
    }
}

impl From<NamedTask> for BTreeMap<String, TaskDefinition> {
    fn from(task: NamedTask) -> Self {
        BTreeMap::from([(task.name, task.task)])
    }
}

/// Ordered list of named tasks.
pub type TaskList = Vec<NamedTask>;

/// Find the index of a sibling by name.
pub fn position_of(tasks: &TaskList, name: &str) -> Option<usize> {
    tasks.iter().position(|t| t.name == name)
}

/// Instruction describing which task runs after the current one completes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FlowDirective {
    /// Run the next sibling.
    #[default]
    Continue,
    /// Leave the enclosing composite task and continue with its flow.
    Exit,
    /// End the workflow.
    End,
    /// Jump to the named sibling.
    Goto(String),
}

impl From<String> for FlowDirective {
    fn from(value: String) -> Self {
        match value.as_str() {
            "continue" => Self::Continue,
            "exit" => Self::Exit,
            "end" => Self::End,
            _ => Self::Goto(value),
        }
    }
}

impl From<FlowDirective> for String {
    fn from(value: FlowDirective) -> Self {
        match value {
            FlowDirective::Continue => "continue".to_string(),
            FlowDirective::Exit => "exit".to_string(),
            FlowDirective::End => "end".to_string(),
            FlowDirective::Goto(name) => name,
        }
    }
}

/// Input transformation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputDefinition {
    /// Expression producing the task's effective input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Value>,
}

/// Output (or export) transformation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutputDefinition {
    /// Expression producing the transformed value.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<Value>,
}

/// A task definition: common properties plus exactly one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Runtime expression guard; a falsy result skips the task.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Flow directive applied once the task completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<FlowDirective>,
    /// Input transformation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputDefinition>,
    /// Output transformation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDefinition>,
    /// Context export; the result replaces the workflow context data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<OutputDefinition>,
    /// Arguments of a `call` task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<Value>,
    /// Error handler of a `try` task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch: Option<CatchDefinition>,
    /// The task kind.
    #[serde(flatten)]
    pub kind: TaskKind,
}

impl TaskDefinition {
    /// A definition of the given kind without common properties.
    pub fn new(kind: TaskKind) -> Self {
        Self {
            condition: None,
            then: None,
            input: None,
            output: None,
            export: None,
            with: None,
            catch: None,
            kind,
        }
    }

    /// Set the flow directive.
    pub fn then(mut self, then: FlowDirective) -> Self {
        self.then = Some(then);
        self
    }

    /// Set the guard expression.
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Short lowercase kind name (`do`, `fork`, ...).
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

/// The kinds of task the engine executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Ordered sub-tasks.
    Do(TaskList),
    /// Concurrent branches.
    Fork(ForkDefinition),
    /// Evaluate a map of expressions into the output.
    Set(serde_json::Map<String, Value>),
    /// Conditional flow.
    Switch(Vec<BTreeMap<String, SwitchCase>>),
    /// Block until matching events are correlated.
    Listen(ListenDefinition),
    /// Publish an event.
    Emit(EmitDefinition),
    /// Fault with an error.
    Raise(RaiseDefinition),
    /// Guarded sub-tasks, see [`TaskDefinition::catch`].
    Try(TaskList),
    /// Sleep.
    Wait(DurationDefinition),
    /// Invoke a named function, see [`TaskDefinition::with`].
    Call(String),
}

impl TaskKind {
    /// Short lowercase kind name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Do(_) => "do",
            Self::Fork(_) => "fork",
            Self::Set(_) => "set",
            Self::Switch(_) => "switch",
            Self::Listen(_) => "listen",
            Self::Emit(_) => "emit",
            Self::Raise(_) => "raise",
            Self::Try(_) => "try",
            Self::Wait(_) => "wait",
            Self::Call(_) => "call",
        }
    }
}

/// Concurrent branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkDefinition {
    /// Branches, each executed as its own logical thread of control.
    pub branches: TaskList,
    /// When true the first branch to complete wins and the others are cancelled.
    #[serde(default)]
    pub compete: bool,
}

/// One case of a `switch` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    /// Guard; a case without one is the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Flow directive taken when the case matches.
    pub then: FlowDirective,
}

/// Event consumption strategy of a `listen` task or workflow schedule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventConsumptionStrategy {
    /// Every filter must be satisfied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<Vec<EventFilter>>,
    /// Any filter satisfies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any: Option<Vec<EventFilter>>,
    /// Exactly one filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one: Option<EventFilter>,
}

impl EventConsumptionStrategy {
    /// Translate into trigger conditions.
    ///
    /// Each filter becomes its own condition so that `all` requires one
    /// matching event per filter.
    pub fn to_conditions(&self) -> Result<(ConditionType, Vec<TriggerCondition>), ProblemDetails> {
        let single = |filters: &[EventFilter]| {
            filters
                .iter()
                .map(|f| TriggerCondition::new(vec![f.clone()]))
                .collect::<Vec<_>>()
        };
        match (&self.all, &self.any, &self.one) {
            (Some(all), None, None) if !all.is_empty() => Ok((ConditionType::AllOf, single(all))),
            (None, Some(any), None) if !any.is_empty() => Ok((ConditionType::AnyOf, single(any))),
            (None, None, Some(one)) => Ok((
                ConditionType::AnyOf,
                vec![TriggerCondition::new(vec![one.clone()])],
            )),
            _ => Err(ProblemDetails::configuration(
                "exactly one non-empty of 'all', 'any' or 'one' must be set",
            )),
        }
    }
}

/// A `listen` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenDefinition {
    /// Events to listen to.
    pub to: EventConsumptionStrategy,
}

/// An `emit` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitDefinition {
    /// Event template.
    pub event: EventTemplate,
}

/// Attributes of an emitted event; values may be runtime expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTemplate {
    /// Event attributes. `type` and `source` are required.
    pub with: serde_json::Map<String, Value>,
}

/// A `raise` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseDefinition {
    /// The error to raise.
    pub error: ProblemDetails,
}

/// A duration made of whole units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DurationDefinition {
    /// Days.
    #[serde(default)]
    pub days: u64,
    /// Hours.
    #[serde(default)]
    pub hours: u64,
    /// Minutes.
    #[serde(default)]
    pub minutes: u64,
    /// Seconds.
    #[serde(default)]
    pub seconds: u64,
    /// Milliseconds.
    #[serde(default)]
    pub milliseconds: u64,
}

impl DurationDefinition {
    /// Duration of `milliseconds`.
    pub fn from_millis(milliseconds: u64) -> Self {
        Self {
            milliseconds,
            ..Default::default()
        }
    }

    /// Convert to a std duration.
    ///
    /// Saturates at [`Duration::MAX`] instead of overflowing.
    pub fn to_std(&self) -> Duration {
        let secs = self
            .days
            .saturating_mul(86_400)
            .saturating_add(self.hours.saturating_mul(3_600))
            .saturating_add(self.minutes.saturating_mul(60))
            .saturating_add(self.seconds);
        Duration::from_secs(secs).saturating_add(Duration::from_millis(self.milliseconds))
    }
}

/// Error handler of a `try` task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatchDefinition {
    /// Errors to catch; all errors when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorFilter>,
    /// Argument name under which the caught error is exposed (default `error`).
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<String>,
    /// Only catch when this expression is truthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Do not catch when this expression is truthy.
    #[serde(rename = "exceptWhen", default, skip_serializing_if = "Option::is_none")]
    pub except_when: Option<String>,
    /// Retry policy applied before giving up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Tasks run once the error has been caught.
    #[serde(rename = "do", default, skip_serializing_if = "Option::is_none")]
    pub do_: Option<TaskList>,
}

/// Error filter of a catch clause.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorFilter {
    /// Properties the error must have.
    #[serde(default)]
    pub with: ErrorFilterProperties,
}

/// Properties matched by an [`ErrorFilter`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorFilterProperties {
    /// Required problem type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub problem_type: Option<String>,
    /// Required status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Required title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ErrorFilter {
    /// Whether the filter accepts the error.
    pub fn matches(&self, error: &ProblemDetails) -> bool {
        let with = &self.with;
        with.problem_type.as_ref().is_none_or(|t| *t == error.problem_type)
            && with.status.is_none_or(|s| s == error.status)
            && with.title.as_ref().is_none_or(|t| *t == error.title)
    }
}

/// Retry backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay between attempts.
    Constant {},
    /// Delay multiplied by the attempt number.
    Linear {},
    /// Delay doubled on every attempt.
    Exponential {},
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Constant {}
    }
}

/// Limits of a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryLimit {
    /// Attempt limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<AttemptLimit>,
}

/// Maximum number of retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptLimit {
    /// Retries allowed after the first run.
    pub count: u32,
}

/// Retry policy of a catch clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DurationDefinition>,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: Backoff,
    /// Attempt limit; a policy without a limit retries once.
    #[serde(default)]
    pub limit: RetryLimit,
}

impl RetryPolicy {
    /// A policy allowing `count` retries with a constant delay.
    pub fn attempts(count: u32, delay: Duration) -> Self {
        Self {
            delay: Some(DurationDefinition::from_millis(delay.as_millis() as u64)),
            backoff: Backoff::Constant {},
            limit: RetryLimit {
                attempt: Some(AttemptLimit { count }),
            },
        }
    }

    /// Number of retries allowed after the first run.
    pub fn max_retries(&self) -> u32 {
        self.limit.attempt.map(|a| a.count).unwrap_or(1)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.delay.map(|d| d.to_std()).unwrap_or_default();
        match self.backoff {
            Backoff::Constant {} => base,
            Backoff::Linear {} => base.saturating_mul(retry.max(1)),
            Backoff::Exponential {} => base.saturating_mul(2u32.saturating_pow(retry.saturating_sub(1))),
        }
    }
}

/// Document header of a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDefinition {
    /// DSL version.
    #[serde(default = "default_dsl")]
    pub dsl: String,
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Semantic version.
    pub version: String,
}

fn default_dsl() -> String {
    "1.0.0".to_string()
}

/// Event schedule starting new instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    /// Events that start an instance.
    pub on: EventConsumptionStrategy,
}

/// A workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Document header.
    pub document: DocumentDefinition,
    /// Names of the secrets the workflow uses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    /// Event schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleDefinition>,
    /// Top-level tasks.
    #[serde(rename = "do")]
    pub tasks: TaskList,
}

/// Reference to a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowReference {
    /// Workflow name.
    pub name: String,
    /// Workflow namespace.
    pub namespace: String,
    /// Workflow version.
    pub version: String,
}

impl WorkflowReference {
    /// Store key of the referenced workflow resource.
    pub fn id(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }
}

impl std::fmt::Display for WorkflowReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}:{}", self.name, self.namespace, self.version)
    }
}

/// Workflow resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Resource metadata.
    pub metadata: ResourceMetadata,
    /// Definition.
    pub spec: WorkflowDefinition,
}

impl Workflow {
    /// Wrap a definition into a resource named after its document.
    pub fn new(spec: WorkflowDefinition) -> Self {
        Self {
            metadata: ResourceMetadata::new(&spec.document.name, &spec.document.namespace),
            spec,
        }
    }

    /// Reference to this workflow.
    pub fn reference(&self) -> WorkflowReference {
        WorkflowReference {
            name: self.spec.document.name.clone(),
            namespace: self.spec.document.namespace.clone(),
            version: self.spec.document.version.clone(),
        }
    }
}

impl Resource for Workflow {
    const KIND: &'static str = "Workflow";

    fn metadata(&self) -> &ResourceMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ResourceMetadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_workflow_definition() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "document": {"namespace": "default", "name": "orders", "version": "1.0.0"},
            "secrets": ["db"],
            "do": [
                {"init": {"set": {"count": 0}}},
                {"check": {"switch": [
                    {"big": {"when": "${ .count }", "then": "end"}},
                    {"other": {"then": "continue"}}
                ]}},
                {"guarded": {
                    "try": [{"call-svc": {"call": "reserve", "with": {"id": "${ .id }"}}}],
                    "catch": {
                        "errors": {"with": {"status": 503}},
                        "retry": {"delay": {"milliseconds": 10}, "backoff": {"exponential": {}}, "limit": {"attempt": {"count": 3}}}
                    }
                }},
                {"pause": {"wait": {"seconds": 2}, "then": "init"}}
            ]
        }))
        .unwrap();

        assert_eq!(definition.tasks.len(), 4);
        assert_eq!(definition.tasks[0].task.kind_name(), "set");
        assert_eq!(definition.tasks[2].task.kind_name(), "try");
        let catch = definition.tasks[2].task.catch.as_ref().unwrap();
        let retry = catch.retry.unwrap();
        assert_eq!(retry.max_retries(), 3);
        assert_eq!(retry.backoff, Backoff::Exponential {});
        assert_eq!(
            definition.tasks[3].task.then,
            Some(FlowDirective::Goto("init".to_string()))
        );
        assert_eq!(
            definition.tasks[3].task.kind,
            TaskKind::Wait(DurationDefinition {
                seconds: 2,
                ..Default::default()
            })
        );
    }

    #[test]
    fn test_task_entry_requires_single_key() {
        let result: Result<NamedTask, _> = serde_json::from_value(json!({
            "a": {"set": {}},
            "b": {"set": {}}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_flow_directive_round_trips_through_strings() {
        assert_eq!(FlowDirective::from("end".to_string()), FlowDirective::End);
        assert_eq!(FlowDirective::from("exit".to_string()), FlowDirective::Exit);
        assert_eq!(
            FlowDirective::from("next-step".to_string()),
            FlowDirective::Goto("next-step".to_string())
        );
        assert_eq!(String::from(FlowDirective::Continue), "continue");
    }

    #[test]
    fn test_retry_delays() {
        let policy = RetryPolicy {
            delay: Some(DurationDefinition::from_millis(100)),
            backoff: Backoff::Exponential {},
            limit: RetryLimit::default(),
        };
        assert_eq!(policy.max_retries(), 1);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));

        let linear = RetryPolicy {
            backoff: Backoff::Linear {},
            ..policy
        };
        assert_eq!(linear.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_error_filter() {
        let filter = ErrorFilter {
            with: ErrorFilterProperties {
                status: Some(503),
                ..Default::default()
            },
        };
        assert!(filter.matches(&ProblemDetails::communication("down")));
        assert!(!filter.matches(&ProblemDetails::runtime("boom")));
    }

    #[test]
    fn test_consumption_strategy_to_conditions() {
        let filter: EventFilter =
            serde_json::from_value(json!({"with": {"type": "order.created"}})).unwrap();

        let all = EventConsumptionStrategy {
            all: Some(vec![filter.clone(), filter.clone()]),
            ..Default::default()
        };
        let (kind, conditions) = all.to_conditions().unwrap();
        assert_eq!(kind, ConditionType::AllOf);
        assert_eq!(conditions.len(), 2);

        let one = EventConsumptionStrategy {
            one: Some(filter),
            ..Default::default()
        };
        assert_eq!(one.to_conditions().unwrap().0, ConditionType::AnyOf);

        assert!(EventConsumptionStrategy::default().to_conditions().is_err());
    }

    #[test]
    fn test_duration_to_std() {
        let d = DurationDefinition {
            minutes: 1,
            seconds: 2,
            milliseconds: 5,
            ..Default::default()
        };
        assert_eq!(d.to_std(), Duration::from_millis(62_005));
    }

    #[test]
    fn test_huge_durations_saturate() {
        let d = DurationDefinition {
            days: u64::MAX,
            milliseconds: u64::MAX,
            ..Default::default()
        };
        assert_eq!(d.to_std(), Duration::MAX);

        let retry: RetryPolicy = serde_json::from_value(json!({
            "delay": {"days": 100000},
            "backoff": {"exponential": {}}
        }))
        .unwrap();
        assert_eq!(retry.delay_for(u32::MAX), Duration::MAX);
        let linear: RetryPolicy = serde_json::from_value(json!({
            "delay": {"days": u64::MAX},
            "backoff": {"linear": {}}
        }))
        .unwrap();
        assert_eq!(linear.delay_for(7), Duration::MAX);
    }
}
