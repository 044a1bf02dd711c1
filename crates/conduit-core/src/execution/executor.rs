// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task and workflow executors.
//!
//! Executors hold no state of their own: everything they decide is recorded
//! through the [`WorkflowExecutionContext`], so an executor started against
//! a partially executed instance picks up where the previous one stopped.
//! Completed children are not re-run; a composite task resumes after its last
//! completed child.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, select_ok, try_join_all};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::context::WorkflowExecutionContext;
use super::lifecycle::{LifecycleEvent, LifecycleFilter};
use super::services::ExecutionServices;
use super::workflow_state::{NewTask, NextTask, next_task};
use crate::definition::{
    CatchDefinition, EmitDefinition, FlowDirective, ForkDefinition, SwitchCase, TaskDefinition, TaskKind,
    TaskList, Workflow, position_of,
};
use crate::error::{CoreError, ProblemDetails, Result};
use crate::event::{Event, SPEC_VERSION};
use crate::expression::Arguments;
use crate::instance::{TaskInstance, TaskStatus, WorkflowInstance, WorkflowPhase};

/// Name of the synthesized task holding a `try` task's body.
const TRY_BODY: &str = "try";
/// Name of the synthesized task holding a catch clause's handler.
const CATCH_HANDLER: &str = "catch";

type Scope = Arc<Arguments>;
type KindOutcome = (Value, Option<FlowDirective>);

fn faulted(problem: ProblemDetails, path: &str) -> CoreError {
    CoreError::TaskFaulted(problem.with_instance(path))
}

/// Executes tasks of one instance.
pub struct TaskExecutor {
    context: Arc<WorkflowExecutionContext>,
    services: ExecutionServices,
    workflow_input: Value,
}

impl TaskExecutor {
    /// Create an executor over `context`.
    pub fn new(context: Arc<WorkflowExecutionContext>, services: ExecutionServices) -> Self {
        let workflow_input = context.instance().spec.input;
        Self {
            context,
            services,
            workflow_input,
        }
    }

    /// Execute a task to completion.
    ///
    /// Returns the completed or skipped task. A fault is recorded on the task
    /// and returned as [`CoreError::TaskFaulted`].
    pub fn execute<'a>(&'a self, task_id: &'a str, scope: Scope) -> BoxFuture<'a, Result<TaskInstance>> {
        Box::pin(self.run(task_id, scope))
    }

    fn arguments(&self, task: &TaskInstance, scope: &Arguments) -> Arguments {
        let mut arguments = scope.clone();
        arguments.insert("input".to_string(), self.workflow_input.clone());
        arguments.insert("context".to_string(), (*task.context).clone());
        arguments.insert(
            "task".to_string(),
            json!({ "name": task.name, "path": task.path }),
        );
        arguments
    }

    fn evaluate(&self, expression: &Value, input: &Value, arguments: &Arguments, path: &str) -> Result<Value> {
        self.services
            .evaluator
            .evaluate(expression, input, arguments)
            .map_err(|p| faulted(p, path))
    }

    fn evaluate_condition(&self, expression: &str, input: &Value, arguments: &Arguments, path: &str) -> Result<bool> {
        self.services
            .evaluator
            .evaluate_condition(expression, input, arguments)
            .map_err(|p| faulted(p, path))
    }

    async fn run(&self, task_id: &str, scope: Scope) -> Result<TaskInstance> {
        self.context.checkpoint().await?;
        let mut task = self.context.task(task_id)?;
        match task.status {
            TaskStatus::Completed | TaskStatus::Skipped => return Ok(task),
            TaskStatus::Cancelled => return Err(CoreError::Cancelled),
            TaskStatus::Faulted => {
                let error = task
                    .error
                    .clone()
                    .unwrap_or_else(|| ProblemDetails::runtime("task faulted").with_instance(&task.path));
                return Err(CoreError::TaskFaulted(error));
            }
            TaskStatus::Pending => {
                let guard = match &task.definition.condition {
                    Some(condition) => {
                        let arguments = self.arguments(&task, &scope);
                        self.evaluate_condition(condition, &task.input, &arguments, &task.path)
                    }
                    None => Ok(true),
                };
                if let Ok(false) = guard {
                    debug!(task = %task.path, "Guard is false, skipping task");
                    return self.context.skip_task(task_id).await;
                }
                task = self.context.start_task(task_id).await?;
                if let Err(e) = guard {
                    return self.fail(&task, e).await;
                }
            }
            TaskStatus::Suspended if !matches!(task.definition.kind, TaskKind::Listen(_)) => {
                task = self.context.resume_task(task_id).await?;
            }
            TaskStatus::Running | TaskStatus::Suspended => {}
        }

        match self.run_kind(&task, &scope).await {
            Ok(outcome) => match self.complete(&task, &scope, outcome).await {
                Err(e @ CoreError::TaskFaulted(_)) => self.fail(&task, e).await,
                other => other,
            },
            Err(e) => self.fail(&task, e).await,
        }
    }

    async fn complete(&self, task: &TaskInstance, scope: &Arguments, (output, directive): KindOutcome) -> Result<TaskInstance> {
        let arguments = self.arguments(task, scope);
        let definition = &task.definition;
        let output = match definition.output.as_ref().and_then(|o| o.as_.as_ref()) {
            Some(expression) => self.evaluate(expression, &output, &arguments, &task.path)?,
            None => output,
        };
        let export = match definition.export.as_ref().and_then(|e| e.as_.as_ref()) {
            Some(expression) => Some(self.evaluate(expression, &output, &arguments, &task.path)?),
            None => None,
        };
        let then = directive.or_else(|| definition.then.clone()).unwrap_or_default();

        match self.context.set_task_result(&task.id, output, then, export).await {
            Err(CoreError::InvalidTaskState { .. }) if self.was_cancelled(&task.id) => Err(CoreError::Cancelled),
            other => other,
        }
    }

    async fn fail(&self, task: &TaskInstance, error: CoreError) -> Result<TaskInstance> {
        if matches!(error, CoreError::Cancelled) {
            return Err(CoreError::Cancelled);
        }
        let problem = match error {
            CoreError::TaskFaulted(problem) => problem,
            other => other.to_problem().with_instance(&task.path),
        };
        match self.context.set_task_error(&task.id, problem.clone()).await {
            Ok(_) => {
                debug!(task = %task.path, error = %problem, "Task faulted");
                Err(CoreError::TaskFaulted(problem))
            }
            Err(CoreError::InvalidTaskState { .. }) if self.was_cancelled(&task.id) => Err(CoreError::Cancelled),
            Err(e) => Err(e),
        }
    }

    fn was_cancelled(&self, task_id: &str) -> bool {
        self.context
            .task(task_id)
            .map(|t| t.status == TaskStatus::Cancelled)
            .unwrap_or(false)
    }

    async fn run_kind(&self, task: &TaskInstance, scope: &Scope) -> Result<KindOutcome> {
        let arguments = self.arguments(task, scope);
        let input = match task.definition.input.as_ref().and_then(|i| i.from.as_ref()) {
            Some(expression) => self.evaluate(expression, &task.input, &arguments, &task.path)?,
            None => task.input.clone(),
        };

        match &task.definition.kind {
            TaskKind::Do(tasks) => {
                // Definition tasks nest their children under `/do`.
                let base = if task.parent.is_none() || task.is_extension {
                    task.path.clone()
                } else {
                    format!("{}/do", task.path)
                };
                self.run_sequence(task, tasks, &base, input, scope).await
            }
            TaskKind::Fork(fork) => self.run_fork(task, fork, input, scope).await,
            TaskKind::Set(values) => {
                let output = self.evaluate(&Value::Object(values.clone()), &input, &arguments, &task.path)?;
                Ok((output, None))
            }
            TaskKind::Switch(cases) => self.run_switch(task, cases, input, &arguments),
            TaskKind::Listen(_) => self.run_listen(task).await,
            TaskKind::Emit(emit) => self.run_emit(task, emit, input, &arguments).await,
            TaskKind::Raise(raise) => Err(faulted(raise.error.clone(), &task.path)),
            TaskKind::Try(tasks) => self.run_try(task, tasks, input, scope).await,
            TaskKind::Wait(duration) => {
                self.sleep(duration.to_std()).await?;
                Ok((input, None))
            }
            TaskKind::Call(function) => {
                let with = task.definition.with.clone().unwrap_or_else(|| json!({}));
                let call_arguments = self.evaluate(&with, &input, &arguments, &task.path)?;
                let output = self
                    .services
                    .functions
                    .call(function, &call_arguments, &input)
                    .await
                    .map_err(|p| faulted(p, &task.path))?;
                Ok((output, None))
            }
        }
    }

    async fn run_sequence(
        &self,
        parent: &TaskInstance,
        tasks: &TaskList,
        base: &str,
        mut input: Value,
        scope: &Scope,
    ) -> Result<KindOutcome> {
        let mut context = parent.context.clone();
        let mut existing = self.context.children(&parent.id).pop();
        let mut index = match &existing {
            Some(last) => position_of(tasks, &last.name).ok_or_else(|| {
                CoreError::Configuration(format!("task '{}' is not part of '{}'", last.name, parent.path))
            })?,
            None => 0,
        };
        if let Some(last) = &existing {
            input = last.input.clone();
            context = last.context.clone();
        }

        while index < tasks.len() {
            let named = &tasks[index];
            let child = match existing.take() {
                Some(child) => child,
                None => {
                    self.context
                        .create_task(
                            NewTask::new(
                                &named.name,
                                format!("{}/{}/{}", base, index, named.name),
                                named.task.clone(),
                                input.clone(),
                            )
                            .with_parent(&parent.id)
                            .with_context(context.clone()),
                        )
                        .await?
                }
            };

            let done = self.execute(&child.id, scope.clone()).await?;
            let directive = if done.status == TaskStatus::Skipped {
                FlowDirective::Continue
            } else {
                input = done.output.clone().unwrap_or(Value::Null);
                context = done.context.clone();
                done.next.clone().unwrap_or_default()
            };

            match next_task(tasks, index, &directive)? {
                NextTask::At(next) => index = next,
                NextTask::Exit => break,
                NextTask::End => return Ok((input, Some(FlowDirective::End))),
            }
        }
        Ok((input, None))
    }

    async fn run_fork(&self, task: &TaskInstance, fork: &ForkDefinition, input: Value, scope: &Scope) -> Result<KindOutcome> {
        let mut branches = Vec::with_capacity(fork.branches.len());
        for (index, named) in fork.branches.iter().enumerate() {
            let branch = match self.context.find_child(&task.id, &named.name) {
                Some(branch) => branch,
                None => {
                    self.context
                        .create_task(
                            NewTask::new(
                                &named.name,
                                format!("{}/fork/branches/{}/{}", task.path, index, named.name),
                                named.task.clone(),
                                input.clone(),
                            )
                            .with_parent(&task.id),
                        )
                        .await?
                }
            };
            branches.push(branch.id);
        }

        let running = branches.iter().map(|id| self.execute(id, scope.clone()));
        if fork.compete {
            let (winner, rest) = select_ok(running).await?;
            drop(rest);
            debug!(task = %task.path, winner = %winner.name, "Fork branch won");
            self.cancel_unfinished(&branches).await?;
            Ok((winner.output.unwrap_or(Value::Null), None))
        } else {
            match try_join_all(running).await {
                Ok(done) => {
                    let outputs = done
                        .into_iter()
                        .map(|t| t.output.unwrap_or(Value::Null))
                        .collect();
                    Ok((Value::Array(outputs), None))
                }
                Err(e) => {
                    self.cancel_unfinished(&branches).await?;
                    Err(e)
                }
            }
        }
    }

    async fn cancel_unfinished(&self, task_ids: &[String]) -> Result<()> {
        for id in task_ids {
            if self.context.task(id).is_ok_and(|t| !t.status.is_terminal()) {
                match self.context.cancel_task(id).await {
                    Ok(_) | Err(CoreError::InvalidTaskState { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn run_switch(
        &self,
        task: &TaskInstance,
        cases: &[BTreeMap<String, SwitchCase>],
        input: Value,
        arguments: &Arguments,
    ) -> Result<KindOutcome> {
        for (name, case) in cases.iter().flatten() {
            let matched = match &case.when {
                Some(when) => self.evaluate_condition(when, &input, arguments, &task.path)?,
                None => true,
            };
            if matched {
                debug!(task = %task.path, case = %name, "Switch case matched");
                return Ok((input, Some(case.then.clone())));
            }
        }
        Ok((input, None))
    }

    async fn run_listen(&self, task: &TaskInstance) -> Result<KindOutcome> {
        if task.status == TaskStatus::Running {
            self.context.suspend_task(&task.id).await?;
        }
        let context = self.context.correlate_task(&task.id).await?;
        self.context.resume_task(&task.id).await?;
        Ok((Value::Array(context.event_payloads()), None))
    }

    async fn run_emit(&self, task: &TaskInstance, emit: &EmitDefinition, input: Value, arguments: &Arguments) -> Result<KindOutcome> {
        let evaluated = self.evaluate(&Value::Object(emit.event.with.clone()), &input, arguments, &task.path)?;
        let Value::Object(mut attributes) = evaluated else {
            return Err(faulted(ProblemDetails::configuration("event attributes must be an object"), &task.path));
        };
        attributes
            .entry("id")
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
        attributes
            .entry("specversion")
            .or_insert_with(|| Value::String(SPEC_VERSION.to_string()));
        let event: Event = serde_json::from_value(Value::Object(attributes))
            .map_err(|e| faulted(ProblemDetails::configuration(format!("invalid event: {}", e)), &task.path))?;

        debug!(task = %task.path, event_id = %event.id, event_type = %event.event_type, "Emitting event");
        self.services
            .events
            .publish(event)
            .await
            .map_err(|p| faulted(p, &task.path))?;
        Ok((input, None))
    }

    async fn run_try(&self, task: &TaskInstance, tasks: &TaskList, input: Value, scope: &Scope) -> Result<KindOutcome> {
        let catch = task.definition.catch.clone().unwrap_or_default();
        let body = self
            .synthesized_child(task, TRY_BODY, tasks, input.clone())
            .await?;

        loop {
            let problem = match self.execute(&body.id, scope.clone()).await {
                Ok(done) => return Ok((done.output.unwrap_or(Value::Null), None)),
                Err(CoreError::TaskFaulted(problem)) => problem,
                Err(e) => return Err(e),
            };

            let error_name = catch.as_.clone().unwrap_or_else(|| "error".to_string());
            let error_value = serde_json::to_value(&problem)?;
            let mut arguments = self.arguments(task, scope);
            arguments.insert(error_name.clone(), error_value.clone());
            if !self.catches(&catch, &problem, &input, &arguments, &task.path)? {
                return Err(CoreError::TaskFaulted(problem));
            }

            if let Some(policy) = &catch.retry {
                let retry = self.context.task(&body.id)?.retries.len() as u32 + 1;
                if retry <= policy.max_retries() {
                    self.sleep(policy.delay_for(retry)).await?;
                }
                match self.context.retry_task(&body.id, problem.clone(), policy).await {
                    Ok(_) => continue,
                    Err(CoreError::RetryLimitExceeded { .. }) if catch.do_.is_some() => {}
                    Err(e) => return Err(e),
                }
            }

            let Some(handler) = &catch.do_ else {
                debug!(task = %task.path, error = %problem, "Error caught");
                return Ok((input, None));
            };
            let handler = self
                .synthesized_child(task, CATCH_HANDLER, handler, input.clone())
                .await?;
            let mut handler_scope = (**scope).clone();
            handler_scope.insert(error_name, error_value);
            let done = self.execute(&handler.id, Arc::new(handler_scope)).await?;
            return Ok((done.output.unwrap_or(Value::Null), None));
        }
    }

    /// The `do` task the engine creates to hold a body or handler.
    async fn synthesized_child(&self, task: &TaskInstance, name: &str, tasks: &TaskList, input: Value) -> Result<TaskInstance> {
        if let Some(existing) = self.context.find_child(&task.id, name) {
            return Ok(existing);
        }
        self.context
            .create_task(
                NewTask::new(
                    name,
                    format!("{}/{}", task.path, name),
                    TaskDefinition::new(TaskKind::Do(tasks.clone())),
                    input,
                )
                .with_parent(&task.id)
                .extension(),
            )
            .await
    }

    fn catches(
        &self,
        catch: &CatchDefinition,
        problem: &ProblemDetails,
        input: &Value,
        arguments: &Arguments,
        path: &str,
    ) -> Result<bool> {
        if let Some(filter) = &catch.errors
            && !filter.matches(problem)
        {
            return Ok(false);
        }
        if let Some(when) = &catch.when
            && !self.evaluate_condition(when, input, arguments, path)?
        {
            return Ok(false);
        }
        if let Some(except_when) = &catch.except_when
            && self.evaluate_condition(except_when, input, arguments, path)?
        {
            return Ok(false);
        }
        Ok(true)
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.context.cancellation().cancelled() => Err(CoreError::Cancelled),
        }
    }
}

/// Executes a workflow instance from its current state to a terminal phase.
pub struct WorkflowExecutor {
    workflow: Workflow,
    context: Arc<WorkflowExecutionContext>,
    tasks: TaskExecutor,
}

impl WorkflowExecutor {
    /// Create an executor for `workflow` over `context`.
    pub fn new(workflow: Workflow, context: Arc<WorkflowExecutionContext>, services: ExecutionServices) -> Self {
        let tasks = TaskExecutor::new(context.clone(), services);
        Self {
            workflow,
            context,
            tasks,
        }
    }

    /// The execution context.
    pub fn context(&self) -> &Arc<WorkflowExecutionContext> {
        &self.context
    }

    /// Lifecycle events of this instance.
    pub fn subscribe(&self) -> mpsc::Receiver<LifecycleEvent> {
        self.context
            .lifecycle()
            .subscribe(LifecycleFilter::instance(self.context.instance_id()))
    }

    /// Cancel the instance. The running [`execute`](Self::execute) returns
    /// once the current unit of work finished.
    pub async fn cancel(&self) -> Result<WorkflowInstance> {
        self.context.cancel().await
    }

    /// Run the instance to a terminal phase and return it.
    #[instrument(skip(self), fields(instance_id = %self.context.instance_id()))]
    pub async fn execute(&self) -> Result<WorkflowInstance> {
        let watcher = self.context.spawn_watcher();
        let result = self.drive().await;
        if self.context.instance().status.phase.is_terminal() {
            match self.context.release_listen_triggers().await {
                Ok(0) => {}
                Ok(released) => debug!(released, "Released listen triggers of settled instance"),
                Err(e) => warn!(error = %e, "Failed to release listen triggers"),
            }
        }
        self.context.close();
        if let Err(e) = watcher.await {
            warn!(error = %e, "Instance watcher task failed");
        }
        result
    }

    async fn drive(&self) -> Result<WorkflowInstance> {
        let instance = self.context.instance();
        if instance.status.phase.is_terminal() {
            return Ok(instance);
        }
        if instance.status.phase == WorkflowPhase::Pending {
            self.context.start().await?;
        }

        let root = match instance.status.roots.first() {
            Some(id) => self.context.task(id)?,
            None => {
                self.context
                    .create_task(NewTask::new(
                        "do",
                        "/do",
                        TaskDefinition::new(TaskKind::Do(self.workflow.spec.tasks.clone())),
                        instance.spec.input.clone(),
                    ))
                    .await?
            }
        };

        let settled = match self.tasks.execute(&root.id, Arc::new(Arguments::new())).await {
            Ok(done) => self.context.set_result(done.output.unwrap_or(Value::Null)).await,
            Err(CoreError::Cancelled) => Ok(self.context.instance()),
            Err(e) => self.context.set_error(e.to_problem()).await,
        };
        match settled {
            Err(CoreError::Cancelled) => Ok(self.context.instance()),
            other => other,
        }
    }
}
