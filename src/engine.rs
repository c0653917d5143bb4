//! C5: the execution engine — the lifecycle state machine and the
//! transactional operations that drive an Execution through a Workflow's
//! graph. Built on top of the Repository (C2), Graph Algorithms (C3),
//! Navigator (C6), and Resource Coordinator (C7); publishes best-effort
//! domain events (§6) outside of any transaction.

use crate::algorithms::initial_steps;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{DomainEvent, DomainEventType, EventBus};
use crate::models::{
    Execution, ExecutionStatus, NavigationActionType, NavigationEvent, StepExecution,
    StepExecutionStatus, Workflow, WorkflowStatus,
};
use crate::navigator::{dispatch_decision, next_step_selection, SelectedStep};
use crate::repository::{LoadOptions, PendingWrite, Repository};
use crate::resources::{InventoryOracle, ResourceCoordinator};
use crate::value::ValueMap;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Everything `CompleteStep` needs beyond the ids: the free-form step data
/// the caller wants recorded, and (for a decision point) the chosen option.
#[derive(Debug, Clone, Default)]
pub struct CompleteStepInput {
    pub step_data: Option<ValueMap>,
    pub decision_option_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressSummary {
    pub completed_steps: usize,
    pub visited_steps: usize,
    pub progress: f64,
    pub estimated_remaining_minutes: Option<i64>,
}

fn value_map_with(pairs: &[(&str, crate::value::Value)]) -> ValueMap {
    let mut map = ValueMap::new();
    for (k, v) in pairs {
        map.insert(k.to_string(), v.clone());
    }
    map
}

/// `IsWorkflowComplete` (§4.5.5), evaluated right after a step completion:
/// every ever-entered step must be completed/skipped, and either the
/// NextStepSelection for `last_step_id` was empty or `last_step_id` itself
/// is an outcome step.
pub fn is_workflow_complete(
    workflow: &Workflow,
    execution: &Execution,
    step_executions: &[StepExecution],
    last_step_id: &str,
    selection_is_empty: bool,
) -> bool {
    let all_terminal = step_executions
        .iter()
        .filter(|se| se.status != StepExecutionStatus::Ready)
        .all(|se| matches!(se.status, StepExecutionStatus::Completed | StepExecutionStatus::Skipped));
    if !all_terminal {
        return false;
    }
    let step = match workflow.get_step(last_step_id) {
        Some(s) => s,
        None => return false,
    };
    if !(selection_is_empty || step.is_outcome) {
        return false;
    }
    if workflow.has_multiple_outcomes {
        return execution.selected_outcome_id.is_some() || step.is_outcome;
    }
    true
}

pub struct Engine<'a, R: Repository> {
    repo: &'a R,
    config: &'a CoreConfig,
    oracle: Arc<dyn InventoryOracle>,
    events: Option<EventBus>,
}

impl<'a, R: Repository> Engine<'a, R> {
    pub fn new(repo: &'a R, config: &'a CoreConfig, oracle: Arc<dyn InventoryOracle>, events: Option<EventBus>) -> Self {
        Self { repo, config, oracle, events }
    }

    fn coordinator(&self) -> ResourceCoordinator<'a> {
        ResourceCoordinator::new(Arc::clone(&self.oracle), self.config)
    }

    fn publish(&self, event_type: DomainEventType, payload: ValueMap) {
        if let Some(bus) = &self.events {
            bus.publish(DomainEvent::new(event_type, payload));
        }
    }

    fn load(&self, execution_id: Uuid) -> CoreResult<(Execution, Vec<StepExecution>, Workflow)> {
        let (execution, step_executions, _events) = self
            .repo
            .load_execution(execution_id)?
            .ok_or_else(|| CoreError::NotFound(format!("execution '{}'", execution_id)))?;
        let workflow = self
            .repo
            .load_workflow(&execution.workflow_id, &LoadOptions::default())?
            .ok_or_else(|| CoreError::NotFound(format!("workflow '{}'", execution.workflow_id)))?;
        Ok((execution, step_executions, workflow))
    }

    /// Retries an optimistic-conflict-sensitive operation up to the
    /// configured bound (§5: "at most one retry ... 2 attempts").
    fn with_retry<T>(&self, mut op: impl FnMut() -> CoreResult<T>) -> CoreResult<T> {
        let attempts = self.config.concurrency.optimistic_retry_attempts.max(1);
        let mut last_err = None;
        for _ in 0..attempts {
            match op() {
                Ok(v) => return Ok(v),
                Err(CoreError::Conflict(msg)) => last_err = Some(CoreError::Conflict(msg)),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::Internal("retry loop exhausted with no recorded error".to_string())))
    }

    /// `Start(workflowId, userId, selectedOutcomeId?)` (§4.5.2).
    pub fn start(&self, workflow_id: &str, user_id: &str, selected_outcome_id: Option<String>) -> CoreResult<Execution> {
        let workflow = self
            .repo
            .load_workflow(workflow_id, &LoadOptions::default())?
            .ok_or_else(|| CoreError::NotFound(format!("workflow '{}'", workflow_id)))?;
        if !matches!(workflow.status, WorkflowStatus::Active | WorkflowStatus::Published) {
            return Err(CoreError::BusinessRule(format!(
                "workflow '{}' is not active or published",
                workflow_id
            )));
        }
        if let Some(outcome_id) = &selected_outcome_id {
            if !workflow.outcomes.iter().any(|o| &o.id == outcome_id) {
                return Err(CoreError::validation_one("selectedOutcomeId", "outcome does not belong to this workflow"));
            }
        }

        let initial = initial_steps(&workflow);
        let first = initial
            .first()
            .ok_or_else(|| CoreError::BusinessRule(format!("workflow '{}' has no initial step", workflow_id)))?;

        let mut execution = Execution::new(workflow_id, user_id);
        execution.selected_outcome_id = selected_outcome_id;
        execution.current_step_id = Some(first.id.clone());

        // Resource reservation can fail (Unreserved under strict policy); do
        // it before any row is persisted so a rejected start leaves nothing
        // behind (scenario 4, §8).
        self.coordinator().reserve(&mut execution, &workflow)?;

        let mut writes = vec![PendingWrite::CreateExecution(execution.clone())];
        for step in &initial {
            let mut step_exec = StepExecution::new_ready(execution.id, step.id.clone());
            if step.id == first.id {
                step_exec.status = StepExecutionStatus::Active;
                step_exec.started_at = Some(Utc::now());
            }
            writes.push(PendingWrite::UpsertStepExecution(step_exec));
        }
        let event = NavigationEvent::new(execution.id, Some(first.id.clone()), NavigationActionType::Started, ValueMap::new());
        writes.push(PendingWrite::AppendNavigation(event));
        self.repo.commit(writes)?;

        self.publish(
            DomainEventType::ExecutionStarted,
            value_map_with(&[
                ("executionId", crate::value::Value::String(execution.id.to_string())),
                ("workflowId", crate::value::Value::String(execution.workflow_id.clone())),
            ]),
        );

        Ok(execution)
    }

    /// `CompleteStep(executionId, stepId, completionData?)` (§4.5.3).
    pub fn complete_step(&self, execution_id: Uuid, step_id: &str, input: CompleteStepInput) -> CoreResult<Execution> {
        self.with_retry(|| self.complete_step_once(execution_id, step_id, input.clone()))
    }

    fn complete_step_once(&self, execution_id: Uuid, step_id: &str, input: CompleteStepInput) -> CoreResult<Execution> {
        let (mut execution, mut step_executions, workflow) = self.load(execution_id)?;
        if execution.status != ExecutionStatus::Active {
            return Err(CoreError::InvalidStateTransition(format!(
                "execution '{}' is not active",
                execution_id
            )));
        }
        let step = workflow
            .get_step(step_id)
            .ok_or_else(|| CoreError::validation_one("stepId", "step does not belong to this execution's workflow"))?;

        let expected_version = execution.version;

        {
            let step_exec = step_executions
                .iter_mut()
                .find(|se| se.step_id == step_id)
                .ok_or_else(|| CoreError::InvalidStateTransition(format!("no StepExecution exists for step '{}'", step_id)))?;
            if step_exec.status != StepExecutionStatus::Active {
                return Err(CoreError::InvalidStateTransition(format!(
                    "step '{}' is not active (B3)",
                    step_id
                )));
            }
        }

        if step.is_decision_point {
            let option_id = input
                .decision_option_id
                .as_deref()
                .ok_or_else(|| CoreError::validation_one("decisionOptionId", "required to complete a decision-point step (B5)"))?;
            dispatch_decision(step, option_id, &mut execution.execution_data)?;
        }

        let last = input.step_data.clone().unwrap_or_default();
        let mut writes = Vec::new();
        {
            let step_exec = step_executions.iter_mut().find(|se| se.step_id == step_id).unwrap();
            step_exec.status = StepExecutionStatus::Completed;
            let now = Utc::now();
            step_exec.completed_at = Some(now);
            if let Some(started) = step_exec.started_at {
                step_exec.actual_duration_minutes = Some((now - started).num_minutes().max(0));
            }
            step_exec.step_data = last.clone();
            writes.push(PendingWrite::UpsertStepExecution(step_exec.clone()));
        }

        let completed_event = NavigationEvent::new(execution.id, Some(step_id.to_string()), NavigationActionType::Completed, ValueMap::new());
        writes.push(PendingWrite::AppendNavigation(completed_event));
        if step.is_decision_point {
            let decision_event = NavigationEvent::new(execution.id, Some(step_id.to_string()), NavigationActionType::DecisionMade, ValueMap::new());
            writes.push(PendingWrite::AppendNavigation(decision_event));
        }

        let selection = next_step_selection(&workflow, step_id, &execution.execution_data, &last);

        // Every write above and whichever write follows below — the
        // completion, the optional decision event, and the resulting
        // execution update or terminal finish — commits as one transaction
        // (§4.2), so two racing completions can't both land a `completed`
        // NavigationEvent (§4.5.9, scenario 6).
        let result = if selection.is_empty() {
            if is_workflow_complete(&workflow, &execution, &step_executions, step_id, true) {
                self.finish(execution, expected_version, ExecutionStatus::Completed, NavigationActionType::WorkflowCompleted, writes)?
            } else {
                execution.current_step_id = None;
                execution.version += 1;
                writes.push(PendingWrite::UpdateExecution { execution: execution.clone(), expected_version });
                self.repo.commit(writes)?;
                execution
            }
        } else {
            self.promote_selection(&mut execution, &mut step_executions, &selection.steps, &mut writes)?;
            execution.version += 1;
            writes.push(PendingWrite::UpdateExecution { execution: execution.clone(), expected_version });
            self.repo.commit(writes)?;
            execution
        };

        self.publish(
            DomainEventType::StepCompleted,
            value_map_with(&[
                ("executionId", crate::value::Value::String(result.id.to_string())),
                ("stepId", crate::value::Value::String(step_id.to_string())),
            ]),
        );
        if step.is_decision_point {
            self.publish(
                DomainEventType::DecisionMade,
                value_map_with(&[
                    ("executionId", crate::value::Value::String(result.id.to_string())),
                    ("stepId", crate::value::Value::String(step_id.to_string())),
                ]),
            );
        }
        Ok(result)
    }

    /// Promotes the first selected step to `current`/`active`; remaining
    /// `Parallel` edges become additional `ready` StepExecutions; other
    /// connection types are left un-created until selection repeats
    /// (§4.6 point 4).
    fn promote_selection(
        &self,
        execution: &mut Execution,
        step_executions: &mut Vec<StepExecution>,
        selected: &[SelectedStep],
        writes: &mut Vec<PendingWrite>,
    ) -> CoreResult<()> {
        let now = Utc::now();
        for (i, sel) in selected.iter().enumerate() {
            let is_first = i == 0;
            if !is_first && sel.connection_type != crate::models::ConnectionType::Parallel {
                continue;
            }
            if let Some(existing) = step_executions.iter_mut().find(|se| se.step_id == sel.step_id) {
                if is_first {
                    existing.status = StepExecutionStatus::Active;
                    existing.started_at = Some(now);
                }
                writes.push(PendingWrite::UpsertStepExecution(existing.clone()));
            } else {
                let mut step_exec = StepExecution::new_ready(execution.id, sel.step_id.clone());
                if is_first {
                    step_exec.status = StepExecutionStatus::Active;
                    step_exec.started_at = Some(now);
                }
                writes.push(PendingWrite::UpsertStepExecution(step_exec.clone()));
                step_executions.push(step_exec);
            }
        }
        execution.current_step_id = selected.first().map(|s| s.step_id.clone());
        Ok(())
    }

    /// `NavigateTo(executionId, targetStepId)` (§4.5.4).
    pub fn navigate_to(&self, execution_id: Uuid, target_step_id: &str) -> CoreResult<Execution> {
        self.with_retry(|| self.navigate_to_once(execution_id, target_step_id))
    }

    fn navigate_to_once(&self, execution_id: Uuid, target_step_id: &str) -> CoreResult<Execution> {
        let (mut execution, mut step_executions, workflow) = self.load(execution_id)?;
        if execution.status != ExecutionStatus::Active {
            return Err(CoreError::InvalidStateTransition(format!(
                "execution '{}' is not active",
                execution_id
            )));
        }
        workflow
            .get_step(target_step_id)
            .ok_or_else(|| CoreError::validation_one("targetStepId", "target step does not belong to this execution's workflow (B4)"))?;

        let mut from_candidates: Vec<&str> = step_executions
            .iter()
            .filter(|se| se.status == StepExecutionStatus::Completed)
            .map(|se| se.step_id.as_str())
            .collect();
        if let Some(current) = &execution.current_step_id {
            from_candidates.push(current.as_str());
        }
        let reachable = from_candidates
            .iter()
            .any(|from| crate::algorithms::shortest_path(&workflow, from, target_step_id).is_some());
        if !reachable {
            return Err(CoreError::validation_one(
                "targetStepId",
                format!("step '{}' is not reachable from the current execution state", target_step_id),
            ));
        }

        let expected_version = execution.version;
        let now = Utc::now();
        let mut writes = Vec::new();

        for step_exec in step_executions.iter_mut() {
            if step_exec.status == StepExecutionStatus::Active && step_exec.step_id != target_step_id {
                step_exec.status = StepExecutionStatus::Ready;
                writes.push(PendingWrite::UpsertStepExecution(step_exec.clone()));
            }
        }

        match step_executions.iter_mut().find(|se| se.step_id == target_step_id) {
            Some(step_exec) => {
                step_exec.status = StepExecutionStatus::Active;
                if step_exec.started_at.is_none() {
                    step_exec.started_at = Some(now);
                }
                writes.push(PendingWrite::UpsertStepExecution(step_exec.clone()));
            }
            None => {
                let mut step_exec = StepExecution::new_ready(execution.id, target_step_id.to_string());
                step_exec.status = StepExecutionStatus::Active;
                step_exec.started_at = Some(now);
                writes.push(PendingWrite::UpsertStepExecution(step_exec));
            }
        }

        execution.current_step_id = Some(target_step_id.to_string());
        execution.version += 1;
        writes.push(PendingWrite::UpdateExecution { execution: execution.clone(), expected_version });

        let event = NavigationEvent::new(execution.id, Some(target_step_id.to_string()), NavigationActionType::NavigateTo, ValueMap::new());
        writes.push(PendingWrite::AppendNavigation(event));

        self.repo.commit(writes)?;
        Ok(execution)
    }

    /// Finishes an execution (Complete/Cancel/Fail). `writes` carries
    /// whatever the caller already decided on in this logical operation
    /// (e.g. `complete_step_once`'s step-completion writes); it commits
    /// together with the status update and terminal NavigationEvent as one
    /// transaction.
    fn finish(
        &self,
        mut execution: Execution,
        expected_version: i64,
        status: ExecutionStatus,
        action: NavigationActionType,
        mut writes: Vec<PendingWrite>,
    ) -> CoreResult<Execution> {
        let now = Utc::now();
        execution.status = status;
        execution.completed_at = Some(now);
        execution.total_duration_minutes = Some((now - execution.started_at).num_minutes().max(0));
        self.coordinator().release(&mut execution)?;
        execution.version += 1;
        writes.push(PendingWrite::UpdateExecution { execution: execution.clone(), expected_version });

        let event = NavigationEvent::new(execution.id, execution.current_step_id.clone(), action, ValueMap::new());
        writes.push(PendingWrite::AppendNavigation(event));

        self.repo.commit(writes)?;

        if status == ExecutionStatus::Completed {
            self.publish(
                DomainEventType::ExecutionCompleted,
                value_map_with(&[("executionId", crate::value::Value::String(execution.id.to_string()))]),
            );
        }
        Ok(execution)
    }

    /// `Cancel(execution)` (§4.5.6) — allowed from `active` or `paused`.
    pub fn cancel(&self, execution_id: Uuid) -> CoreResult<Execution> {
        self.with_retry(|| {
            let (execution, _step_executions, _workflow) = self.load(execution_id)?;
            if execution.status.is_terminal() {
                return Err(CoreError::InvalidStateTransition(format!(
                    "execution '{}' is already terminal",
                    execution_id
                )));
            }
            let expected_version = execution.version;
            self.finish(execution, expected_version, ExecutionStatus::Cancelled, NavigationActionType::Cancelled, Vec::new())
        })
    }

    /// `Fail(execution)` (§4.5.6) — allowed from `active`; used when an
    /// engine caller determines the execution cannot proceed.
    pub fn fail(&self, execution_id: Uuid) -> CoreResult<Execution> {
        self.with_retry(|| {
            let (execution, _step_executions, _workflow) = self.load(execution_id)?;
            if execution.status.is_terminal() {
                return Err(CoreError::InvalidStateTransition(format!(
                    "execution '{}' is already terminal",
                    execution_id
                )));
            }
            let expected_version = execution.version;
            self.finish(execution, expected_version, ExecutionStatus::Failed, NavigationActionType::Failed, Vec::new())
        })
    }

    /// `Pause` (§4.5.7) — pure status flip; reservations are retained.
    pub fn pause(&self, execution_id: Uuid) -> CoreResult<Execution> {
        self.with_retry(|| {
            let (mut execution, _step_executions, _workflow) = self.load(execution_id)?;
            if execution.status != ExecutionStatus::Active {
                return Err(CoreError::InvalidStateTransition(format!(
                    "execution '{}' is not active",
                    execution_id
                )));
            }
            let expected_version = execution.version;
            execution.status = ExecutionStatus::Paused;
            execution.version += 1;
            let event = NavigationEvent::new(execution.id, execution.current_step_id.clone(), NavigationActionType::Paused, ValueMap::new());
            self.repo.commit(vec![
                PendingWrite::UpdateExecution { execution: execution.clone(), expected_version },
                PendingWrite::AppendNavigation(event),
            ])?;
            Ok(execution)
        })
    }

    /// `Resume` (§4.5.7) — inverse of `Pause`; leaves `currentStepId`,
    /// StepExecution statuses, and reservations unchanged (R2).
    pub fn resume(&self, execution_id: Uuid) -> CoreResult<Execution> {
        self.with_retry(|| {
            let (mut execution, _step_executions, _workflow) = self.load(execution_id)?;
            if execution.status != ExecutionStatus::Paused {
                return Err(CoreError::InvalidStateTransition(format!(
                    "execution '{}' is not paused",
                    execution_id
                )));
            }
            let expected_version = execution.version;
            execution.status = ExecutionStatus::Active;
            execution.version += 1;
            let event = NavigationEvent::new(execution.id, execution.current_step_id.clone(), NavigationActionType::Resumed, ValueMap::new());
            self.repo.commit(vec![
                PendingWrite::UpdateExecution { execution: execution.clone(), expected_version },
                PendingWrite::AppendNavigation(event),
            ])?;
            Ok(execution)
        })
    }

    /// Progress summary (§4.5.8), computed on demand with no persisted state.
    pub fn progress(&self, execution_id: Uuid) -> CoreResult<ProgressSummary> {
        let (execution, step_executions, workflow) = self.load(execution_id)?;
        let visited_steps = step_executions.iter().filter(|se| se.status != StepExecutionStatus::Ready).count();
        let completed_steps = step_executions
            .iter()
            .filter(|se| matches!(se.status, StepExecutionStatus::Completed | StepExecutionStatus::Skipped))
            .count();
        let progress = if visited_steps == 0 { 0.0 } else { completed_steps as f64 / visited_steps as f64 };

        let estimated_remaining_minutes = workflow.estimated_duration.map(|total| {
            let elapsed = (Utc::now() - execution.started_at).num_minutes().max(0);
            let remaining_total = (total - elapsed).max(0);
            (remaining_total as f64 * (1.0 - progress)).round() as i64
        });

        Ok(ProgressSummary {
            completed_steps,
            visited_steps,
            progress,
            estimated_remaining_minutes,
        })
    }
}
