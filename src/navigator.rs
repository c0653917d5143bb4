//! C6: next-step selection, decision dispatch, interactive guidance, and
//! optimal-path projection. Sits on top of the pure graph algorithms (C3)
//! and the condition evaluator (C4); never touches the repository itself —
//! the engine (C5) is the only caller that persists what the navigator
//! decides.

use crate::algorithms::{candidate_next_steps, shortest_path};
use crate::condition::{evaluate_condition, Context as CondContext};
use crate::error::{CoreError, CoreResult};
use crate::models::{ConnectionType, Execution, Step, StepExecution, StepExecutionStatus, Workflow};
use crate::value::ValueMap;

/// One edge the navigator decided to include, still carrying its
/// connection type so the engine can decide how many StepExecutions to
/// promote (§4.6 point 4).
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedStep {
    pub step_id: String,
    pub connection_type: ConnectionType,
}

#[derive(Debug, Clone, Default)]
pub struct SelectionResult {
    pub steps: Vec<SelectedStep>,
}

impl SelectionResult {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// `NextStepSelection(execution, completedStepId)` (§4.6).
///
/// Queries outgoing connections in deterministic order, evaluates each
/// `condition` against `(executionData, last)`, and includes the edge if
/// the condition is null/true; an evaluation error downgrades the edge to
/// false and is logged rather than propagated. If nothing matched and a
/// default edge exists, the default is appended last.
pub fn next_step_selection(
    workflow: &Workflow,
    completed_step_id: &str,
    execution_data: &ValueMap,
    last: &ValueMap,
) -> SelectionResult {
    let ctx = CondContext::new(execution_data).with_last(last);
    let connections = candidate_next_steps(workflow, completed_step_id);

    let mut matched = Vec::new();
    let mut default_edge = None;

    for conn in &connections {
        if conn.is_default {
            default_edge = Some(conn);
        }
        let included = match &conn.condition {
            None => true,
            Some(source) => match evaluate_condition(&ctx, source) {
                Ok(b) => b,
                Err(e) => {
                    log::warn!(
                        "condition error on connection '{}' ({} -> {}): {}, treating edge as false",
                        conn.id, conn.source_step_id, conn.target_step_id, e
                    );
                    false
                }
            },
        };
        if included {
            matched.push(SelectedStep {
                step_id: conn.target_step_id.clone(),
                connection_type: conn.connection_type,
            });
        }
    }

    if matched.is_empty() {
        if let Some(default) = default_edge {
            matched.push(SelectedStep {
                step_id: default.target_step_id.clone(),
                connection_type: default.connection_type,
            });
        }
    }

    SelectionResult { steps: matched }
}

/// Applies a decision-point completion: validates `decision_option_id`
/// against the step's options and applies the chosen option's
/// `resultAction` to `executionData`. The step must then be completed by
/// the caller (engine) through the normal `CompleteStep` path, with next
/// steps selected against the mutated context (§4.6).
pub fn dispatch_decision(step: &Step, decision_option_id: &str, execution_data: &mut ValueMap) -> CoreResult<()> {
    if !step.is_decision_point {
        return Err(CoreError::validation_one(
            "stepId",
            format!("step '{}' is not a decision point", step.id),
        ));
    }
    let option = step
        .decision_options
        .iter()
        .find(|o| o.id == decision_option_id)
        .ok_or_else(|| {
            CoreError::validation_one(
                "decisionOptionId",
                format!("decision option '{}' does not belong to step '{}'", decision_option_id, step.id),
            )
        })?;
    if let Some(action) = &option.result_action {
        crate::condition::apply_result_action(execution_data, action)?;
    }
    Ok(())
}

/// The action a caller should present next, derived purely from current
/// StepExecution state (§4.6 "Guidance / suggestion").
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Guidance {
    NavigateToStep { step_id: String },
    ManualSelection,
    StartStep { step_id: String },
    MakeDecision { step_id: String },
    CompleteStep { step_id: String },
    WorkflowComplete,
}

pub fn guidance(
    workflow: &Workflow,
    execution: &Execution,
    step_executions: &[StepExecution],
    is_workflow_complete: bool,
) -> Guidance {
    let current = execution
        .current_step_id
        .as_ref()
        .and_then(|id| step_executions.iter().find(|se| &se.step_id == id));

    let current = match current {
        None => {
            let initial = crate::algorithms::initial_steps(workflow);
            return match initial.first() {
                Some(step) => Guidance::NavigateToStep { step_id: step.id.clone() },
                None => Guidance::ManualSelection,
            };
        }
        Some(se) => se,
    };

    match current.status {
        StepExecutionStatus::Ready => Guidance::StartStep { step_id: current.step_id.clone() },
        StepExecutionStatus::Active => {
            let step = workflow.get_step(&current.step_id);
            if step.map(|s| s.is_decision_point).unwrap_or(false) {
                Guidance::MakeDecision { step_id: current.step_id.clone() }
            } else {
                Guidance::CompleteStep { step_id: current.step_id.clone() }
            }
        }
        StepExecutionStatus::Completed => {
            let selection = next_step_selection(workflow, &current.step_id, &execution.execution_data, &current.step_data);
            match selection.steps.first() {
                Some(next) => Guidance::NavigateToStep { step_id: next.step_id.clone() },
                None if is_workflow_complete => Guidance::WorkflowComplete,
                None => Guidance::ManualSelection,
            }
        }
        StepExecutionStatus::Skipped | StepExecutionStatus::Failed => Guidance::ManualSelection,
    }
}

/// Shortest path from `from` to every outcome step, returning the overall
/// best by hop count then summed `estimatedDuration` ascending (§4.6
/// "Optimal path").
pub fn optimal_path_to_outcome(workflow: &Workflow, from: &str) -> Option<Vec<String>> {
    let path_duration = |path: &[String]| -> i64 {
        path.iter()
            .filter_map(|id| workflow.get_step(id))
            .filter_map(|s| s.estimated_duration)
            .sum()
    };

    workflow
        .steps
        .iter()
        .filter(|s| s.is_outcome)
        .filter_map(|outcome| shortest_path(workflow, from, &outcome.id))
        .min_by(|a, b| a.len().cmp(&b.len()).then_with(|| path_duration(a).cmp(&path_duration(b))))
}

/// A focused, read-only projection of a single step (§4.6 "Step guidance"):
/// its detail plus the attached resources and, for a decision point, its
/// options — everything a caller needs to render one step without a second
/// round trip to the repository.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepGuidance<'a> {
    pub step: &'a Step,
    pub resources: &'a [crate::models::StepResource],
    pub decision_options: Option<&'a [crate::models::DecisionOption]>,
}

pub fn step_guidance(workflow: &Workflow, step_id: &str) -> CoreResult<StepGuidance<'_>> {
    let step = workflow
        .get_step(step_id)
        .ok_or_else(|| CoreError::NotFound(format!("step '{}'", step_id)))?;
    Ok(StepGuidance {
        step,
        resources: &step.resources,
        decision_options: step.is_decision_point.then_some(step.decision_options.as_slice()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Connection, DecisionOption, StepType};

    fn decision_workflow() -> Workflow {
        let mut wf = Workflow::new("wf1", "Decision", "user-1");
        let mut d = Step::new("d", "wf1", "D", 1);
        d.step_type = StepType::Decision;
        d.is_decision_point = true;
        d.decision_options = vec![
            DecisionOption {
                id: "x".to_string(),
                step_id: "d".to_string(),
                option_text: "go-left".to_string(),
                result_action: Some("ctx.path = 'L';".to_string()),
                display_order: 1,
                is_default: false,
            },
            DecisionOption {
                id: "y".to_string(),
                step_id: "d".to_string(),
                option_text: "go-right".to_string(),
                result_action: Some("ctx.path = 'R';".to_string()),
                display_order: 2,
                is_default: false,
            },
        ];
        let mut left = Step::new("l", "wf1", "Left", 2);
        left.is_outcome = true;
        let mut right = Step::new("r", "wf1", "Right", 3);
        right.is_outcome = true;

        let mut cl = Connection::new("c-l", "d", "l", ConnectionType::Conditional, 1).unwrap();
        cl.condition = Some("ctx.path == 'L'".to_string());
        let mut cr = Connection::new("c-r", "d", "r", ConnectionType::Conditional, 2).unwrap();
        cr.condition = Some("ctx.path == 'R'".to_string());
        d.outgoing_connections = vec![cl, cr];

        wf.steps = vec![d, left, right];
        wf
    }

    #[test]
    fn decision_dispatch_applies_result_action_and_routes_accordingly() {
        let wf = decision_workflow();
        let step = wf.get_step("d").unwrap();
        let mut execution_data = ValueMap::new();

        dispatch_decision(step, "x", &mut execution_data).unwrap();
        assert_eq!(execution_data.get("path").unwrap().as_str(), Some("L"));

        let selection = next_step_selection(&wf, "d", &execution_data, &ValueMap::new());
        assert_eq!(selection.steps.len(), 1);
        assert_eq!(selection.steps[0].step_id, "l");
    }

    #[test]
    fn decision_dispatch_rejects_unknown_option() {
        let wf = decision_workflow();
        let step = wf.get_step("d").unwrap();
        let mut execution_data = ValueMap::new();
        let result = dispatch_decision(step, "nonexistent", &mut execution_data);
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[test]
    fn selection_falls_back_to_default_when_nothing_else_matches() {
        let mut wf = Workflow::new("wf1", "Default fallback", "user-1");
        let mut a = Step::new("a", "wf1", "A", 1);
        let mut b = Step::new("b", "wf1", "B", 2);
        b.is_outcome = true;
        let mut c = Step::new("c", "wf1", "C", 3);
        c.is_outcome = true;

        let mut cond = Connection::new("c1", "a", "b", ConnectionType::Conditional, 1).unwrap();
        cond.condition = Some("ctx.flag == true".to_string());
        let mut default = Connection::new("c2", "a", "c", ConnectionType::Sequential, 2).unwrap();
        default.is_default = true;
        a.outgoing_connections = vec![cond, default];
        wf.steps = vec![a, b, c];

        let selection = next_step_selection(&wf, "a", &ValueMap::new(), &ValueMap::new());
        assert_eq!(selection.steps.len(), 1);
        assert_eq!(selection.steps[0].step_id, "c");
    }

    #[test]
    fn guidance_suggests_make_decision_for_an_active_decision_step() {
        let wf = decision_workflow();
        let execution = Execution {
            current_step_id: Some("d".to_string()),
            ..Execution::new("wf1", "user-1")
        };
        let step_exec = StepExecution {
            status: StepExecutionStatus::Active,
            ..StepExecution::new_ready(execution.id, "d")
        };
        let guidance = guidance(&wf, &execution, &[step_exec], false);
        assert_eq!(guidance, Guidance::MakeDecision { step_id: "d".to_string() });
    }

    #[test]
    fn optimal_path_prefers_fewest_hops() {
        let wf = decision_workflow();
        let path = optimal_path_to_outcome(&wf, "d").unwrap();
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn optimal_path_breaks_equal_hop_ties_by_summed_duration() {
        let mut wf = Workflow::new("wf1", "Fork", "user-1");
        let mut a = Step::new("a", "wf1", "A", 1);
        let mut slow = Step::new("slow", "wf1", "Slow outcome", 2);
        slow.is_outcome = true;
        slow.estimated_duration = Some(30);
        let mut fast = Step::new("fast", "wf1", "Fast outcome", 3);
        fast.is_outcome = true;
        fast.estimated_duration = Some(5);
        a.outgoing_connections = vec![
            Connection::new("c-slow", "a", "slow", ConnectionType::Sequential, 1).unwrap(),
            Connection::new("c-fast", "a", "fast", ConnectionType::Sequential, 2).unwrap(),
        ];
        wf.steps = vec![a, slow, fast];

        let path = optimal_path_to_outcome(&wf, "a").unwrap();
        assert_eq!(path, vec!["a".to_string(), "fast".to_string()]);
    }

    #[test]
    fn step_guidance_exposes_decision_options_only_for_decision_points() {
        let wf = decision_workflow();

        let decision = step_guidance(&wf, "d").unwrap();
        assert!(decision.decision_options.is_some());
        assert_eq!(decision.decision_options.unwrap().len(), 2);

        let outcome = step_guidance(&wf, "l").unwrap();
        assert!(outcome.decision_options.is_none());
    }

    #[test]
    fn step_guidance_rejects_unknown_step() {
        let wf = decision_workflow();
        assert!(step_guidance(&wf, "does-not-exist").is_err());
    }
}
