//! End-to-end scenarios from spec §8, exercised against a real SQLite
//! database file (via `tempfile`) rather than the in-memory connection the
//! unit tests use, so the persistence boundary (schema, cascades, optimistic
//! concurrency) is exercised exactly as a caller would hit it.

use std::sync::Arc;
use tempfile::tempdir;

use workflow_engine_core::codec::{export_workflow, import_workflow};
use workflow_engine_core::config::{CoreConfig, ReservationPolicy};
use workflow_engine_core::engine::{CompleteStepInput, Engine};
use workflow_engine_core::error::CoreError;
use workflow_engine_core::graph::validate;
use workflow_engine_core::models::{
    Connection, ConnectionType, DecisionOption, ExecutionStatus, Outcome, ResourceKind, Step,
    StepResource, StepType, Workflow, WorkflowStatus,
};
use workflow_engine_core::repository::{ExecutionFilter, Repository, SqliteRepository};
use workflow_engine_core::resources::InventoryOracle;

struct StubOracle {
    on_hand: f64,
}

impl InventoryOracle for StubOracle {
    fn check_material(&self, _id: &str, qty: f64) -> workflow_engine_core::error::CoreResult<(bool, f64)> {
        Ok((self.on_hand >= qty, self.on_hand))
    }
    fn reserve_material(&self, id: &str, _qty: f64) -> workflow_engine_core::error::CoreResult<String> {
        Ok(format!("mat-tok-{}", id))
    }
    fn release_material(&self, _token: &str) -> workflow_engine_core::error::CoreResult<()> {
        Ok(())
    }
    fn check_tool(&self, _id: &str, _duration_minutes: i64) -> workflow_engine_core::error::CoreResult<(bool, f64)> {
        Ok((true, 1.0))
    }
    fn reserve_tool(&self, id: &str, _duration_minutes: i64) -> workflow_engine_core::error::CoreResult<String> {
        Ok(format!("tool-tok-{}", id))
    }
    fn release_tool(&self, _token: &str) -> workflow_engine_core::error::CoreResult<()> {
        Ok(())
    }
    fn find_material(&self, _name: &str) -> workflow_engine_core::error::CoreResult<Option<String>> {
        Ok(None)
    }
    fn find_tool(&self, _name: &str) -> workflow_engine_core::error::CoreResult<Option<String>> {
        Ok(None)
    }
}

fn repo_in_temp_dir() -> (SqliteRepository, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("workflow_engine.db");
    let config = CoreConfig::default();
    let repo = SqliteRepository::new(&path, &config.database).unwrap();
    (repo, dir)
}

fn engine<'a>(repo: &'a SqliteRepository, config: &'a CoreConfig, oracle: Arc<dyn InventoryOracle>) -> Engine<'a, SqliteRepository> {
    Engine::new(repo, config, oracle, None)
}

fn unlimited_oracle() -> Arc<dyn InventoryOracle> {
    Arc::new(StubOracle { on_hand: 1_000_000.0 })
}

/// Scenario 1: linear workflow A -> B -> C(outcome) runs to completion with
/// exactly 5 NavigationEvents (started, completed*3, workflow_completed).
#[test]
fn scenario_1_linear_workflow_to_completion() {
    let (repo, _dir) = repo_in_temp_dir();
    let config = CoreConfig::default();

    let mut wf = Workflow::new("wf-linear", "Linear", "user-1");
    wf.status = WorkflowStatus::Active;
    let mut a = Step::new("a", "wf-linear", "A", 1);
    let mut b = Step::new("b", "wf-linear", "B", 2);
    let mut c = Step::new("c", "wf-linear", "C", 3);
    c.is_outcome = true;
    a.outgoing_connections.push(Connection::new("c1", "a", "b", ConnectionType::Sequential, 1).unwrap());
    b.outgoing_connections.push(Connection::new("c2", "b", "c", ConnectionType::Sequential, 1).unwrap());
    wf.steps = vec![a, b, c];
    repo.save_workflow(&wf).unwrap();

    let eng = engine(&repo, &config, unlimited_oracle());
    let execution = eng.start("wf-linear", "user-1", None).unwrap();
    assert_eq!(execution.current_step_id.as_deref(), Some("a"));

    let execution = eng.complete_step(execution.id, "a", CompleteStepInput::default()).unwrap();
    assert_eq!(execution.current_step_id.as_deref(), Some("b"));

    let execution = eng.complete_step(execution.id, "b", CompleteStepInput::default()).unwrap();
    assert_eq!(execution.current_step_id.as_deref(), Some("c"));

    let execution = eng.complete_step(execution.id, "c", CompleteStepInput::default()).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let (_, _, events) = repo.load_execution(execution.id).unwrap().unwrap();
    assert_eq!(events.len(), 5, "{:?}", events.iter().map(|e| e.action_type.as_str()).collect::<Vec<_>>());
}

/// Scenario 2: decision branching routes by resultAction and mutates
/// executionData.
#[test]
fn scenario_2_decision_branching_routes_by_result_action() {
    let (repo, _dir) = repo_in_temp_dir();
    let config = CoreConfig::default();

    let mut wf = Workflow::new("wf-decision", "Decision", "user-1");
    wf.status = WorkflowStatus::Active;
    let mut d = Step::new("d", "wf-decision", "D", 1);
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
    let mut left = Step::new("l", "wf-decision", "Left", 2);
    left.is_outcome = true;
    let mut right = Step::new("r", "wf-decision", "Right", 3);
    right.is_outcome = true;
    let mut cl = Connection::new("c-l", "d", "l", ConnectionType::Conditional, 1).unwrap();
    cl.condition = Some("ctx.path == 'L'".to_string());
    let mut cr = Connection::new("c-r", "d", "r", ConnectionType::Conditional, 2).unwrap();
    cr.condition = Some("ctx.path == 'R'".to_string());
    d.outgoing_connections = vec![cl, cr];
    wf.steps = vec![d, left, right];
    repo.save_workflow(&wf).unwrap();

    let eng = engine(&repo, &config, unlimited_oracle());
    let execution = eng.start("wf-decision", "user-1", None).unwrap();
    let execution = eng
        .complete_step(
            execution.id,
            "d",
            CompleteStepInput { step_data: None, decision_option_id: Some("x".to_string()) },
        )
        .unwrap();

    assert_eq!(execution.current_step_id.as_deref(), Some("l"));
    assert_eq!(execution.execution_data.get("path").unwrap().as_str(), Some("L"));
}

/// Scenario 3: publish is rejected for a cycle A -> B -> A, naming the cycle.
#[test]
fn scenario_3_publish_rejects_a_cycle() {
    let mut wf = Workflow::new("wf-cycle", "Cyclic", "user-1");
    let mut a = Step::new("a", "wf-cycle", "A", 1);
    let mut b = Step::new("b", "wf-cycle", "B", 2);
    a.outgoing_connections.push(Connection::new("c1", "a", "b", ConnectionType::Sequential, 1).unwrap());
    b.outgoing_connections.push(Connection::new("c2", "b", "a", ConnectionType::Sequential, 1).unwrap());
    wf.steps = vec![a, b];

    let report = validate(&wf);
    assert!(!report.is_publication_ready());
    let named_cycle = report
        .publication_errors
        .iter()
        .any(|issue| issue.message.contains("[a, b, a]"));
    assert!(named_cycle, "{:?}", report.publication_errors);
}

/// A connection that is literally a self-loop is rejected at construction,
/// before it ever reaches graph validation.
#[test]
fn scenario_3_self_loop_is_rejected_at_construction() {
    let result = Connection::new("c1", "a", "a", ConnectionType::Sequential, 1);
    assert!(matches!(result, Err(CoreError::Validation(_))));
}

/// Scenario 4: starting under a strict reservation policy with insufficient
/// on-hand quantity fails with Unreserved and persists no Execution row.
#[test]
fn scenario_4_strict_reservation_failure_persists_nothing() {
    let (repo, _dir) = repo_in_temp_dir();
    let mut config = CoreConfig::default();
    config.reservation.policy = ReservationPolicy::Strict;

    let mut wf = Workflow::new("wf-resource", "Needs material", "user-1");
    wf.status = WorkflowStatus::Active;
    let mut a = Step::new("a", "wf-resource", "A", 1);
    a.resources.push(StepResource {
        id: "res-1".to_string(),
        step_id: "a".to_string(),
        resource_kind: ResourceKind::Material,
        material_id: Some("m-1".to_string()),
        tool_id: None,
        documentation_id: None,
        quantity: Some(5.0),
        unit: Some("kg".to_string()),
        is_optional: false,
    });
    a.is_outcome = true;
    wf.steps = vec![a];
    repo.save_workflow(&wf).unwrap();

    let oracle: Arc<dyn InventoryOracle> = Arc::new(StubOracle { on_hand: 2.0 });
    let eng = engine(&repo, &config, oracle);

    let result = eng.start("wf-resource", "user-1", None);
    assert!(matches!(result, Err(CoreError::Unreserved(_))), "{:?}", result);

    let active = repo.list_active_executions(&ExecutionFilter::default()).unwrap();
    assert!(active.is_empty(), "strict-policy rejection must not persist an Execution row");
}

/// Scenario 5: export then import round-trips a 6-step/7-connection/
/// 2-outcome/3-resource workflow under a fresh id space.
#[test]
fn scenario_5_export_import_round_trips_structure() {
    let (repo, _dir) = repo_in_temp_dir();

    let mut wf = Workflow::new("wf-source", "Exportable", "user-1");
    wf.has_multiple_outcomes = true;
    let mut steps: Vec<Step> = (1..=6)
        .map(|i| Step::new(format!("s{}", i), "wf-source", format!("Step {}", i), i))
        .collect();
    steps[5].is_outcome = true;
    steps[4].is_outcome = true;

    steps[0].resources.push(StepResource {
        id: "r1".to_string(),
        step_id: "s1".to_string(),
        resource_kind: ResourceKind::Material,
        material_id: Some("m-1".to_string()),
        tool_id: None,
        documentation_id: None,
        quantity: Some(2.0),
        unit: Some("kg".to_string()),
        is_optional: false,
    });
    steps[1].resources.push(StepResource {
        id: "r2".to_string(),
        step_id: "s2".to_string(),
        resource_kind: ResourceKind::Tool,
        material_id: None,
        tool_id: Some("t-1".to_string()),
        documentation_id: None,
        quantity: None,
        unit: None,
        is_optional: false,
    });
    steps[2].resources.push(StepResource {
        id: "r3".to_string(),
        step_id: "s3".to_string(),
        resource_kind: ResourceKind::Documentation,
        material_id: None,
        tool_id: None,
        documentation_id: Some("doc-1".to_string()),
        quantity: None,
        unit: None,
        is_optional: true,
    });

    let connections = [
        ("c1", "s1", "s2", 1),
        ("c2", "s1", "s3", 2),
        ("c3", "s2", "s4", 1),
        ("c4", "s3", "s4", 2),
        ("c5", "s4", "s5", 1),
        ("c6", "s4", "s6", 2),
        ("c7", "s2", "s6", 3),
    ];
    for (id, source, target, order) in connections {
        let source_idx = source.strip_prefix('s').unwrap().parse::<usize>().unwrap() - 1;
        steps[source_idx]
            .outgoing_connections
            .push(Connection::new(id, source, target, ConnectionType::Sequential, order).unwrap());
    }
    wf.steps = steps;
    wf.outcomes = vec![
        Outcome {
            id: "o1".to_string(),
            workflow_id: "wf-source".to_string(),
            name: "Success".to_string(),
            display_order: 1,
            is_default: true,
            success_criteria: None,
        },
        Outcome {
            id: "o2".to_string(),
            workflow_id: "wf-source".to_string(),
            name: "Alternate".to_string(),
            display_order: 2,
            is_default: false,
            success_criteria: None,
        },
    ];

    let envelope = export_workflow(&wf);
    assert_eq!(envelope.workflow.steps.len(), 6);
    assert_eq!(envelope.workflow.connections.len(), 7);
    assert_eq!(envelope.workflow.outcomes.len(), 2);

    let oracle = StubOracle { on_hand: 1000.0 };
    let report = import_workflow(&envelope, "user-2", &oracle).unwrap();
    assert_ne!(report.workflow.id, wf.id);
    assert_eq!(report.workflow.steps.len(), 6);
    let imported_connections: usize = report.workflow.steps.iter().map(|s| s.outgoing_connections.len()).sum();
    assert_eq!(imported_connections, 7);
    assert_eq!(report.workflow.outcomes.len(), 2);

    repo.save_workflow(&report.workflow).unwrap();
    let validation = validate(&report.workflow);
    assert!(validation.errors.is_empty() && validation.publication_errors.is_empty(), "{:?}", validation);
}

/// Scenario 6: two concurrent CompleteStep calls on the same (execution,
/// step) resolve to exactly one success and one Conflict/InvalidStateTransition,
/// and exactly one `completed` NavigationEvent is appended.
#[test]
fn scenario_6_concurrent_completion_resolves_to_a_single_winner() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("workflow_engine.db");
    let config = Arc::new(CoreConfig::default());
    let repo = Arc::new(SqliteRepository::new(&path, &config.database).unwrap());

    let mut wf = Workflow::new("wf-race", "Race", "user-1");
    wf.status = WorkflowStatus::Active;
    let mut a = Step::new("a", "wf-race", "A", 1);
    let mut b = Step::new("b", "wf-race", "B", 2);
    b.is_outcome = true;
    a.outgoing_connections.push(Connection::new("c1", "a", "b", ConnectionType::Sequential, 1).unwrap());
    wf.steps = vec![a, b];
    repo.save_workflow(&wf).unwrap();

    let execution_id = {
        let eng = Engine::new(repo.as_ref(), &config, unlimited_oracle(), None);
        eng.start("wf-race", "user-1", None).unwrap().id
    };

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let repo = Arc::clone(&repo);
            let config = Arc::clone(&config);
            std::thread::spawn(move || {
                let eng = Engine::new(repo.as_ref(), &config, unlimited_oracle(), None);
                eng.complete_step(execution_id, "a", CompleteStepInput::default())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let acceptable_failures = results
        .iter()
        .filter(|r| matches!(r, Err(CoreError::Conflict(_)) | Err(CoreError::InvalidStateTransition(_))))
        .count();

    assert_eq!(successes, 1, "{:?}", results);
    assert_eq!(acceptable_failures, 1, "{:?}", results);

    let (_, _, events) = repo.load_execution(execution_id).unwrap().unwrap();
    let completed_count = events.iter().filter(|e| e.action_type.as_str() == "completed").count();
    assert_eq!(completed_count, 1, "{:?}", events.iter().map(|e| e.action_type.as_str()).collect::<Vec<_>>());
}
