//! Public API surface (§6): the principal-aware facade a caller (an HTTP
//! layer, a CLI, a test harness) actually calls. Wraps the Repository (C2),
//! Engine (C5), Navigator (C6) and Codec (C8) with authorization and the
//! workflow-definition CRUD/lifecycle operations that sit above them,
//! following the teacher's `StateManager` pattern of a thin struct holding
//! the backing store and exposing one method per caller-visible operation.

use crate::codec::{export_workflow, import_workflow, ImportReport, WorkflowExportEnvelope};
use crate::error::{CoreError, CoreResult};
use crate::graph::{validate, ValidationReport};
use crate::models::{Outcome, Step, Visibility, Workflow, WorkflowStatus};
use crate::navigator::{guidance, next_step_selection, Guidance};
use crate::repository::{Page, Repository, WorkflowFilter};
use crate::resources::InventoryOracle;
use chrono::Utc;
use uuid::Uuid;

/// Coarse role distinction from §6 "Permissions": a principal is either an
/// ordinary user, scoped to workflows they created or that are shared with
/// them, or a superuser with unrestricted access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Superuser,
}

/// The caller identity threaded into every facade operation. The core never
/// authenticates this itself — it is handed a principal by the external
/// layer that owns authentication (§1 "Out of scope").
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

impl Principal {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), role: Role::User }
    }

    pub fn superuser(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), role: Role::Superuser }
    }

    fn is_superuser(&self) -> bool {
        self.role == Role::Superuser
    }

    fn can_read(&self, workflow: &Workflow) -> bool {
        self.is_superuser()
            || workflow.created_by == self.user_id
            || matches!(workflow.visibility, Visibility::Public | Visibility::System)
    }

    fn can_write(&self, workflow: &Workflow) -> bool {
        self.is_superuser() || workflow.created_by == self.user_id
    }
}

fn denied(action: &str, id: &str) -> CoreError {
    CoreError::BusinessRule(format!("permission denied: cannot {} workflow '{}'", action, id))
}

fn require_superuser(principal: &Principal, action: &str) -> CoreResult<()> {
    if !principal.is_superuser() {
        return Err(CoreError::BusinessRule(format!(
            "permission denied: {} requires a superuser principal",
            action
        )));
    }
    Ok(())
}

/// A patch applied by `UpdateWorkflow`; every field left `None` is
/// untouched. Steps/Outcomes/Connections are replaced wholesale when given,
/// matching `Repository::SaveWorkflow`'s cascade-delete-then-reinsert
/// semantics (§4.2).
#[derive(Debug, Clone, Default)]
pub struct WorkflowPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub estimated_duration: Option<Option<i64>>,
    pub difficulty_level: Option<Option<String>>,
    pub project_id: Option<Option<String>>,
    pub theme_id: Option<Option<String>>,
    pub has_multiple_outcomes: Option<bool>,
    pub steps: Option<Vec<Step>>,
    pub outcomes: Option<Vec<Outcome>>,
}

/// An aggregate read-only projection combining current-step info, available
/// navigation options, progress, recent history and guidance (§4.6
/// "Navigation context"). `GetNavigationContext` returns this.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NavigationContext {
    pub current_step_id: Option<String>,
    pub next_available_step_ids: Vec<String>,
    pub progress: crate::engine::ProgressSummary,
    pub recent_events: Vec<crate::models::NavigationEvent>,
    pub guidance: Guidance,
}

/// Facade over a `Repository` implementing the principal-checked public API
/// surface of §6. Read-only operations (`SearchWorkflows`, navigation
/// projections) are exposed directly here; execution-lifecycle operations
/// stay on `Engine` and are not duplicated — callers hold both.
pub struct WorkflowApi<'a, R: Repository> {
    repo: &'a R,
    oracle: std::sync::Arc<dyn InventoryOracle>,
}

impl<'a, R: Repository> WorkflowApi<'a, R> {
    pub fn new(repo: &'a R, oracle: std::sync::Arc<dyn InventoryOracle>) -> Self {
        Self { repo, oracle }
    }

    fn load_for_read(&self, id: &str, principal: &Principal) -> CoreResult<Workflow> {
        let workflow = self
            .repo
            .load_workflow(id, &crate::repository::LoadOptions { eager_children: true })?
            .ok_or_else(|| CoreError::NotFound(format!("workflow '{}'", id)))?;
        if !principal.can_read(&workflow) {
            return Err(denied("read", id));
        }
        Ok(workflow)
    }

    fn load_for_write(&self, id: &str, principal: &Principal) -> CoreResult<Workflow> {
        let workflow = self
            .repo
            .load_workflow(id, &crate::repository::LoadOptions { eager_children: true })?
            .ok_or_else(|| CoreError::NotFound(format!("workflow '{}'", id)))?;
        if !principal.can_write(&workflow) {
            return Err(denied("modify", id));
        }
        Ok(workflow)
    }

    /// `CreateWorkflow(def, userId)` — validates local invariants and
    /// persists a new draft owned by the principal.
    pub fn create_workflow(&self, mut def: Workflow, principal: &Principal) -> CoreResult<Workflow> {
        def.id = Uuid::new_v4().to_string();
        def.created_by = principal.user_id.clone();
        def.status = WorkflowStatus::Draft;
        def.created_at = Utc::now();
        def.updated_at = def.created_at;
        def.version = 1;

        let issues = def.validate_local();
        if !issues.is_empty() {
            return Err(CoreError::validation(issues));
        }
        self.repo.save_workflow(&def)?;
        Ok(def)
    }

    /// `UpdateWorkflow(id, patch, userId)` — authorization, then merges the
    /// patch, re-validates, and persists.
    pub fn update_workflow(&self, id: &str, patch: WorkflowPatch, principal: &Principal) -> CoreResult<Workflow> {
        let mut workflow = self.load_for_write(id, principal)?;

        if let Some(name) = patch.name {
            workflow.name = name;
        }
        if let Some(description) = patch.description {
            workflow.description = Some(description);
        }
        if let Some(v) = patch.estimated_duration {
            workflow.estimated_duration = v;
        }
        if let Some(v) = patch.difficulty_level {
            workflow.difficulty_level = v;
        }
        if let Some(v) = patch.project_id {
            workflow.project_id = v;
        }
        if let Some(v) = patch.theme_id {
            workflow.theme_id = v;
        }
        if let Some(v) = patch.has_multiple_outcomes {
            workflow.has_multiple_outcomes = v;
        }
        if let Some(steps) = patch.steps {
            workflow.steps = steps;
        }
        if let Some(outcomes) = patch.outcomes {
            workflow.outcomes = outcomes;
        }
        workflow.updated_at = Utc::now();
        workflow.version += 1;

        let issues = workflow.validate_local();
        if !issues.is_empty() {
            return Err(CoreError::validation(issues));
        }
        self.repo.save_workflow(&workflow)?;
        Ok(workflow)
    }

    /// `PublishTemplate(id, visibility, userId)` — checks I3/I4 via
    /// `graph::validate` and flips `isTemplate`/`status`.
    pub fn publish_template(&self, id: &str, visibility: Visibility, principal: &Principal) -> CoreResult<Workflow> {
        let mut workflow = self.load_for_write(id, principal)?;
        let report: ValidationReport = validate(&workflow);
        if !report.is_publication_ready() {
            return Err(CoreError::validation(
                report.errors.into_iter().chain(report.publication_errors).collect(),
            ));
        }
        workflow.is_template = true;
        workflow.status = WorkflowStatus::Published;
        workflow.visibility = visibility;
        workflow.updated_at = Utc::now();
        workflow.version += 1;
        self.repo.save_workflow(&workflow)?;
        Ok(workflow)
    }

    /// `DuplicateWorkflow(id, newName, userId, asTemplate)` — deep-copies
    /// Steps (with their Resources/DecisionOptions/outgoing Connections) and
    /// Outcomes under a fresh id space (R4).
    pub fn duplicate_workflow(
        &self,
        id: &str,
        new_name: &str,
        principal: &Principal,
        as_template: bool,
    ) -> CoreResult<Workflow> {
        let source = self.load_for_read(id, principal)?;

        let new_id = Uuid::new_v4().to_string();
        let mut step_id_map = std::collections::HashMap::new();
        for step in &source.steps {
            step_id_map.insert(step.id.clone(), Uuid::new_v4().to_string());
        }

        let mut copy = Workflow::new(&new_id, new_name, &principal.user_id);
        copy.description = source.description.clone();
        copy.is_template = as_template;
        copy.visibility = source.visibility;
        copy.has_multiple_outcomes = source.has_multiple_outcomes;
        copy.estimated_duration = source.estimated_duration;
        copy.difficulty_level = source.difficulty_level.clone();
        copy.project_id = source.project_id.clone();
        copy.theme_id = source.theme_id.clone();

        copy.outcomes = source
            .outcomes
            .iter()
            .map(|o| Outcome {
                id: Uuid::new_v4().to_string(),
                workflow_id: new_id.clone(),
                name: o.name.clone(),
                display_order: o.display_order,
                is_default: o.is_default,
                success_criteria: o.success_criteria.clone(),
            })
            .collect();

        copy.steps = source
            .steps
            .iter()
            .map(|step| {
                let new_step_id = step_id_map[&step.id].clone();
                let mut new_step = Step::new(&new_step_id, &new_id, &step.name, step.display_order);
                new_step.instructions = step.instructions.clone();
                new_step.step_type = step.step_type;
                new_step.estimated_duration = step.estimated_duration;
                new_step.parent_step_id = step.parent_step_id.as_ref().and_then(|p| step_id_map.get(p)).cloned();
                new_step.is_milestone = step.is_milestone;
                new_step.is_decision_point = step.is_decision_point;
                new_step.is_outcome = step.is_outcome;
                new_step.condition_logic = step.condition_logic.clone();
                new_step.resources = step
                    .resources
                    .iter()
                    .map(|r| crate::models::StepResource {
                        id: Uuid::new_v4().to_string(),
                        step_id: new_step_id.clone(),
                        resource_kind: r.resource_kind,
                        material_id: r.material_id.clone(),
                        tool_id: r.tool_id.clone(),
                        documentation_id: r.documentation_id.clone(),
                        quantity: r.quantity,
                        unit: r.unit.clone(),
                        is_optional: r.is_optional,
                    })
                    .collect();
                new_step.decision_options = step
                    .decision_options
                    .iter()
                    .map(|o| crate::models::DecisionOption {
                        id: Uuid::new_v4().to_string(),
                        step_id: new_step_id.clone(),
                        option_text: o.option_text.clone(),
                        result_action: o.result_action.clone(),
                        display_order: o.display_order,
                        is_default: o.is_default,
                    })
                    .collect();
                new_step.outgoing_connections = step
                    .outgoing_connections
                    .iter()
                    .filter_map(|c| {
                        let target = step_id_map.get(&c.target_step_id)?;
                        Some(crate::models::Connection {
                            id: Uuid::new_v4().to_string(),
                            source_step_id: new_step_id.clone(),
                            target_step_id: target.clone(),
                            connection_type: c.connection_type,
                            condition: c.condition.clone(),
                            display_order: c.display_order,
                            is_default: c.is_default,
                        })
                    })
                    .collect();
                new_step
            })
            .collect();

        self.repo.save_workflow(&copy)?;
        Ok(copy)
    }

    /// `SearchWorkflows(filter, page)` — paginated query, scoped to what
    /// the principal may read. Non-superusers only ever see their own or
    /// publicly/system-visible workflows; the filter's `created_by` is
    /// ignored for non-superusers in favor of the principal's own id unless
    /// they are searching shared/public workflows explicitly via visibility.
    pub fn search_workflows(
        &self,
        filter: WorkflowFilter,
        page: Page,
        principal: &Principal,
    ) -> CoreResult<(Vec<Workflow>, usize)> {
        let (items, total) = self.repo.search_workflows(&filter, page)?;
        if principal.is_superuser() {
            return Ok((items, total));
        }
        // Non-superuser visibility is filtered after the page is fetched, so
        // `total` (the unfiltered count) is no longer accurate; report the
        // visible count instead rather than leaking how many hidden rows exist.
        let visible: Vec<Workflow> = items.into_iter().filter(|w| principal.can_read(w)).collect();
        let visible_total = visible.len();
        Ok((visible, visible_total))
    }

    /// `DeleteWorkflow(id, userId)` — refuses while non-terminal Executions
    /// reference it (B1); the repository enforces this, the facade adds the
    /// authorization check above it.
    pub fn delete_workflow(&self, id: &str, principal: &Principal) -> CoreResult<()> {
        let workflow = self.load_for_write(id, principal)?;
        self.repo.delete_workflow(&workflow.id)
    }

    /// `ExportWorkflow(id) -> envelope` — raw envelope export requires
    /// superuser (§6 "Permissions").
    pub fn export_workflow(&self, id: &str, principal: &Principal) -> CoreResult<WorkflowExportEnvelope> {
        require_superuser(principal, "ExportWorkflow")?;
        let workflow = self
            .repo
            .load_workflow(id, &crate::repository::LoadOptions { eager_children: true })?
            .ok_or_else(|| CoreError::NotFound(format!("workflow '{}'", id)))?;
        Ok(export_workflow(&workflow))
    }

    /// `ImportWorkflow(envelope, userId) -> id` — raw envelope import
    /// requires superuser (§6 "Permissions"); persists the imported
    /// Workflow in one transaction (via `Repository::save_workflow`).
    pub fn import_workflow(&self, envelope: &WorkflowExportEnvelope, principal: &Principal) -> CoreResult<ImportReport> {
        require_superuser(principal, "ImportWorkflow")?;
        let report = import_workflow(envelope, &principal.user_id, self.oracle.as_ref())?;
        self.repo.save_workflow(&report.workflow)?;
        Ok(report)
    }

    /// `GetNextAvailableSteps` — the navigator's `NextStepSelection` without
    /// persisting anything, for UI preview.
    pub fn get_next_available_steps(&self, execution_id: Uuid) -> CoreResult<Vec<String>> {
        let (execution, step_executions, _events) = self
            .repo
            .load_execution(execution_id)?
            .ok_or_else(|| CoreError::NotFound(format!("execution '{}'", execution_id)))?;
        let workflow = self
            .repo
            .load_workflow(&execution.workflow_id, &crate::repository::LoadOptions::default())?
            .ok_or_else(|| CoreError::NotFound(format!("workflow '{}'", execution.workflow_id)))?;
        let current_step_id = match &execution.current_step_id {
            Some(id) => id.clone(),
            None => return Ok(Vec::new()),
        };
        let last = step_executions
            .iter()
            .find(|se| se.step_id == current_step_id)
            .map(|se| se.step_data.clone())
            .unwrap_or_default();
        let selection = next_step_selection(&workflow, &current_step_id, &execution.execution_data, &last);
        Ok(selection.steps.into_iter().map(|s| s.step_id).collect())
    }

    /// `GetNavigationContext` — the aggregate read-only projection of
    /// §4.6: current step, available next steps, progress, recent history
    /// and guidance, assembled without mutating any state.
    pub fn get_navigation_context(&self, execution_id: Uuid, engine: &crate::engine::Engine<'_, R>) -> CoreResult<NavigationContext> {
        let (execution, step_executions, events) = self
            .repo
            .load_execution(execution_id)?
            .ok_or_else(|| CoreError::NotFound(format!("execution '{}'", execution_id)))?;
        let workflow = self
            .repo
            .load_workflow(&execution.workflow_id, &crate::repository::LoadOptions::default())?
            .ok_or_else(|| CoreError::NotFound(format!("workflow '{}'", execution.workflow_id)))?;

        let next_available_step_ids = self.get_next_available_steps(execution_id)?;
        let progress = engine.progress(execution_id)?;
        let is_complete = execution.status == crate::models::ExecutionStatus::Completed;
        let guidance_result = guidance(&workflow, &execution, &step_executions, is_complete);

        let mut recent_events = events;
        recent_events.sort_by_key(|e| e.timestamp);
        if recent_events.len() > 20 {
            let start = recent_events.len() - 20;
            recent_events = recent_events.split_off(start);
        }

        Ok(NavigationContext {
            current_step_id: execution.current_step_id.clone(),
            next_available_step_ids,
            progress,
            recent_events,
            guidance: guidance_result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Connection, ConnectionType};
    use crate::repository::SqliteRepository;

    struct NullOracle;
    impl InventoryOracle for NullOracle {
        fn check_material(&self, _id: &str, _qty: f64) -> CoreResult<(bool, f64)> {
            Ok((true, 1000.0))
        }
        fn reserve_material(&self, id: &str, _qty: f64) -> CoreResult<String> {
            Ok(format!("tok-{}", id))
        }
        fn release_material(&self, _token: &str) -> CoreResult<()> {
            Ok(())
        }
        fn check_tool(&self, _id: &str, _duration_minutes: i64) -> CoreResult<(bool, f64)> {
            Ok((true, 1.0))
        }
        fn reserve_tool(&self, id: &str, _duration_minutes: i64) -> CoreResult<String> {
            Ok(format!("tool-{}", id))
        }
        fn release_tool(&self, _token: &str) -> CoreResult<()> {
            Ok(())
        }
        fn find_material(&self, _name: &str) -> CoreResult<Option<String>> {
            Ok(None)
        }
        fn find_tool(&self, _name: &str) -> CoreResult<Option<String>> {
            Ok(None)
        }
    }

    fn api(repo: &SqliteRepository) -> WorkflowApi<'_, SqliteRepository> {
        WorkflowApi::new(repo, std::sync::Arc::new(NullOracle))
    }

    #[test]
    fn create_workflow_persists_a_draft_owned_by_the_caller() {
        let repo = SqliteRepository::in_memory().unwrap();
        let facade = api(&repo);
        let principal = Principal::user("alice");

        let def = Workflow::new("ignored", "Onboarding", "ignored");
        let created = facade.create_workflow(def, &principal).unwrap();

        assert_eq!(created.created_by, "alice");
        assert_eq!(created.status, WorkflowStatus::Draft);
        assert!(repo.load_workflow(&created.id, &crate::repository::LoadOptions::default()).unwrap().is_some());
    }

    #[test]
    fn update_workflow_is_rejected_for_a_non_owning_user() {
        let repo = SqliteRepository::in_memory().unwrap();
        let facade = api(&repo);
        let owner = Principal::user("alice");
        let intruder = Principal::user("mallory");

        let created = facade.create_workflow(Workflow::new("x", "Onboarding", "x"), &owner).unwrap();
        let result = facade.update_workflow(
            &created.id,
            WorkflowPatch { name: Some("Hijacked".to_string()), ..Default::default() },
            &intruder,
        );
        assert!(matches!(result, Err(CoreError::BusinessRule(_))));
    }

    #[test]
    fn publish_template_rejects_a_workflow_with_a_cycle() {
        let repo = SqliteRepository::in_memory().unwrap();
        let facade = api(&repo);
        let principal = Principal::user("alice");

        let mut def = Workflow::new("x", "Cyclic", "x");
        let mut a = Step::new("a", "x", "A", 1);
        let mut b = Step::new("b", "x", "B", 2);
        a.outgoing_connections.push(Connection::new("c1", "a", "b", ConnectionType::Sequential, 1).unwrap());
        b.outgoing_connections.push(Connection::new("c2", "b", "a", ConnectionType::Sequential, 1).unwrap());
        def.steps = vec![a, b];
        let created = facade.create_workflow(def, &principal).unwrap();

        let result = facade.publish_template(&created.id, Visibility::Public, &principal);
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[test]
    fn duplicate_workflow_produces_a_new_id_space_with_identical_structure() {
        let repo = SqliteRepository::in_memory().unwrap();
        let facade = api(&repo);
        let principal = Principal::user("alice");

        let mut def = Workflow::new("x", "Linear", "x");
        let mut a = Step::new("a", "x", "A", 1);
        let mut b = Step::new("b", "x", "B", 2);
        b.is_outcome = true;
        a.outgoing_connections.push(Connection::new("c1", "a", "b", ConnectionType::Sequential, 1).unwrap());
        def.steps = vec![a, b];
        let created = facade.create_workflow(def, &principal).unwrap();

        let duplicate = facade.duplicate_workflow(&created.id, "Linear copy", &principal, false).unwrap();

        assert_ne!(duplicate.id, created.id);
        assert_eq!(duplicate.steps.len(), created.steps.len());
        assert_eq!(duplicate.steps[0].outgoing_connections.len(), 1);
        assert_ne!(duplicate.steps[0].id, created.steps[0].id);
    }

    #[test]
    fn export_and_import_require_a_superuser_principal() {
        let repo = SqliteRepository::in_memory().unwrap();
        let facade = api(&repo);
        let owner = Principal::user("alice");

        let created = facade.create_workflow(Workflow::new("x", "Onboarding", "x"), &owner).unwrap();
        let result = facade.export_workflow(&created.id, &owner);
        assert!(matches!(result, Err(CoreError::BusinessRule(_))));

        let admin = Principal::superuser("root");
        let envelope = facade.export_workflow(&created.id, &admin).unwrap();
        let imported = facade.import_workflow(&envelope, &admin).unwrap();
        assert_eq!(imported.workflow.name, "Onboarding");
    }

    #[test]
    fn search_workflows_hides_private_workflows_from_other_users() {
        let repo = SqliteRepository::in_memory().unwrap();
        let facade = api(&repo);
        let owner = Principal::user("alice");
        let other = Principal::user("mallory");

        facade.create_workflow(Workflow::new("x", "Private plan", "x"), &owner).unwrap();

        let (visible_to_owner, _) = facade
            .search_workflows(WorkflowFilter::default(), Page { offset: 0, limit: 10 }, &owner)
            .unwrap();
        let (visible_to_other, _) = facade
            .search_workflows(WorkflowFilter::default(), Page { offset: 0, limit: 10 }, &other)
            .unwrap();

        assert_eq!(visible_to_owner.len(), 1);
        assert_eq!(visible_to_other.len(), 0);
    }
}
