//! The workflow graph data model: Workflow, Step, Connection, DecisionOption,
//! StepResource, Outcome, Execution, StepExecution, NavigationEvent.
//!
//! Each constructor enforces local invariants; cross-entity invariants
//! (reachability, cycles) live in `graph` and `algorithms`.

use crate::error::{CoreError, CoreResult, ValidationIssue};
use crate::value::ValueMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Published,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Published => "published",
            WorkflowStatus::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Public,
    Shared,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Instruction,
    Material,
    Tool,
    Time,
    Decision,
    Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Sequential,
    Conditional,
    Decision,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Material,
    Tool,
    Documentation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Cancelled | ExecutionStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Active => "active",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Ready,
    Active,
    Completed,
    Skipped,
    Failed,
}

impl StepExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepExecutionStatus::Ready => "ready",
            StepExecutionStatus::Active => "active",
            StepExecutionStatus::Completed => "completed",
            StepExecutionStatus::Skipped => "skipped",
            StepExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepExecutionStatus::Completed
                | StepExecutionStatus::Skipped
                | StepExecutionStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationActionType {
    NavigateTo,
    Started,
    Completed,
    DecisionMade,
    Paused,
    Resumed,
    Cancelled,
    Skipped,
    WorkflowCompleted,
    Failed,
}

impl NavigationActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NavigationActionType::NavigateTo => "navigate_to",
            NavigationActionType::Started => "started",
            NavigationActionType::Completed => "completed",
            NavigationActionType::DecisionMade => "decision_made",
            NavigationActionType::Paused => "paused",
            NavigationActionType::Resumed => "resumed",
            NavigationActionType::Cancelled => "cancelled",
            NavigationActionType::Skipped => "skipped",
            NavigationActionType::WorkflowCompleted => "workflow_completed",
            NavigationActionType::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: WorkflowStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_template: bool,
    pub visibility: Visibility,
    pub version: i64,
    pub has_multiple_outcomes: bool,
    pub estimated_duration: Option<i64>,
    pub difficulty_level: Option<String>,
    pub project_id: Option<String>,
    pub theme_id: Option<String>,
    pub steps: Vec<Step>,
    pub outcomes: Vec<Outcome>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            status: WorkflowStatus::Draft,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            is_template: false,
            visibility: Visibility::Private,
            version: 1,
            has_multiple_outcomes: false,
            estimated_duration: None,
            difficulty_level: None,
            project_id: None,
            theme_id: None,
            steps: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    /// Local structural validation only (I1, I2, and field-level checks).
    /// Publication-readiness checks (I3, I4) live in `graph::validate`
    /// because they require the full reachability/cycle analysis of C3.
    pub fn validate_local(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if self.id.trim().is_empty() {
            issues.push(ValidationIssue::new("id", "workflow id must not be empty"));
        }
        if self.name.trim().is_empty() {
            issues.push(ValidationIssue::new("name", "workflow name must not be empty"));
        }

        let mut seen_outcome_names = std::collections::HashSet::new();
        for outcome in &self.outcomes {
            if outcome.workflow_id != self.id {
                issues.push(ValidationIssue::new(
                    format!("outcomes[{}].workflowId", outcome.id),
                    "outcome does not belong to this workflow",
                ));
            }
            if !seen_outcome_names.insert(outcome.name.clone()) {
                issues.push(ValidationIssue::new(
                    "outcomes",
                    format!("duplicate outcome name '{}'", outcome.name),
                ));
            }
        }

        let step_ids: std::collections::HashSet<&str> =
            self.steps.iter().map(|s| s.id.as_str()).collect();

        for step in &self.steps {
            issues.extend(step.validate_local(&self.id));
            for conn in &step.outgoing_connections {
                if conn.source_step_id != step.id {
                    issues.push(ValidationIssue::new(
                        format!("connections[{}]", conn.id),
                        "connection sourceStepId does not match owning step",
                    ));
                }
                if conn.source_step_id == conn.target_step_id {
                    issues.push(ValidationIssue::new(
                        format!("connections[{}]", conn.id),
                        "connection is a self-loop",
                    ));
                }
                if !step_ids.contains(conn.target_step_id.as_str()) {
                    issues.push(ValidationIssue::new(
                        format!("connections[{}]", conn.id),
                        "connection target does not belong to this workflow",
                    ));
                }
            }
        }
        // More than one default connection from a step is flagged by
        // `graph::validate`'s warnings (non-blocking), not here — it doesn't
        // stop a workflow from being created or published.
        issues
    }

    pub fn get_step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub workflow_id: String,
    pub name: String,
    pub instructions: Option<String>,
    pub display_order: i64,
    pub step_type: StepType,
    pub estimated_duration: Option<i64>,
    pub parent_step_id: Option<String>,
    pub is_milestone: bool,
    pub is_decision_point: bool,
    pub is_outcome: bool,
    pub condition_logic: Option<String>,
    pub resources: Vec<StepResource>,
    pub decision_options: Vec<DecisionOption>,
    pub outgoing_connections: Vec<Connection>,
}

impl Step {
    pub fn new(id: impl Into<String>, workflow_id: impl Into<String>, name: impl Into<String>, display_order: i64) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            name: name.into(),
            instructions: None,
            display_order,
            step_type: StepType::Instruction,
            estimated_duration: None,
            parent_step_id: None,
            is_milestone: false,
            is_decision_point: false,
            is_outcome: false,
            condition_logic: None,
            resources: Vec::new(),
            decision_options: Vec::new(),
            outgoing_connections: Vec::new(),
        }
    }

    pub fn validate_local(&self, owning_workflow_id: &str) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if self.id.trim().is_empty() {
            issues.push(ValidationIssue::new("id", "step id must not be empty"));
        }
        if self.name.trim().is_empty() {
            issues.push(ValidationIssue::new(
                format!("steps[{}].name", self.id),
                "step name must not be empty",
            ));
        }
        if self.display_order <= 0 {
            issues.push(ValidationIssue::new(
                format!("steps[{}].displayOrder", self.id),
                "displayOrder must be a positive integer",
            ));
        }
        if self.workflow_id != owning_workflow_id {
            issues.push(ValidationIssue::new(
                format!("steps[{}].workflowId", self.id),
                "step does not belong to the owning workflow",
            ));
        }
        if self.parent_step_id.as_deref() == Some(self.id.as_str()) {
            issues.push(ValidationIssue::new(
                format!("steps[{}].parentStepId", self.id),
                "step cannot be its own parent",
            ));
        }
        if !self.is_decision_point && !self.decision_options.is_empty() {
            issues.push(ValidationIssue::new(
                format!("steps[{}].decisionOptions", self.id),
                "decision options present on a step that is not a decision point",
            ));
        }
        let default_options = self.decision_options.iter().filter(|o| o.is_default).count();
        if default_options > 1 {
            issues.push(ValidationIssue::new(
                format!("steps[{}].decisionOptions", self.id),
                "more than one default decision option",
            ));
        }
        for resource in &self.resources {
            issues.extend(resource.validate_local(&self.id));
        }
        issues
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source_step_id: String,
    pub target_step_id: String,
    pub connection_type: ConnectionType,
    pub condition: Option<String>,
    pub display_order: i64,
    pub is_default: bool,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        source_step_id: impl Into<String>,
        target_step_id: impl Into<String>,
        connection_type: ConnectionType,
        display_order: i64,
    ) -> CoreResult<Self> {
        let source_step_id = source_step_id.into();
        let target_step_id = target_step_id.into();
        if source_step_id == target_step_id {
            return Err(CoreError::validation_one(
                "targetStepId",
                "connection source and target must differ (I2)",
            ));
        }
        Ok(Self {
            id: id.into(),
            source_step_id,
            target_step_id,
            connection_type,
            condition: None,
            display_order,
            is_default: false,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    pub step_id: String,
    pub option_text: String,
    pub result_action: Option<String>,
    pub display_order: i64,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResource {
    pub id: String,
    pub step_id: String,
    pub resource_kind: ResourceKind,
    pub material_id: Option<String>,
    pub tool_id: Option<String>,
    pub documentation_id: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub is_optional: bool,
}

impl StepResource {
    pub fn validate_local(&self, owning_step_id: &str) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if self.step_id != owning_step_id {
            issues.push(ValidationIssue::new(
                format!("resources[{}].stepId", self.id),
                "resource does not belong to the owning step",
            ));
        }
        let set_count = [
            self.material_id.is_some(),
            self.tool_id.is_some(),
            self.documentation_id.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if set_count != 1 {
            issues.push(ValidationIssue::new(
                format!("resources[{}]", self.id),
                "exactly one of materialId/toolId/documentationId must be set",
            ));
        }
        let matches_kind = match self.resource_kind {
            ResourceKind::Material => self.material_id.is_some(),
            ResourceKind::Tool => self.tool_id.is_some(),
            ResourceKind::Documentation => self.documentation_id.is_some(),
        };
        if !matches_kind {
            issues.push(ValidationIssue::new(
                format!("resources[{}].resourceKind", self.id),
                "resourceKind does not match the populated identifier field",
            ));
        }
        if self.resource_kind == ResourceKind::Material {
            if let Some(qty) = self.quantity {
                if qty < 0.0 {
                    issues.push(ValidationIssue::new(
                        format!("resources[{}].quantity", self.id),
                        "material quantity must be non-negative",
                    ));
                }
            }
        }
        issues
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub id: String,
    pub workflow_id: String,
    pub name: String,
    pub display_order: i64,
    pub is_default: bool,
    pub success_criteria: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: String,
    pub started_by: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub selected_outcome_id: Option<String>,
    pub current_step_id: Option<String>,
    pub execution_data: ValueMap,
    pub total_duration_minutes: Option<i64>,
    pub version: i64,
}

impl Execution {
    pub fn new(workflow_id: impl Into<String>, started_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            started_by: started_by.into(),
            status: ExecutionStatus::Active,
            started_at: Utc::now(),
            completed_at: None,
            selected_outcome_id: None,
            current_step_id: None,
            execution_data: ValueMap::new(),
            total_duration_minutes: None,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub status: StepExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub actual_duration_minutes: Option<i64>,
    pub step_data: ValueMap,
}

impl StepExecution {
    pub fn new_ready(execution_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            step_id: step_id.into(),
            status: StepExecutionStatus::Ready,
            started_at: None,
            completed_at: None,
            actual_duration_minutes: None,
            step_data: ValueMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationEvent {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: Option<String>,
    pub action_type: NavigationActionType,
    pub action_data: ValueMap,
    pub timestamp: DateTime<Utc>,
}

impl NavigationEvent {
    pub fn new(
        execution_id: Uuid,
        step_id: Option<String>,
        action_type: NavigationActionType,
        action_data: ValueMap,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            step_id,
            action_type,
            action_data,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_rejects_self_loop() {
        let result = Connection::new("c1", "s1", "s1", ConnectionType::Sequential, 1);
        assert!(result.is_err(), "self-loop connection should be rejected at construction");
    }

    #[test]
    fn workflow_validate_local_flags_empty_name() {
        let workflow = Workflow::new("", "", "user-1");
        let issues = workflow.validate_local();
        assert!(!issues.is_empty(), "empty id/name should produce validation issues");
    }

    #[test]
    fn step_resource_requires_exactly_one_identifier() {
        let resource = StepResource {
            id: "r1".to_string(),
            step_id: "s1".to_string(),
            resource_kind: ResourceKind::Material,
            material_id: None,
            tool_id: None,
            documentation_id: None,
            quantity: Some(1.0),
            unit: None,
            is_optional: false,
        };
        let issues = resource.validate_local("s1");
        assert!(!issues.is_empty(), "resource with no identifier set should fail validation");
    }

    #[test]
    fn execution_status_terminal_classification() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Active.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
    }
}
