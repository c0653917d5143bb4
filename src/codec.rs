//! C8: the portable JSON envelope used to export a Workflow graph and
//! import it back, possibly into a different account or after resolving
//! material/tool names against a different inventory (§4.8).

use crate::error::{CoreError, CoreResult, ValidationIssue};
use crate::models::{
    Connection, ConnectionType, DecisionOption, Outcome, ResourceKind, Step, StepResource,
    StepType, Workflow, WorkflowStatus,
};
use crate::resources::InventoryOracle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresetInfo {
    pub name: String,
    pub description: Option<String>,
    pub difficulty: Option<String>,
    pub estimated_time: Option<i64>,
    pub tags: Vec<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    pub local_id: String,
    pub kind: ResourceKind,
    pub material_id: Option<String>,
    pub tool_id: Option<String>,
    pub documentation_id: Option<String>,
    pub material_name: Option<String>,
    pub tool_name: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub is_optional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOptionEnvelope {
    pub local_id: String,
    pub option_text: String,
    pub result_action: Option<String>,
    pub display_order: i64,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEnvelope {
    pub local_id: String,
    pub name: String,
    pub instructions: Option<String>,
    pub display_order: i64,
    pub step_type: StepType,
    pub estimated_duration: Option<i64>,
    pub is_milestone: bool,
    pub is_decision_point: bool,
    pub is_outcome: bool,
    pub condition_logic: Option<String>,
    pub resources: Vec<ResourceEnvelope>,
    pub decision_options: Vec<DecisionOptionEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEnvelope {
    pub local_id: String,
    pub name: String,
    pub display_order: i64,
    pub is_default: bool,
    pub success_criteria: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEnvelope {
    pub source_local_id: String,
    pub target_local_id: String,
    pub connection_type: ConnectionType,
    pub condition: Option<String>,
    pub display_order: i64,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEnvelope {
    pub name: String,
    pub description: Option<String>,
    pub has_multiple_outcomes: bool,
    pub estimated_duration: Option<i64>,
    pub difficulty_level: Option<String>,
    pub steps: Vec<StepEnvelope>,
    pub outcomes: Vec<OutcomeEnvelope>,
    pub connections: Vec<ConnectionEnvelope>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequiredResourcesEnvelope {
    pub materials: Vec<String>,
    pub tools: Vec<String>,
    pub documentation: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub format_version: String,
    pub exported_at: DateTime<Utc>,
    pub original_workflow_id: Option<String>,
}

/// The portable representation of a Workflow, stable across accounts and
/// inventory backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExportEnvelope {
    pub preset_info: PresetInfo,
    pub workflow: WorkflowEnvelope,
    pub required_resources: RequiredResourcesEnvelope,
    pub metadata: EnvelopeMetadata,
}

/// `Export(workflow)` (§4.8). `localId` is set equal to the pre-export step
/// id so a re-import of the same export is traceable; children are emitted
/// in `displayOrder` ascending, connections ordered by
/// `(sourceLocalId, displayOrder, targetLocalId)`.
pub fn export_workflow(workflow: &Workflow) -> WorkflowExportEnvelope {
    let mut steps: Vec<&Step> = workflow.steps.iter().collect();
    steps.sort_by_key(|s| s.display_order);

    let mut materials = std::collections::BTreeSet::new();
    let mut tools = std::collections::BTreeSet::new();
    let mut documentation = std::collections::BTreeSet::new();

    let step_envelopes: Vec<StepEnvelope> = steps
        .iter()
        .map(|step| {
            let mut resources: Vec<&StepResource> = step.resources.iter().collect();
            resources.sort_by_key(|r| r.id.clone());
            let resource_envelopes = resources
                .iter()
                .map(|r| {
                    match r.resource_kind {
                        ResourceKind::Material => {
                            if let Some(id) = &r.material_id {
                                materials.insert(id.clone());
                            }
                        }
                        ResourceKind::Tool => {
                            if let Some(id) = &r.tool_id {
                                tools.insert(id.clone());
                            }
                        }
                        ResourceKind::Documentation => {
                            if let Some(id) = &r.documentation_id {
                                documentation.insert(id.clone());
                            }
                        }
                    }
                    ResourceEnvelope {
                        local_id: r.id.clone(),
                        kind: r.resource_kind,
                        material_id: r.material_id.clone(),
                        tool_id: r.tool_id.clone(),
                        documentation_id: r.documentation_id.clone(),
                        material_name: None,
                        tool_name: None,
                        quantity: r.quantity,
                        unit: r.unit.clone(),
                        is_optional: r.is_optional,
                    }
                })
                .collect();

            let mut options: Vec<&DecisionOption> = step.decision_options.iter().collect();
            options.sort_by_key(|o| o.display_order);
            let option_envelopes = options
                .iter()
                .map(|o| DecisionOptionEnvelope {
                    local_id: o.id.clone(),
                    option_text: o.option_text.clone(),
                    result_action: o.result_action.clone(),
                    display_order: o.display_order,
                    is_default: o.is_default,
                })
                .collect();

            StepEnvelope {
                local_id: step.id.clone(),
                name: step.name.clone(),
                instructions: step.instructions.clone(),
                display_order: step.display_order,
                step_type: step.step_type,
                estimated_duration: step.estimated_duration,
                is_milestone: step.is_milestone,
                is_decision_point: step.is_decision_point,
                is_outcome: step.is_outcome,
                condition_logic: step.condition_logic.clone(),
                resources: resource_envelopes,
                decision_options: option_envelopes,
            }
        })
        .collect();

    let mut connections: Vec<ConnectionEnvelope> = steps
        .iter()
        .flat_map(|step| {
            step.outgoing_connections.iter().map(|c| ConnectionEnvelope {
                source_local_id: c.source_step_id.clone(),
                target_local_id: c.target_step_id.clone(),
                connection_type: c.connection_type,
                condition: c.condition.clone(),
                display_order: c.display_order,
                is_default: c.is_default,
            })
        })
        .collect();
    connections.sort_by(|a, b| {
        a.source_local_id
            .cmp(&b.source_local_id)
            .then(a.display_order.cmp(&b.display_order))
            .then(a.target_local_id.cmp(&b.target_local_id))
    });

    let mut outcomes: Vec<&Outcome> = workflow.outcomes.iter().collect();
    outcomes.sort_by_key(|o| o.display_order);
    let outcome_envelopes = outcomes
        .iter()
        .map(|o| OutcomeEnvelope {
            local_id: o.id.clone(),
            name: o.name.clone(),
            display_order: o.display_order,
            is_default: o.is_default,
            success_criteria: o.success_criteria.clone(),
        })
        .collect();

    WorkflowExportEnvelope {
        preset_info: PresetInfo {
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            difficulty: workflow.difficulty_level.clone(),
            estimated_time: workflow.estimated_duration,
            tags: Vec::new(),
            category: None,
        },
        workflow: WorkflowEnvelope {
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            has_multiple_outcomes: workflow.has_multiple_outcomes,
            estimated_duration: workflow.estimated_duration,
            difficulty_level: workflow.difficulty_level.clone(),
            steps: step_envelopes,
            outcomes: outcome_envelopes,
            connections,
        },
        required_resources: RequiredResourcesEnvelope {
            materials: materials.into_iter().collect(),
            tools: tools.into_iter().collect(),
            documentation: documentation.into_iter().collect(),
        },
        metadata: EnvelopeMetadata {
            format_version: "1.0".to_string(),
            exported_at: Utc::now(),
            original_workflow_id: Some(workflow.id.clone()),
        },
    }
}

/// Per-connection / per-resource problems surfaced alongside a successful
/// import (§7: "Partial Import reports per-connection warnings alongside
/// success").
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub workflow: Workflow,
    pub warnings: Vec<String>,
}

fn validate_envelope(envelope: &WorkflowExportEnvelope) -> CoreResult<()> {
    let mut issues = Vec::new();
    if envelope.workflow.name.trim().is_empty() {
        issues.push(ValidationIssue::new("workflow.name", "workflow name must not be empty"));
    }
    if envelope.metadata.format_version != "1.0" {
        issues.push(ValidationIssue::new(
            "metadata.formatVersion",
            format!("unsupported format version '{}'", envelope.metadata.format_version),
        ));
    }
    let local_ids: std::collections::HashSet<&str> =
        envelope.workflow.steps.iter().map(|s| s.local_id.as_str()).collect();
    if local_ids.len() != envelope.workflow.steps.len() {
        issues.push(ValidationIssue::new("workflow.steps", "duplicate step localId"));
    }
    if !issues.is_empty() {
        return Err(CoreError::validation(issues));
    }
    Ok(())
}

/// `Import(envelope, userId)` (§4.8). Structurally validates, allocates a
/// fresh Workflow with newly minted ids, remaps `localId`s, drops
/// connections whose endpoints didn't map (reported as warnings), and
/// resolves material/tool ids by name against `oracle` when the envelope
/// carries names but no id. The whole result is a single in-memory
/// Workflow; persistence is the caller's responsibility via `Repository`.
pub fn import_workflow(envelope: &WorkflowExportEnvelope, created_by: &str, oracle: &dyn InventoryOracle) -> CoreResult<ImportReport> {
    validate_envelope(envelope)?;

    let mut warnings = Vec::new();
    let new_workflow_id = Uuid::new_v4().to_string();
    let mut workflow = Workflow::new(&new_workflow_id, &envelope.workflow.name, created_by);
    workflow.description = envelope.workflow.description.clone();
    workflow.status = WorkflowStatus::Draft;
    workflow.has_multiple_outcomes = envelope.workflow.has_multiple_outcomes;
    workflow.estimated_duration = envelope.workflow.estimated_duration;
    workflow.difficulty_level = envelope.workflow.difficulty_level.clone();

    let mut step_id_map = std::collections::HashMap::new();
    for step_envelope in &envelope.workflow.steps {
        step_id_map.insert(step_envelope.local_id.clone(), Uuid::new_v4().to_string());
    }

    for step_envelope in &envelope.workflow.steps {
        let new_id = step_id_map[&step_envelope.local_id].clone();
        let mut step = Step::new(new_id, &new_workflow_id, step_envelope.name.clone(), step_envelope.display_order);
        step.instructions = step_envelope.instructions.clone();
        step.step_type = step_envelope.step_type;
        step.estimated_duration = step_envelope.estimated_duration;
        step.is_milestone = step_envelope.is_milestone;
        step.is_decision_point = step_envelope.is_decision_point;
        step.is_outcome = step_envelope.is_outcome;
        step.condition_logic = step_envelope.condition_logic.clone();

        for resource in &step_envelope.resources {
            let (resolved_material, resolved_tool, mut is_optional) =
                (resource.material_id.clone(), resource.tool_id.clone(), resource.is_optional);
            let material_id = match (&resolved_material, &resource.material_name) {
                (Some(id), _) => Some(id.clone()),
                (None, Some(name)) => match oracle.find_material(name) {
                    Ok(Some(id)) => Some(id),
                    _ => {
                        warnings.push(format!("material '{}' on step '{}' could not be resolved; marked optional", name, step_envelope.name));
                        is_optional = true;
                        None
                    }
                },
                (None, None) => None,
            };
            let tool_id = match (&resolved_tool, &resource.tool_name) {
                (Some(id), _) => Some(id.clone()),
                (None, Some(name)) => match oracle.find_tool(name) {
                    Ok(Some(id)) => Some(id),
                    _ => {
                        warnings.push(format!("tool '{}' on step '{}' could not be resolved; marked optional", name, step_envelope.name));
                        is_optional = true;
                        None
                    }
                },
                (None, None) => None,
            };
            step.resources.push(StepResource {
                id: Uuid::new_v4().to_string(),
                step_id: step.id.clone(),
                resource_kind: resource.kind,
                material_id,
                tool_id,
                documentation_id: resource.documentation_id.clone(),
                quantity: resource.quantity,
                unit: resource.unit.clone(),
                is_optional,
            });
        }

        for option in &step_envelope.decision_options {
            step.decision_options.push(DecisionOption {
                id: Uuid::new_v4().to_string(),
                step_id: step.id.clone(),
                option_text: option.option_text.clone(),
                result_action: option.result_action.clone(),
                display_order: option.display_order,
                is_default: option.is_default,
            });
        }

        workflow.steps.push(step);
    }

    for conn in &envelope.workflow.connections {
        let source = step_id_map.get(&conn.source_local_id);
        let target = step_id_map.get(&conn.target_local_id);
        let (source, target) = match (source, target) {
            (Some(s), Some(t)) => (s, t),
            _ => {
                warnings.push(format!(
                    "connection {} -> {} dropped: endpoint not present in import",
                    conn.source_local_id, conn.target_local_id
                ));
                continue;
            }
        };
        if source == target {
            warnings.push(format!("connection {} -> {} dropped: self-loop", conn.source_local_id, conn.target_local_id));
            continue;
        }
        let new_connection = match Connection::new(Uuid::new_v4().to_string(), source.clone(), target.clone(), conn.connection_type, conn.display_order) {
            Ok(mut c) => {
                c.condition = conn.condition.clone();
                c.is_default = conn.is_default;
                c
            }
            Err(_) => continue,
        };
        if let Some(step) = workflow.steps.iter_mut().find(|s| &s.id == source) {
            step.outgoing_connections.push(new_connection);
        }
    }

    for outcome in &envelope.workflow.outcomes {
        workflow.outcomes.push(Outcome {
            id: Uuid::new_v4().to_string(),
            workflow_id: new_workflow_id.clone(),
            name: outcome.name.clone(),
            display_order: outcome.display_order,
            is_default: outcome.is_default,
            success_criteria: outcome.success_criteria.clone(),
        });
    }

    Ok(ImportReport { workflow, warnings })
}
