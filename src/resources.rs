//! C7: requirement aggregation and the reserve/release protocol against the
//! external inventory oracle. The engine never mutates inventory state
//! directly — every availability check and hold goes through `InventoryOracle`
//! (§6); this module only aggregates, calls, and records.

use crate::config::{CoreConfig, ReservationPolicy};
use crate::error::{CoreError, CoreResult};
use crate::models::{Execution, ResourceKind, Step, StepResource, Workflow};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// The external authority over material/tool availability (§6). Implementors
/// are injected at startup; the coordinator never assumes a particular
/// backend.
pub trait InventoryOracle: Send + Sync {
    fn check_material(&self, id: &str, qty: f64) -> CoreResult<(bool, f64)>;
    fn reserve_material(&self, id: &str, qty: f64) -> CoreResult<String>;
    fn release_material(&self, token: &str) -> CoreResult<()>;
    fn check_tool(&self, id: &str, duration_minutes: i64) -> CoreResult<(bool, f64)>;
    fn reserve_tool(&self, id: &str, duration_minutes: i64) -> CoreResult<String>;
    fn release_tool(&self, token: &str) -> CoreResult<()>;
    fn find_material(&self, name: &str) -> CoreResult<Option<String>>;
    fn find_tool(&self, name: &str) -> CoreResult<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MaterialRequirement {
    pub material_id: String,
    pub total_quantity: f64,
    pub required: bool,
    pub step_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ToolRequirement {
    pub tool_id: String,
    pub total_duration_minutes: i64,
    pub required: bool,
    pub step_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RequirementAnalysis {
    pub materials: Vec<MaterialRequirement>,
    pub tools: Vec<ToolRequirement>,
    /// Fraction of required resources currently available, in `[0, 1]`.
    /// `1.0` when there are no required resources at all.
    pub readiness_score: f64,
    /// Missing required materials/tools — a workflow at 0 blocking issues
    /// and readiness 1.0 is safe to start under a strict policy.
    pub blocking_issues: Vec<String>,
    /// Missing optional materials/tools, informational only.
    pub warnings: Vec<String>,
}

/// For each Step, sums quantities per `materialId` and collects tool ids
/// with per-tool total usage minutes. A requirement is `required` if any
/// step using it marks the resource non-optional.
pub fn analyze_requirements(workflow: &Workflow) -> RequirementAnalysis {
    let mut materials: HashMap<String, MaterialRequirement> = HashMap::new();
    let mut tools: HashMap<String, ToolRequirement> = HashMap::new();

    for step in &workflow.steps {
        for resource in &step.resources {
            match resource.resource_kind {
                ResourceKind::Material => {
                    if let Some(id) = &resource.material_id {
                        let entry = materials.entry(id.clone()).or_insert_with(|| MaterialRequirement {
                            material_id: id.clone(),
                            total_quantity: 0.0,
                            required: false,
                            step_ids: Vec::new(),
                        });
                        entry.total_quantity += resource.quantity.unwrap_or(0.0);
                        entry.required |= !resource.is_optional;
                        entry.step_ids.push(step.id.clone());
                    }
                }
                ResourceKind::Tool => {
                    if let Some(id) = &resource.tool_id {
                        let entry = tools.entry(id.clone()).or_insert_with(|| ToolRequirement {
                            tool_id: id.clone(),
                            total_duration_minutes: 0,
                            required: false,
                            step_ids: Vec::new(),
                        });
                        entry.total_duration_minutes += step.estimated_duration.unwrap_or(0);
                        entry.required |= !resource.is_optional;
                        entry.step_ids.push(step.id.clone());
                    }
                }
                ResourceKind::Documentation => {}
            }
        }
    }

    let mut materials: Vec<_> = materials.into_values().collect();
    materials.sort_by(|a, b| a.material_id.cmp(&b.material_id));
    let mut tools: Vec<_> = tools.into_values().collect();
    tools.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));

    RequirementAnalysis {
        materials,
        tools,
        readiness_score: 1.0,
        blocking_issues: Vec::new(),
        warnings: Vec::new(),
    }
}

/// A single held reservation, as stored in `executionData.reservations`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationRecord {
    pub kind: ResourceKind,
    pub resource_id: String,
    pub quantity: f64,
    pub token: String,
    pub step_id: String,
}

impl ReservationRecord {
    fn to_value(&self) -> Value {
        let mut map = HashMap::new();
        map.insert(
            "kind".to_string(),
            Value::String(match self.kind {
                ResourceKind::Material => "material".to_string(),
                ResourceKind::Tool => "tool".to_string(),
                ResourceKind::Documentation => "documentation".to_string(),
            }),
        );
        map.insert("resourceId".to_string(), Value::String(self.resource_id.clone()));
        map.insert("quantity".to_string(), Value::Number(self.quantity));
        map.insert("token".to_string(), Value::String(self.token.clone()));
        map.insert("stepId".to_string(), Value::String(self.step_id.clone()));
        Value::Map(map)
    }

    fn from_value(v: &Value) -> Option<Self> {
        let map = match v {
            Value::Map(m) => m,
            _ => return None,
        };
        let kind = match map.get("kind")?.as_str()? {
            "material" => ResourceKind::Material,
            "tool" => ResourceKind::Tool,
            "documentation" => ResourceKind::Documentation,
            _ => return None,
        };
        Some(Self {
            kind,
            resource_id: map.get("resourceId")?.as_str()?.to_string(),
            quantity: map.get("quantity")?.as_number()?,
            token: map.get("token")?.as_str()?.to_string(),
            step_id: map.get("stepId")?.as_str()?.to_string(),
        })
    }
}

pub const RESERVATIONS_KEY: &str = "reservations";

fn load_reservations(execution: &Execution) -> Vec<ReservationRecord> {
    match execution.execution_data.get(RESERVATIONS_KEY) {
        Some(Value::List(items)) => items.iter().filter_map(ReservationRecord::from_value).collect(),
        _ => Vec::new(),
    }
}

fn store_reservations(execution: &mut Execution, records: &[ReservationRecord]) {
    let list = records.iter().map(ReservationRecord::to_value).collect();
    execution.execution_data.insert(RESERVATIONS_KEY.to_string(), Value::List(list));
}

/// Runs `f` on a worker thread and fails with `CoreError::Timeout` if it
/// does not return within `timeout`. The inventory oracle is an external
/// collaborator (§6) whose own latency is outside our control, so every
/// call is wrapped rather than trusting it to self-enforce a deadline.
/// Requires a `'static` closure, so callers hand in owned arguments and an
/// `Arc`-cloned oracle rather than a borrowed one.
pub fn call_with_timeout<T, F>(timeout: Duration, f: F) -> CoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CoreResult<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout("inventory oracle call exceeded the configured timeout".to_string())),
    }
}

pub struct ResourceCoordinator<'a> {
    oracle: Arc<dyn InventoryOracle>,
    config: &'a CoreConfig,
}

impl<'a> ResourceCoordinator<'a> {
    pub fn new(oracle: Arc<dyn InventoryOracle>, config: &'a CoreConfig) -> Self {
        Self { oracle, config }
    }

    fn check_material_timed(&self, id: String, qty: f64, timeout: Duration) -> CoreResult<(bool, f64)> {
        let oracle = Arc::clone(&self.oracle);
        call_with_timeout(timeout, move || oracle.check_material(&id, qty))
    }

    fn reserve_material_timed(&self, id: String, qty: f64, timeout: Duration) -> CoreResult<String> {
        let oracle = Arc::clone(&self.oracle);
        call_with_timeout(timeout, move || oracle.reserve_material(&id, qty))
    }

    fn check_tool_timed(&self, id: String, minutes: i64, timeout: Duration) -> CoreResult<(bool, f64)> {
        let oracle = Arc::clone(&self.oracle);
        call_with_timeout(timeout, move || oracle.check_tool(&id, minutes))
    }

    fn reserve_tool_timed(&self, id: String, minutes: i64, timeout: Duration) -> CoreResult<String> {
        let oracle = Arc::clone(&self.oracle);
        call_with_timeout(timeout, move || oracle.reserve_tool(&id, minutes))
    }

    /// `AnalyzeRequirements` (§4.7): aggregates quantities then queries the
    /// oracle read-only (no reservation held) to compute a `readinessScore`
    /// and split missing resources into blocking (required) versus warning
    /// (optional) issues. A timeout on a single check is treated as
    /// unavailable for that resource rather than failing the whole call.
    pub fn assess_readiness(&self, workflow: &Workflow) -> RequirementAnalysis {
        let mut analysis = analyze_requirements(workflow);
        let timeout = Duration::from_millis(self.config.reservation.oracle_timeout_ms);

        let mut required_total = 0usize;
        let mut required_available = 0usize;

        for req in &analysis.materials {
            let available = self
                .check_material_timed(req.material_id.clone(), req.total_quantity, timeout)
                .map(|(ok, _)| ok)
                .unwrap_or(false);
            if req.required {
                required_total += 1;
                if available {
                    required_available += 1;
                } else {
                    analysis.blocking_issues.push(format!("material '{}' unavailable", req.material_id));
                }
            } else if !available {
                analysis.warnings.push(format!("optional material '{}' unavailable", req.material_id));
            }
        }

        for req in &analysis.tools {
            let available = self
                .check_tool_timed(req.tool_id.clone(), req.total_duration_minutes, timeout)
                .map(|(ok, _)| ok)
                .unwrap_or(false);
            if req.required {
                required_total += 1;
                if available {
                    required_available += 1;
                } else {
                    analysis.blocking_issues.push(format!("tool '{}' unavailable", req.tool_id));
                }
            } else if !available {
                analysis.warnings.push(format!("optional tool '{}' unavailable", req.tool_id));
            }
        }

        analysis.readiness_score = if required_total == 0 {
            1.0
        } else {
            required_available as f64 / required_total as f64
        };
        analysis
    }

    /// Reserve-on-start (§4.5.2 step 2). Reserves every requirement in turn;
    /// on a required-resource failure under `strict` policy, releases every
    /// reservation made so far in this call and returns `Unreserved`.
    /// Under `warn` policy a failed required reservation is logged and
    /// skipped rather than aborting the execution. On timeout, prior
    /// successful reservations in this call are released before failing.
    pub fn reserve(&self, execution: &mut Execution, workflow: &Workflow) -> CoreResult<()> {
        let analysis = analyze_requirements(workflow);
        let timeout = Duration::from_millis(self.config.reservation.oracle_timeout_ms);
        let mut held: Vec<ReservationRecord> = Vec::new();

        for req in &analysis.materials {
            let (available, _on_hand) =
                match self.check_material_timed(req.material_id.clone(), req.total_quantity, timeout) {
                    Ok(v) => v,
                    Err(e @ CoreError::Timeout(_)) => {
                        self.release_all(&held);
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                };
            if !available {
                if req.required && self.config.reservation.policy == ReservationPolicy::Strict {
                    self.release_all(&held);
                    return Err(CoreError::Unreserved(format!(
                        "material '{}' unavailable (need {})",
                        req.material_id, req.total_quantity
                    )));
                }
                log::warn!("material '{}' unavailable at start, proceeding under warn policy", req.material_id);
                continue;
            }
            let token = match self.reserve_material_timed(req.material_id.clone(), req.total_quantity, timeout) {
                Ok(t) => t,
                Err(e @ CoreError::Timeout(_)) => {
                    self.release_all(&held);
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            for step_id in &req.step_ids {
                held.push(ReservationRecord {
                    kind: ResourceKind::Material,
                    resource_id: req.material_id.clone(),
                    quantity: req.total_quantity,
                    token: token.clone(),
                    step_id: step_id.clone(),
                });
            }
        }

        for req in &analysis.tools {
            let (available, _) =
                match self.check_tool_timed(req.tool_id.clone(), req.total_duration_minutes, timeout) {
                    Ok(v) => v,
                    Err(e @ CoreError::Timeout(_)) => {
                        self.release_all(&held);
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                };
            if !available {
                if req.required && self.config.reservation.policy == ReservationPolicy::Strict {
                    self.release_all(&held);
                    return Err(CoreError::Unreserved(format!(
                        "tool '{}' unavailable ({} minutes)",
                        req.tool_id, req.total_duration_minutes
                    )));
                }
                log::warn!("tool '{}' unavailable at start, proceeding under warn policy", req.tool_id);
                continue;
            }
            let token = match self.reserve_tool_timed(req.tool_id.clone(), req.total_duration_minutes, timeout) {
                Ok(t) => t,
                Err(e @ CoreError::Timeout(_)) => {
                    self.release_all(&held);
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            for step_id in &req.step_ids {
                held.push(ReservationRecord {
                    kind: ResourceKind::Tool,
                    resource_id: req.tool_id.clone(),
                    quantity: req.total_duration_minutes as f64,
                    token: token.clone(),
                    step_id: step_id.clone(),
                });
            }
        }

        store_reservations(execution, &held);
        Ok(())
    }

    fn release_all(&self, records: &[ReservationRecord]) {
        for record in records {
            let result = match record.kind {
                ResourceKind::Material => self.oracle.release_material(&record.token),
                ResourceKind::Tool => self.oracle.release_tool(&record.token),
                ResourceKind::Documentation => Ok(()),
            };
            if let Err(e) = result {
                log::warn!("failed to release reservation token '{}': {}", record.token, e);
            }
        }
    }

    /// Release every held token. Idempotent: an execution with no
    /// reservations recorded is a no-op (R3). Continues past individual
    /// oracle failures and aggregates them into a single error message
    /// rather than aborting mid-release.
    pub fn release(&self, execution: &mut Execution) -> CoreResult<()> {
        let records = load_reservations(execution);
        if records.is_empty() {
            return Ok(());
        }
        let mut errors = Vec::new();
        for record in &records {
            let result = match record.kind {
                ResourceKind::Material => self.oracle.release_material(&record.token),
                ResourceKind::Tool => self.oracle.release_tool(&record.token),
                ResourceKind::Documentation => Ok(()),
            };
            if let Err(e) = result {
                errors.push(format!("{}: {}", record.token, e));
            }
        }
        execution.execution_data.remove(RESERVATIONS_KEY);
        if !errors.is_empty() {
            return Err(CoreError::ExternalUnavailable(format!(
                "errors releasing {} reservation(s): {}",
                errors.len(),
                errors.join("; ")
            )));
        }
        Ok(())
    }

    /// Subset of reservations attached to `step`, for UI display ahead of
    /// entering it.
    pub fn prepare_step(&self, execution: &Execution, step: &Step) -> Vec<ReservationRecord> {
        load_reservations(execution)
            .into_iter()
            .filter(|r| r.step_id == step.id)
            .collect()
    }

    /// Attaches planned-vs-actual usage onto the StepExecution's `stepData`;
    /// does not release reservations (release is whole-execution, §4.7).
    pub fn record_usage(
        &self,
        step_data: &mut crate::value::ValueMap,
        resource: &StepResource,
        actual_usage: Option<f64>,
    ) {
        let mut entry = HashMap::new();
        entry.insert("planned".to_string(), Value::Number(resource.quantity.unwrap_or(0.0)));
        entry.insert(
            "actual".to_string(),
            actual_usage.map(Value::Number).unwrap_or(Value::Null),
        );
        let key = format!("usage.{}", resource.id);
        step_data.insert(key, Value::Map(entry));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Connection, ConnectionType, Step, Workflow};
    use std::sync::Mutex;

    struct FakeOracle {
        on_hand: Mutex<HashMap<String, f64>>,
        reserved: Mutex<Vec<String>>,
        released: Mutex<Vec<String>>,
    }

    impl FakeOracle {
        fn new(stock: &[(&str, f64)]) -> Self {
            Self {
                on_hand: Mutex::new(stock.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
                reserved: Mutex::new(Vec::new()),
                released: Mutex::new(Vec::new()),
            }
        }
    }

    impl InventoryOracle for FakeOracle {
        fn check_material(&self, id: &str, qty: f64) -> CoreResult<(bool, f64)> {
            let on_hand = *self.on_hand.lock().unwrap().get(id).unwrap_or(&0.0);
            Ok((on_hand >= qty, on_hand))
        }
        fn reserve_material(&self, id: &str, _qty: f64) -> CoreResult<String> {
            let token = format!("mat-{}-{}", id, self.reserved.lock().unwrap().len());
            self.reserved.lock().unwrap().push(token.clone());
            Ok(token)
        }
        fn release_material(&self, token: &str) -> CoreResult<()> {
            self.released.lock().unwrap().push(token.to_string());
            Ok(())
        }
        fn check_tool(&self, _id: &str, _duration_minutes: i64) -> CoreResult<(bool, f64)> {
            Ok((true, 1.0))
        }
        fn reserve_tool(&self, id: &str, _duration_minutes: i64) -> CoreResult<String> {
            Ok(format!("tool-{}", id))
        }
        fn release_tool(&self, token: &str) -> CoreResult<()> {
            self.released.lock().unwrap().push(token.to_string());
            Ok(())
        }
        fn find_material(&self, _name: &str) -> CoreResult<Option<String>> {
            Ok(None)
        }
        fn find_tool(&self, _name: &str) -> CoreResult<Option<String>> {
            Ok(None)
        }
    }

    fn workflow_with_material(qty: f64, optional: bool) -> Workflow {
        let mut wf = Workflow::new("wf1", "Material flow", "user-1");
        let mut a = Step::new("a", "wf1", "A", 1);
        a.resources.push(StepResource {
            id: "r1".to_string(),
            step_id: "a".to_string(),
            resource_kind: ResourceKind::Material,
            material_id: Some("M".to_string()),
            tool_id: None,
            documentation_id: None,
            quantity: Some(qty),
            unit: Some("kg".to_string()),
            is_optional: optional,
        });
        let mut b = Step::new("b", "wf1", "B", 2);
        b.is_outcome = true;
        a.outgoing_connections.push(Connection::new("c1", "a", "b", ConnectionType::Sequential, 1).unwrap());
        wf.steps = vec![a, b];
        wf
    }

    #[test]
    fn strict_policy_rejects_insufficient_required_material() {
        let wf = workflow_with_material(5.0, false);
        let oracle: Arc<dyn InventoryOracle> = Arc::new(FakeOracle::new(&[("M", 2.0)]));
        let mut config = CoreConfig::default();
        config.reservation.policy = ReservationPolicy::Strict;
        let coordinator = ResourceCoordinator::new(Arc::clone(&oracle), &config);
        let mut execution = Execution::new("wf1", "user-1");

        let result = coordinator.reserve(&mut execution, &wf);
        assert!(matches!(result, Err(CoreError::Unreserved(_))));
    }

    #[test]
    fn warn_policy_proceeds_despite_shortage() {
        let wf = workflow_with_material(5.0, false);
        let oracle: Arc<dyn InventoryOracle> = Arc::new(FakeOracle::new(&[("M", 2.0)]));
        let mut config = CoreConfig::default();
        config.reservation.policy = ReservationPolicy::Warn;
        let coordinator = ResourceCoordinator::new(Arc::clone(&oracle), &config);
        let mut execution = Execution::new("wf1", "user-1");

        assert!(coordinator.reserve(&mut execution, &wf).is_ok());
    }

    #[test]
    fn reserve_then_release_clears_reservation_record() {
        let wf = workflow_with_material(2.0, false);
        let oracle: Arc<dyn InventoryOracle> = Arc::new(FakeOracle::new(&[("M", 10.0)]));
        let config = CoreConfig::default();
        let coordinator = ResourceCoordinator::new(Arc::clone(&oracle), &config);
        let mut execution = Execution::new("wf1", "user-1");

        coordinator.reserve(&mut execution, &wf).unwrap();
        assert!(execution.execution_data.contains_key(RESERVATIONS_KEY));

        coordinator.release(&mut execution).unwrap();
        assert!(!execution.execution_data.contains_key(RESERVATIONS_KEY));

        // Idempotent: releasing again is a no-op (R3).
        assert!(coordinator.release(&mut execution).is_ok());
    }

    #[test]
    fn assess_readiness_flags_missing_required_material_as_blocking() {
        let wf = workflow_with_material(5.0, false);
        let oracle: Arc<dyn InventoryOracle> = Arc::new(FakeOracle::new(&[("M", 2.0)]));
        let config = CoreConfig::default();
        let coordinator = ResourceCoordinator::new(Arc::clone(&oracle), &config);

        let analysis = coordinator.assess_readiness(&wf);
        assert_eq!(analysis.readiness_score, 0.0);
        assert_eq!(analysis.blocking_issues.len(), 1);
        assert!(analysis.warnings.is_empty());
    }

    #[test]
    fn assess_readiness_is_full_when_everything_is_available() {
        let wf = workflow_with_material(2.0, false);
        let oracle: Arc<dyn InventoryOracle> = Arc::new(FakeOracle::new(&[("M", 10.0)]));
        let config = CoreConfig::default();
        let coordinator = ResourceCoordinator::new(Arc::clone(&oracle), &config);

        let analysis = coordinator.assess_readiness(&wf);
        assert_eq!(analysis.readiness_score, 1.0);
        assert!(analysis.blocking_issues.is_empty());
    }

    #[test]
    fn analyze_requirements_sums_quantities_across_steps() {
        let mut wf = workflow_with_material(3.0, false);
        let mut extra = Step::new("x", "wf1", "X", 3);
        extra.resources.push(StepResource {
            id: "r2".to_string(),
            step_id: "x".to_string(),
            resource_kind: ResourceKind::Material,
            material_id: Some("M".to_string()),
            tool_id: None,
            documentation_id: None,
            quantity: Some(4.0),
            unit: None,
            is_optional: false,
        });
        wf.steps.push(extra);

        let analysis = analyze_requirements(&wf);
        let req = analysis.materials.iter().find(|r| r.material_id == "M").unwrap();
        assert_eq!(req.total_quantity, 7.0);
        assert_eq!(req.step_ids.len(), 2);
    }
}
