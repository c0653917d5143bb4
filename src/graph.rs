//! C1: graph-level validation tying together the local structural checks in
//! `models` with the reachability/cycle analysis in `algorithms`.

use crate::algorithms::{find_cycle, orphan_steps};
use crate::error::ValidationIssue;
use crate::models::Workflow;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ValidationReport {
    /// Structural errors (I1-I2) and field-level errors — always checked.
    pub errors: Vec<ValidationIssue>,
    /// Publication-readiness errors (I3-I4) — only meaningful for
    /// `PublishTemplate`; drafts may violate these.
    pub publication_errors: Vec<ValidationIssue>,
    /// Non-fatal observations: orphan steps, non-outcome dead ends,
    /// multiple defaults from one source.
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_structurally_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn is_publication_ready(&self) -> bool {
        self.errors.is_empty() && self.publication_errors.is_empty()
    }
}

/// Pure, in-memory validation of a workflow graph. No I/O.
pub fn validate(workflow: &Workflow) -> ValidationReport {
    let mut report = ValidationReport::default();
    report.errors.extend(workflow.validate_local());

    if let Some(cycle) = find_cycle(workflow) {
        report.publication_errors.push(ValidationIssue::new(
            "connections",
            format!("cycle detected: [{}]", cycle.join(", ")),
        ));
    }

    let orphans = orphan_steps(workflow);
    for step in &orphans {
        report.publication_errors.push(ValidationIssue::new(
            format!("steps[{}]", step.id),
            "step is not reachable from any initial step (I4)",
        ));
    }

    for step in &workflow.steps {
        if step.outgoing_connections.is_empty() && !step.is_outcome {
            report.publication_errors.push(ValidationIssue::new(
                format!("steps[{}]", step.id),
                "step has no outgoing connections and is not marked isOutcome (I4)",
            ));
        }
        let default_count = step
            .outgoing_connections
            .iter()
            .filter(|c| c.is_default)
            .count();
        if default_count > 1 {
            report.warnings.push(ValidationIssue::new(
                format!("steps[{}]", step.id),
                "multiple default connections from the same source",
            ));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Connection, ConnectionType, Step, Workflow};

    #[test]
    fn publish_rejects_self_loop_and_cycle() {
        let mut wf = Workflow::new("wf1", "Cyclic", "user-1");
        let mut a = Step::new("a", "wf1", "A", 1);
        let mut b = Step::new("b", "wf1", "B", 2);
        a.outgoing_connections.push(
            Connection::new("c1", "a", "b", ConnectionType::Sequential, 1).unwrap(),
        );
        b.outgoing_connections.push(
            Connection::new("c2", "b", "a", ConnectionType::Sequential, 1).unwrap(),
        );
        wf.steps = vec![a, b];

        let report = validate(&wf);
        assert!(!report.is_publication_ready());
        assert!(!report.publication_errors.is_empty());
    }

    #[test]
    fn publish_accepts_linear_workflow_ending_in_outcome() {
        let mut wf = Workflow::new("wf1", "Linear", "user-1");
        let mut a = Step::new("a", "wf1", "A", 1);
        let mut c = Step::new("c", "wf1", "C", 2);
        c.is_outcome = true;
        a.outgoing_connections.push(
            Connection::new("c1", "a", "c", ConnectionType::Sequential, 1).unwrap(),
        );
        wf.steps = vec![a, c];

        let report = validate(&wf);
        assert!(report.is_publication_ready(), "{:?}", report);
    }
}
