//! Pure graph algorithms over a Workflow's static Connection set:
//! reachability, cycle detection, shortest path, initial-step selection.
//! All functions operate on immutable snapshots; callers may memoize per
//! definition.

use crate::models::{Step, Workflow};
use crate::value::ValueMap;
use std::collections::{HashMap, HashSet, VecDeque};

/// Steps with no incoming connection and no parent. Falls back to the step
/// with the smallest `displayOrder` when that set is empty.
pub fn initial_steps(workflow: &Workflow) -> Vec<&Step> {
    let mut has_incoming: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        for conn in &step.outgoing_connections {
            has_incoming.insert(conn.target_step_id.as_str());
        }
    }

    let mut initial: Vec<&Step> = workflow
        .steps
        .iter()
        .filter(|s| s.parent_step_id.is_none() && !has_incoming.contains(s.id.as_str()))
        .collect();

    if initial.is_empty() {
        if let Some(min) = workflow.steps.iter().min_by_key(|s| s.display_order) {
            initial.push(min);
        }
    }

    initial.sort_by_key(|s| s.display_order);
    initial
}

/// Outgoing connections of `source_step_id` ordered `(isDefault desc,
/// displayOrder asc, id asc)` — the deterministic order required by
/// `NextStepSelection` and reachability.
pub fn ordered_outgoing<'a>(workflow: &'a Workflow, source_step_id: &str) -> Vec<&'a crate::models::Connection> {
    let mut conns: Vec<&crate::models::Connection> = workflow
        .get_step(source_step_id)
        .map(|s| s.outgoing_connections.iter().collect())
        .unwrap_or_default();
    conns.sort_by(|a, b| {
        b.is_default
            .cmp(&a.is_default)
            .then(a.display_order.cmp(&b.display_order))
            .then(a.id.cmp(&b.id))
    });
    conns
}

/// BFS reachability from the initial step set. Used for orphan detection and
/// publication check I4.
pub fn reachable_step_ids(workflow: &Workflow) -> HashSet<String> {
    let mut visited = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for step in initial_steps(workflow) {
        if visited.insert(step.id.clone()) {
            queue.push_back(step.id.clone());
        }
    }
    while let Some(step_id) = queue.pop_front() {
        if let Some(step) = workflow.get_step(&step_id) {
            for conn in &step.outgoing_connections {
                if visited.insert(conn.target_step_id.clone()) {
                    queue.push_back(conn.target_step_id.clone());
                }
            }
        }
    }
    visited
}

/// Steps unreachable from the initial set (orphans) — a warning at draft
/// time, a hard publication error (I4) combined with the outgoing-edge
/// check in `graph::validate`.
pub fn orphan_steps<'a>(workflow: &'a Workflow) -> Vec<&'a Step> {
    let reachable = reachable_step_ids(workflow);
    workflow
        .steps
        .iter()
        .filter(|s| !reachable.contains(s.id.as_str()))
        .collect()
}

/// DFS cycle detection with an explicit recursion stack. Returns the
/// offending cycle as a sequence of step ids, first repeated at the end
/// (e.g. `[A, B, A]`), or `None` if the graph is acyclic.
pub fn find_cycle(workflow: &Workflow) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<String> = Vec::new();

    fn visit<'a>(
        workflow: &'a Workflow,
        step_id: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        marks.insert(step_id, Mark::Visiting);
        stack.push(step_id.to_string());

        if let Some(step) = workflow.get_step(step_id) {
            for conn in &step.outgoing_connections {
                let target = conn.target_step_id.as_str();
                match marks.get(target) {
                    Some(Mark::Visiting) => {
                        let start = stack.iter().position(|s| s == target).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..].to_vec();
                        cycle.push(target.to_string());
                        return Some(cycle);
                    }
                    Some(Mark::Done) => continue,
                    None => {
                        if let Some(cycle) = visit(workflow, target, marks, stack) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }

        stack.pop();
        marks.insert(step_id, Mark::Done);
        None
    }

    for step in &workflow.steps {
        if !marks.contains_key(step.id.as_str()) {
            if let Some(cycle) = visit(workflow, &step.id, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

/// BFS shortest path from `source` to `target` over the unweighted
/// Connection set. Ties are broken by summed `estimatedDuration`, then by
/// the count of default connections traversed.
pub fn shortest_path(workflow: &Workflow, source: &str, target: &str) -> Option<Vec<String>> {
    if source == target {
        return Some(vec![source.to_string()]);
    }

    #[derive(Clone)]
    struct Candidate {
        path: Vec<String>,
        total_duration: i64,
        default_hops: usize,
    }

    let mut best: HashMap<String, Candidate> = HashMap::new();
    let start = Candidate {
        path: vec![source.to_string()],
        total_duration: 0,
        default_hops: 0,
    };
    best.insert(source.to_string(), start.clone());

    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    queue.push_back((source.to_string(), 0));
    let mut shortest_len: Option<usize> = None;
    let mut frontier_by_len: HashMap<usize, Vec<String>> = HashMap::new();
    frontier_by_len.entry(0).or_default().push(source.to_string());

    // Standard BFS, but keep every equal-shortest-length candidate per node
    // so we can pick the best one by the documented tie-break once the
    // target's shortest distance is known.
    let mut distances: HashMap<String, usize> = HashMap::new();
    distances.insert(source.to_string(), 0);
    let mut candidates: HashMap<String, Vec<Candidate>> = HashMap::new();
    candidates.insert(source.to_string(), vec![start]);

    while let Some((node, dist)) = queue.pop_front() {
        if let Some(sl) = shortest_len {
            if dist > sl {
                break;
            }
        }
        if node == target {
            shortest_len = Some(dist);
            continue;
        }
        let conns = ordered_outgoing(workflow, &node);
        for conn in conns {
            let next_dist = dist + 1;
            let existing = distances.get(conn.target_step_id.as_str()).copied();
            if existing.is_none() || existing == Some(next_dist) {
                distances.insert(conn.target_step_id.clone(), next_dist);
                let duration = workflow
                    .get_step(&conn.target_step_id)
                    .and_then(|s| s.estimated_duration)
                    .unwrap_or(0);
                let parent_candidates = candidates.get(&node).cloned().unwrap_or_default();
                for parent in parent_candidates {
                    let mut path = parent.path.clone();
                    path.push(conn.target_step_id.clone());
                    let candidate = Candidate {
                        path,
                        total_duration: parent.total_duration + duration,
                        default_hops: parent.default_hops + if conn.is_default { 1 } else { 0 },
                    };
                    candidates.entry(conn.target_step_id.clone()).or_default().push(candidate);
                }
                if existing.is_none() {
                    queue.push_back((conn.target_step_id.clone(), next_dist));
                }
            }
        }
    }

    let final_candidates = candidates.get(target)?;
    final_candidates
        .iter()
        .min_by(|a, b| {
            a.total_duration
                .cmp(&b.total_duration)
                .then(a.default_hops.cmp(&b.default_hops))
        })
        .map(|c| c.path.clone())
}

/// `NextStepSelection`'s raw edge candidate set, without condition
/// evaluation — used by the navigator (C6), which layers condition
/// evaluation (C4) on top.
pub fn candidate_next_steps<'a>(
    workflow: &'a Workflow,
    source_step_id: &str,
) -> Vec<&'a crate::models::Connection> {
    ordered_outgoing(workflow, source_step_id)
}

/// A throwaway context used only by algorithm-level tests; the real
/// evaluation context lives in `condition::Context`.
pub fn empty_ctx() -> ValueMap {
    ValueMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Connection, ConnectionType, Step, Workflow};

    fn linear_workflow() -> Workflow {
        let mut wf = Workflow::new("wf1", "Linear", "user-1");
        let mut a = Step::new("a", "wf1", "A", 1);
        let mut b = Step::new("b", "wf1", "B", 2);
        let mut c = Step::new("c", "wf1", "C", 3);
        c.is_outcome = true;
        a.outgoing_connections.push(
            Connection::new("c1", "a", "b", ConnectionType::Sequential, 1).unwrap(),
        );
        b.outgoing_connections.push(
            Connection::new("c2", "b", "c", ConnectionType::Sequential, 1).unwrap(),
        );
        wf.steps = vec![a, b, c];
        wf
    }

    #[test]
    fn initial_steps_has_no_incoming_edge() {
        let wf = linear_workflow();
        let initial = initial_steps(&wf);
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].id, "a");
    }

    #[test]
    fn reachability_covers_whole_linear_chain() {
        let wf = linear_workflow();
        let reachable = reachable_step_ids(&wf);
        assert_eq!(reachable.len(), 3);
        assert!(orphan_steps(&wf).is_empty());
    }

    #[test]
    fn detects_self_referencing_cycle() {
        let mut wf = linear_workflow();
        wf.steps[2].outgoing_connections.push(
            Connection::new("c3", "c", "a", ConnectionType::Sequential, 1).unwrap(),
        );
        let cycle = find_cycle(&wf);
        assert!(cycle.is_some(), "a->b->c->a should be detected as a cycle");
    }

    #[test]
    fn shortest_path_follows_the_single_chain() {
        let wf = linear_workflow();
        let path = shortest_path(&wf, "a", "c").unwrap();
        assert_eq!(path, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn orphan_detected_when_no_incoming_edge_and_not_initial() {
        let mut wf = linear_workflow();
        let mut d = Step::new("d", "wf1", "D", 4);
        d.is_outcome = true;
        wf.steps.push(d);
        let orphans = orphan_steps(&wf);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, "d");
    }
}
