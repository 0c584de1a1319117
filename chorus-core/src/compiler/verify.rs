use crate::compiler::ir::{IrNode, WorkflowIr};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};

/// Compile/patch-time validation failures. Fail fast; the stored IR is
/// never altered when any of these fire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("duplicate node id '{node}'")]
    DuplicateNode { node: String },
    #[error("workflow has no entry nodes")]
    NoEntryNodes,
    #[error("workflow has no terminal nodes")]
    NoTerminalNodes,
    #[error("edge {from}->{to} references unknown node '{missing}'")]
    EdgeToUnknownNode {
        from: String,
        to: String,
        missing: String,
    },
    #[error("invalid loop on '{node}': {reason}")]
    InvalidLoop { node: String, reason: String },
    #[error("invalid branch on '{node}': {reason}")]
    InvalidBranch { node: String, reason: String },
    #[error("cycle without covering loop block: [{}]", cycle.join(", "))]
    CyclicWithoutLoop { cycle: Vec<String> },
    #[error("node '{node}' is unreachable from any entry node")]
    UnreachableNode { node: String },
    #[error("failed to store config for '{node}': {detail}")]
    ConfigStore { node: String, detail: String },
}

/// Verify structural invariants of a compiled IR.
///
/// Returns every violation found; empty means valid. `compile` fails fast
/// on the first entry.
pub fn verify(ir: &WorkflowIr, allow_endless: bool) -> Vec<CompileError> {
    let mut errors = Vec::new();

    // 1. At least one entry node (no dependencies).
    if ir.entry_nodes.is_empty() && !allow_endless {
        errors.push(CompileError::NoEntryNodes);
    }

    // 2. At least one terminal node.
    if ir.terminal_nodes().next().is_none() && !allow_endless {
        errors.push(CompileError::NoTerminalNodes);
    }

    // 3. Loop blocks: positive bound, known targets.
    for node in ir.nodes.values() {
        if let Some(lp) = &node.loop_block {
            if lp.max_iterations == 0 {
                errors.push(CompileError::InvalidLoop {
                    node: node.id.clone(),
                    reason: "max_iterations must be > 0".into(),
                });
            }
            if !ir.nodes.contains_key(&lp.loop_back_to) {
                errors.push(CompileError::InvalidLoop {
                    node: node.id.clone(),
                    reason: format!("loop_back_to '{}' does not exist", lp.loop_back_to),
                });
            }
            for target in lp.break_path.iter().chain(&lp.timeout_path) {
                if !ir.nodes.contains_key(target) {
                    errors.push(CompileError::InvalidLoop {
                        node: node.id.clone(),
                        reason: format!("path target '{target}' does not exist"),
                    });
                }
            }
        }
    }

    // 4. Branch blocks: at least one route source, known targets.
    for node in ir.nodes.values() {
        if let Some(br) = &node.branch {
            let routable = !br.rules.is_empty()
                || !br.default.is_empty()
                || !br.available_next_nodes.is_empty();
            if !routable {
                errors.push(CompileError::InvalidBranch {
                    node: node.id.clone(),
                    reason: "needs at least one rule, a default, or an allow-list".into(),
                });
            }
            let targets = br
                .rules
                .iter()
                .flat_map(|r| r.next_nodes.iter())
                .chain(&br.default)
                .chain(&br.available_next_nodes);
            for target in targets {
                if !ir.nodes.contains_key(target) {
                    errors.push(CompileError::InvalidBranch {
                        node: node.id.clone(),
                        reason: format!("target '{target}' does not exist"),
                    });
                }
            }
        }
    }

    // 5. Static cycles are forbidden unless a loop block inside the cycle
    //    targets back into it.
    errors.extend(cycle_errors(ir));

    // 6. Reachability from the entry set over static and dynamic edges.
    if !ir.entry_nodes.is_empty() {
        let reachable = reachable_set(ir);
        for id in ir.nodes.keys() {
            if !reachable.contains(id) {
                errors.push(CompileError::UnreachableNode { node: id.clone() });
            }
        }
    }

    errors
}

fn cycle_errors(ir: &WorkflowIr) -> Vec<CompileError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut idx: HashMap<&str, NodeIndex> = HashMap::new();
    for id in ir.nodes.keys() {
        idx.insert(id, graph.add_node(id));
    }
    for node in ir.nodes.values() {
        for dep in &node.dependents {
            if let Some(&to) = idx.get(dep.as_str()) {
                graph.add_edge(idx[node.id.as_str()], to, ());
            }
        }
    }

    let mut errors = Vec::new();
    for scc in tarjan_scc(&graph) {
        let cyclic = scc.len() > 1
            || (scc.len() == 1 && graph.contains_edge(scc[0], scc[0]));
        if !cyclic {
            continue;
        }
        let members: HashSet<&str> = scc.iter().map(|&i| graph[i]).collect();
        let covered = members.iter().any(|&id| {
            ir.nodes
                .get(id)
                .and_then(|n| n.loop_block.as_ref())
                .map(|lp| lp.enabled && members.contains(lp.loop_back_to.as_str()))
                .unwrap_or(false)
        });
        if !covered {
            let mut cycle: Vec<String> = members.iter().map(|s| s.to_string()).collect();
            cycle.sort();
            errors.push(CompileError::CyclicWithoutLoop { cycle });
        }
    }
    errors
}

/// BFS over every edge kind the runtime can traverse: static dependents,
/// branch rules/default/allow-list, loop back/break/timeout paths.
fn reachable_set(ir: &WorkflowIr) -> HashSet<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = ir.entry_nodes.iter().cloned().collect();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let Some(node) = ir.nodes.get(&id) else {
            continue;
        };
        for next in outgoing(node) {
            if !seen.contains(&next) {
                queue.push_back(next);
            }
        }
    }
    seen
}

fn outgoing(node: &IrNode) -> Vec<String> {
    let mut out: Vec<String> = node.dependents.iter().cloned().collect();
    if let Some(br) = &node.branch {
        out.extend(br.rules.iter().flat_map(|r| r.next_nodes.iter().cloned()));
        out.extend(br.default.iter().cloned());
        out.extend(br.available_next_nodes.iter().cloned());
    }
    if let Some(lp) = &node.loop_block {
        out.push(lp.loop_back_to.clone());
        out.extend(lp.break_path.iter().cloned());
        out.extend(lp.timeout_path.iter().cloned());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{LoopBlock, NodeKind};
    use crate::condition::Condition;
    use std::collections::{BTreeMap, BTreeSet};

    fn node(id: &str) -> IrNode {
        IrNode {
            id: id.to_string(),
            kind: NodeKind::Task,
            source_type: "task".into(),
            config_ref: None,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            is_terminal: true,
            branch: None,
            loop_block: None,
        }
    }

    fn ir(nodes: Vec<IrNode>, entries: Vec<&str>) -> WorkflowIr {
        WorkflowIr {
            workflow_id: "wf".into(),
            nodes: nodes
                .into_iter()
                .map(|n| (n.id.clone(), n))
                .collect::<BTreeMap<_, _>>(),
            entry_nodes: entries.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn rejects_empty_entry_set() {
        let mut a = node("a");
        a.dependencies.insert("a".into());
        let errors = verify(&ir(vec![a], vec![]), false);
        assert!(errors.contains(&CompileError::NoEntryNodes));
    }

    #[test]
    fn allow_endless_skips_existence_checks() {
        let mut a = node("a");
        a.is_terminal = false;
        a.dependencies.insert("a".into());
        let errors = verify(&ir(vec![a], vec![]), true);
        assert!(!errors.contains(&CompileError::NoEntryNodes));
        assert!(!errors.contains(&CompileError::NoTerminalNodes));
    }

    #[test]
    fn rejects_zero_iteration_loop() {
        let mut a = node("a");
        a.is_terminal = false;
        a.loop_block = Some(LoopBlock {
            enabled: true,
            condition: Condition::Expression {
                expr: "true".into(),
            },
            max_iterations: 0,
            loop_back_to: "a".into(),
            break_path: vec![],
            timeout_path: vec![],
        });
        let mut b = node("b");
        b.dependencies.insert("a".into());
        let mut a2 = a.clone();
        a2.dependents.insert("b".into());
        let errors = verify(&ir(vec![a2, b], vec!["a"]), false);
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileError::InvalidLoop { .. })));
    }

    #[test]
    fn rejects_uncovered_cycle() {
        let mut a = node("a");
        let mut b = node("b");
        a.dependents.insert("b".into());
        a.dependencies.insert("b".into());
        a.is_terminal = false;
        b.dependents.insert("a".into());
        b.dependencies.insert("a".into());
        b.is_terminal = false;
        let mut t = node("t");
        t.dependencies.insert("a".into());
        let mut a = a;
        a.dependents.insert("t".into());
        let errors = verify(&ir(vec![a, b, t], vec![]), true);
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileError::CyclicWithoutLoop { .. })));
    }

    #[test]
    fn loop_covered_cycle_is_allowed() {
        let mut a = node("a");
        let mut b = node("b");
        a.dependents.insert("b".into());
        b.dependencies.insert("a".into());
        b.dependents.insert("a".into());
        a.dependencies.insert("b".into());
        a.is_terminal = false;
        b.is_terminal = false;
        b.loop_block = Some(LoopBlock {
            enabled: true,
            condition: Condition::Expression {
                expr: "true".into(),
            },
            max_iterations: 3,
            loop_back_to: "a".into(),
            break_path: vec!["t".into()],
            timeout_path: vec![],
        });
        let mut t = node("t");
        t.dependencies.insert("b".into());
        let errors = verify(&ir(vec![a, b, t], vec![]), true);
        assert!(!errors
            .iter()
            .any(|e| matches!(e, CompileError::CyclicWithoutLoop { .. })));
    }

    #[test]
    fn flags_unreachable_nodes() {
        let a = node("a");
        let orphan = node("orphan");
        let errors = verify(&ir(vec![a, orphan], vec!["a"]), false);
        assert!(errors.contains(&CompileError::UnreachableNode {
            node: "orphan".into()
        }));
    }
}
