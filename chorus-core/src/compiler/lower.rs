use crate::blob::{put_json, BlobStore};
use crate::compiler::document::{NodeSpec, WorkflowDocument};
use crate::compiler::ir::{BranchBlock, BranchKind, BranchRule, IrNode, LoopBlock, NodeKind, WorkflowIr};
use crate::compiler::verify::{verify, CompileError};
use crate::condition::Condition;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Source types that normalize to `task`.
const TASK_ALIASES: &[&str] = &[
    "task",
    "function",
    "http",
    "transform",
    "aggregate",
    "filter",
    "classifier",
    "search",
];

/// Compile a workflow document into the normalized IR.
///
/// Pass 1 derives adjacency (parallel gateways are elided — fan-out is an
/// edge property), pass 2 normalizes node types and synthesizes
/// branch/loop blocks, pass 3 precomputes terminal flags, pass 4 validates.
/// Per-node configs land in the blob store; the IR carries only refs.
pub async fn compile(
    doc: &WorkflowDocument,
    blob: &dyn BlobStore,
) -> Result<WorkflowIr, CompileError> {
    // ── Pass 1: node index + adjacency ──

    let mut specs: HashMap<&str, &NodeSpec> = HashMap::new();
    for node in &doc.nodes {
        if specs.insert(node.id.as_str(), node).is_some() {
            return Err(CompileError::DuplicateNode {
                node: node.id.clone(),
            });
        }
    }

    for edge in &doc.edges {
        for end in [&edge.from, &edge.to] {
            if !specs.contains_key(end.as_str()) {
                return Err(CompileError::EdgeToUnknownNode {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: end.clone(),
                });
            }
        }
    }

    let edges = elide_parallel(doc, &specs);

    let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (from, to, _) in &edges {
        dependents.entry(from.clone()).or_default().insert(to.clone());
        dependencies.entry(to.clone()).or_default().insert(from.clone());
    }

    // ── Pass 2: normalization + block synthesis ──

    let mut nodes: BTreeMap<String, IrNode> = BTreeMap::new();
    for spec in &doc.nodes {
        if spec.node_type == "parallel" {
            continue;
        }

        let branch = synthesize_branch(spec, &edges)?;
        let loop_block = synthesize_loop(spec)?;

        let kind = match spec.node_type.as_str() {
            t if TASK_ALIASES.contains(&t) => NodeKind::Task,
            "conditional" | "loop" => NodeKind::Task,
            "agent" => NodeKind::Agent,
            "human" => NodeKind::Human,
            other => NodeKind::Other(other.to_string()),
        };

        let config_ref = if spec.config.is_null() {
            None
        } else {
            Some(put_json(blob, &spec.config).await.map_err(|e| {
                CompileError::ConfigStore {
                    node: spec.id.clone(),
                    detail: e.to_string(),
                }
            })?)
        };

        nodes.insert(
            spec.id.clone(),
            IrNode {
                id: spec.id.clone(),
                kind,
                source_type: spec.node_type.clone(),
                config_ref,
                dependencies: dependencies.remove(&spec.id).unwrap_or_default(),
                dependents: dependents.remove(&spec.id).unwrap_or_default(),
                is_terminal: false,
                branch,
                loop_block,
            },
        );
    }

    // The loop-back edge is covered by the loop block, not the static
    // graph; dropping it keeps the target's dependency count (and so its
    // join detection) honest.
    let loop_backs: Vec<(String, String)> = nodes
        .values()
        .filter_map(|n| {
            n.loop_block
                .as_ref()
                .map(|lp| (n.id.clone(), lp.loop_back_to.clone()))
        })
        .collect();
    for (from, to) in loop_backs {
        if let Some(n) = nodes.get_mut(&from) {
            n.dependents.remove(&to);
        }
        if let Some(n) = nodes.get_mut(&to) {
            n.dependencies.remove(&from);
        }
    }

    // Dynamic routes (branch rules/default/allow-list, loop break/timeout)
    // become static adjacency as well, so entry detection, join counting
    // and the mutual-consistency invariant see every possible edge.
    let mut implied: Vec<(String, String)> = Vec::new();
    for node in nodes.values() {
        if let Some(br) = &node.branch {
            for target in br
                .rules
                .iter()
                .flat_map(|r| r.next_nodes.iter())
                .chain(&br.default)
                .chain(&br.available_next_nodes)
            {
                implied.push((node.id.clone(), target.clone()));
            }
        }
        if let Some(lp) = &node.loop_block {
            for target in lp.break_path.iter().chain(&lp.timeout_path) {
                implied.push((node.id.clone(), target.clone()));
            }
        }
    }
    for (from, to) in implied {
        if from == to || !nodes.contains_key(&to) {
            continue;
        }
        nodes
            .get_mut(&from)
            .expect("implied edge source exists")
            .dependents
            .insert(to.clone());
        nodes
            .get_mut(&to)
            .expect("implied edge target checked")
            .dependencies
            .insert(from);
    }

    // ── Pass 3: terminal detection ──

    let flags: Vec<(String, bool)> = nodes
        .values()
        .map(|n| (n.id.clone(), is_terminal(n)))
        .collect();
    for (id, flag) in flags {
        nodes.get_mut(&id).expect("node exists").is_terminal = flag;
    }

    let entry_nodes: Vec<String> = nodes
        .values()
        .filter(|n| n.dependencies.is_empty())
        .map(|n| n.id.clone())
        .collect();

    let ir = WorkflowIr {
        workflow_id: doc.id.clone(),
        nodes,
        entry_nodes,
    };

    // ── Pass 4: validation ──

    if let Some(err) = verify(&ir, doc.allow_endless).into_iter().next() {
        return Err(err);
    }

    Ok(ir)
}

/// True iff the node has no outgoing path under every branch/loop choice.
fn is_terminal(node: &IrNode) -> bool {
    if !node.dependents.is_empty() {
        return false;
    }
    if let Some(br) = &node.branch {
        let branch_routes = br.rules.iter().any(|r| !r.next_nodes.is_empty())
            || !br.default.is_empty()
            || !br.available_next_nodes.is_empty();
        if br.enabled && branch_routes {
            return false;
        }
    }
    if let Some(lp) = &node.loop_block {
        if lp.enabled && (!lp.break_path.is_empty() || !lp.timeout_path.is_empty()) {
            return false;
        }
    }
    true
}

/// Remove `parallel`-typed gateways, wiring each predecessor directly to
/// each successor. Conditions on the incoming edge carry over.
fn elide_parallel(
    doc: &WorkflowDocument,
    specs: &HashMap<&str, &NodeSpec>,
) -> Vec<(String, String, Option<Condition>)> {
    let mut edges: Vec<(String, String, Option<Condition>)> = doc
        .edges
        .iter()
        .map(|e| (e.from.clone(), e.to.clone(), e.condition.clone()))
        .collect();

    let parallels: Vec<&str> = doc
        .nodes
        .iter()
        .filter(|n| n.node_type == "parallel")
        .map(|n| n.id.as_str())
        .collect();

    for gateway in parallels {
        debug_assert!(specs.contains_key(gateway));
        let incoming: Vec<_> = edges
            .iter()
            .filter(|(_, to, _)| to == gateway)
            .cloned()
            .collect();
        let outgoing: Vec<_> = edges
            .iter()
            .filter(|(from, _, _)| from == gateway)
            .cloned()
            .collect();
        edges.retain(|(from, to, _)| from != gateway && to != gateway);
        for (from, _, cond) in &incoming {
            for (_, to, _) in &outgoing {
                edges.push((from.clone(), to.clone(), cond.clone()));
            }
        }
    }
    edges
}

fn synthesize_branch(
    spec: &NodeSpec,
    edges: &[(String, String, Option<Condition>)],
) -> Result<Option<BranchBlock>, CompileError> {
    if let Some(declared) = &spec.branch {
        return Ok(Some(BranchBlock {
            enabled: true,
            kind: declared.kind.clone(),
            rules: declared
                .rules
                .iter()
                .map(|r| BranchRule {
                    condition: r.condition.clone(),
                    next_nodes: r.next_nodes.clone(),
                })
                .collect(),
            default: declared.default.clone(),
            available_next_nodes: declared.available_next_nodes.clone(),
        }));
    }

    if spec.node_type != "conditional" {
        return Ok(None);
    }

    // Conditional node: each conditioned outgoing edge becomes a rule, in
    // document order; edges without a condition collect into the default.
    let mut rules = Vec::new();
    let mut default = Vec::new();
    for (from, to, cond) in edges {
        if from != &spec.id {
            continue;
        }
        match cond {
            Some(condition) => rules.push(BranchRule {
                condition: condition.clone(),
                next_nodes: vec![to.clone()],
            }),
            None => default.push(to.clone()),
        }
    }
    if rules.is_empty() && default.is_empty() {
        return Err(CompileError::InvalidBranch {
            node: spec.id.clone(),
            reason: "conditional node has no outgoing edges".into(),
        });
    }
    Ok(Some(BranchBlock {
        enabled: true,
        kind: BranchKind::Conditional,
        rules,
        default,
        available_next_nodes: vec![],
    }))
}

fn synthesize_loop(spec: &NodeSpec) -> Result<Option<LoopBlock>, CompileError> {
    match (&spec.loop_spec, spec.node_type.as_str()) {
        (Some(lp), _) => Ok(Some(LoopBlock {
            enabled: true,
            condition: lp.condition.clone(),
            max_iterations: lp.max_iterations,
            loop_back_to: lp.loop_back_to.clone(),
            break_path: lp.break_path.clone(),
            timeout_path: lp.timeout_path.clone(),
        })),
        (None, "loop") => Err(CompileError::InvalidLoop {
            node: spec.id.clone(),
            reason: "loop-typed node declares no loop block".into(),
        }),
        (None, _) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlobStore;
    use serde_json::json;

    async fn compile_json(doc: serde_json::Value) -> Result<WorkflowIr, CompileError> {
        let doc: WorkflowDocument = serde_json::from_value(doc).unwrap();
        let blob = MemoryBlobStore::new();
        compile(&doc, &blob).await
    }

    #[tokio::test]
    async fn chain_compiles_with_adjacency_and_terminals() {
        let ir = compile_json(json!({
            "id": "chain",
            "nodes": [{"id": "a"}, {"id": "b", "type": "http"}, {"id": "c"}],
            "edges": [{"from": "a", "to": "b"}, {"from": "b", "to": "c"}]
        }))
        .await
        .unwrap();

        assert_eq!(ir.entry_nodes, vec!["a"]);
        let b = ir.node("b").unwrap();
        assert_eq!(b.kind, NodeKind::Task);
        assert_eq!(b.source_type, "http");
        assert!(b.dependencies.contains("a"));
        assert!(b.dependents.contains("c"));
        assert!(!b.is_terminal);
        assert!(ir.node("c").unwrap().is_terminal);
    }

    #[tokio::test]
    async fn dependency_consistency_holds() {
        let ir = compile_json(json!({
            "id": "fan",
            "nodes": [{"id": "a"}, {"id": "b"}, {"id": "c"}, {"id": "d"}],
            "edges": [
                {"from": "a", "to": "b"}, {"from": "a", "to": "c"},
                {"from": "b", "to": "d"}, {"from": "c", "to": "d"}
            ]
        }))
        .await
        .unwrap();

        for node in ir.nodes.values() {
            for dep in &node.dependents {
                assert!(ir.node(dep).unwrap().dependencies.contains(&node.id));
            }
            for dep in &node.dependencies {
                assert!(ir.node(dep).unwrap().dependents.contains(&node.id));
            }
        }
        assert!(ir.node("d").unwrap().is_join());
    }

    #[tokio::test]
    async fn conditional_node_synthesizes_branch_from_edges() {
        let ir = compile_json(json!({
            "id": "scorer",
            "nodes": [{"id": "score", "type": "conditional"}, {"id": "high"}, {"id": "low"}],
            "edges": [
                {"from": "score", "to": "high",
                 "condition": {"kind": "expression", "expr": "output.score >= 80"}},
                {"from": "score", "to": "low"}
            ]
        }))
        .await
        .unwrap();

        let score = ir.node("score").unwrap();
        assert_eq!(score.kind, NodeKind::Task);
        let branch = score.branch.as_ref().unwrap();
        assert_eq!(branch.kind, BranchKind::Conditional);
        assert_eq!(branch.rules.len(), 1);
        assert_eq!(branch.rules[0].next_nodes, vec!["high"]);
        assert_eq!(branch.default, vec!["low"]);
        assert!(!score.is_terminal);
        assert!(ir.node("high").unwrap().dependencies.contains("score"));
    }

    #[tokio::test]
    async fn loop_node_synthesizes_block_and_drops_back_edge() {
        let ir = compile_json(json!({
            "id": "retry",
            "nodes": [
                {"id": "call", "type": "loop", "loop": {
                    "condition": {"kind": "expression", "expr": "output.status != 200"},
                    "max_iterations": 3,
                    "loop_back_to": "call",
                    "break_path": ["ok"],
                    "timeout_path": ["bad"]
                }},
                {"id": "ok"}, {"id": "bad"}
            ],
            "edges": []
        }))
        .await
        .unwrap();

        let call = ir.node("call").unwrap();
        let lp = call.loop_block.as_ref().unwrap();
        assert_eq!(lp.max_iterations, 3);
        assert_eq!(lp.loop_back_to, "call");
        // loop-back never appears in the static graph
        assert!(!call.dependents.contains("call"));
        assert!(!call.dependencies.contains("call"));
        // break/timeout paths are static adjacency
        assert!(call.dependents.contains("ok"));
        assert!(call.dependents.contains("bad"));
        assert_eq!(ir.entry_nodes, vec!["call"]);
        assert!(ir.node("ok").unwrap().is_terminal);
        assert!(!call.is_terminal);
    }

    #[tokio::test]
    async fn parallel_gateway_is_elided() {
        let ir = compile_json(json!({
            "id": "par",
            "nodes": [
                {"id": "a"}, {"id": "fan", "type": "parallel"},
                {"id": "b"}, {"id": "c"}
            ],
            "edges": [
                {"from": "a", "to": "fan"},
                {"from": "fan", "to": "b"},
                {"from": "fan", "to": "c"}
            ]
        }))
        .await
        .unwrap();

        assert!(ir.node("fan").is_none());
        let a = ir.node("a").unwrap();
        assert!(a.dependents.contains("b"));
        assert!(a.dependents.contains("c"));
    }

    #[tokio::test]
    async fn configs_are_stored_content_addressed() {
        let doc: WorkflowDocument = serde_json::from_value(json!({
            "id": "cfg",
            "nodes": [
                {"id": "a", "config": {"url": "https://example"}},
                {"id": "b"}
            ],
            "edges": [{"from": "a", "to": "b"}]
        }))
        .unwrap();
        let blob = MemoryBlobStore::new();
        let ir = compile(&doc, &blob).await.unwrap();

        let config_ref = ir.node("a").unwrap().config_ref.clone().unwrap();
        let stored: serde_json::Value = crate::blob::get_json(&blob, &config_ref).await.unwrap();
        assert_eq!(stored, json!({"url": "https://example"}));
        assert!(ir.node("b").unwrap().config_ref.is_none());
    }

    #[tokio::test]
    async fn compile_round_trips_through_serde() {
        let doc = json!({
            "id": "rt",
            "nodes": [
                {"id": "score", "type": "conditional"},
                {"id": "high"}, {"id": "low"}
            ],
            "edges": [
                {"from": "score", "to": "high",
                 "condition": {"kind": "expression", "expr": "output.score >= 80"}},
                {"from": "score", "to": "low"}
            ]
        });
        let ir = compile_json(doc).await.unwrap();
        let json = serde_json::to_value(&ir).unwrap();
        let back: WorkflowIr = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(serde_json::to_value(&back).unwrap(), json);
    }

    #[tokio::test]
    async fn rejects_unknown_edge_endpoints() {
        let err = compile_json(json!({
            "id": "bad",
            "nodes": [{"id": "a"}],
            "edges": [{"from": "a", "to": "ghost"}]
        }))
        .await
        .unwrap_err();
        assert!(matches!(err, CompileError::EdgeToUnknownNode { .. }));
    }

    #[tokio::test]
    async fn rejects_duplicate_node_ids() {
        let err = compile_json(json!({
            "id": "dup",
            "nodes": [{"id": "a"}, {"id": "a"}],
            "edges": []
        }))
        .await
        .unwrap_err();
        assert!(matches!(err, CompileError::DuplicateNode { .. }));
    }

    #[tokio::test]
    async fn rejects_static_cycle_without_loop() {
        let err = compile_json(json!({
            "id": "cyc",
            "nodes": [{"id": "a"}, {"id": "b"}],
            "edges": [{"from": "a", "to": "b"}, {"from": "b", "to": "a"}]
        }))
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::CyclicWithoutLoop { .. } | CompileError::NoEntryNodes
        ));
    }
}
