use crate::compiler::ir::BranchKind;
use crate::condition::Condition;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── User-facing workflow document ────────────────────────────

/// The document authors submit and patches mutate. Node list plus edge
/// list; conditional routing may be declared either as per-edge conditions
/// on a `conditional`-typed node or as an explicit `branch` block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDocument {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Opt-out of the entry/terminal existence checks for deliberately
    /// endless workflows.
    #[serde(default)]
    pub allow_endless: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type", default = "default_node_type")]
    pub node_type: String,
    /// Schemaless worker configuration; stored content-addressed at compile
    /// time, the IR carries only the ref.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchSpec>,
}

fn default_node_type() -> String {
    "task".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopSpec {
    pub condition: Condition,
    pub max_iterations: u32,
    pub loop_back_to: String,
    #[serde(default)]
    pub break_path: Vec<String>,
    #[serde(default)]
    pub timeout_path: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchSpec {
    #[serde(rename = "type", default = "default_branch_kind")]
    pub kind: BranchKind,
    #[serde(default)]
    pub rules: Vec<BranchRuleSpec>,
    #[serde(default)]
    pub default: Vec<String>,
    #[serde(default)]
    pub available_next_nodes: Vec<String>,
}

fn default_branch_kind() -> BranchKind {
    BranchKind::Conditional
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchRuleSpec {
    pub condition: Condition,
    pub next_nodes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_parses_with_defaults() {
        let doc: WorkflowDocument = serde_json::from_value(json!({
            "id": "wf-1",
            "nodes": [
                {"id": "a"},
                {"id": "b", "type": "http", "config": {"url": "https://x"}}
            ],
            "edges": [{"from": "a", "to": "b"}]
        }))
        .unwrap();
        assert_eq!(doc.nodes[0].node_type, "task");
        assert_eq!(doc.nodes[1].node_type, "http");
        assert!(doc.edges[0].condition.is_none());
        assert!(!doc.allow_endless);
    }

    #[test]
    fn loop_spec_parses() {
        let node: NodeSpec = serde_json::from_value(json!({
            "id": "call",
            "type": "loop",
            "loop": {
                "condition": {"kind": "expression", "expr": "output.status != 200"},
                "max_iterations": 3,
                "loop_back_to": "call",
                "break_path": ["ok"],
                "timeout_path": ["bad"]
            }
        }))
        .unwrap();
        let spec = node.loop_spec.unwrap();
        assert_eq!(spec.max_iterations, 3);
        assert_eq!(spec.break_path, vec!["ok"]);
    }
}
