use crate::condition::Condition;
use crate::types::BlobRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ─── Node kind ────────────────────────────────────────────────

/// Tagged sum over the node families the runtime routes on.
///
/// Transport-specific source types (`http`, `function`, `transform`, ...)
/// normalize to `Task` during lowering; the original tag survives on the
/// node as `source_type`. Unknown kinds stay string-tagged for forward
/// compatibility and route through the skipped-node handler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Task,
    Agent,
    Human,
    #[serde(untagged)]
    Other(String),
}

impl NodeKind {
    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::Task => "task",
            NodeKind::Agent => "agent",
            NodeKind::Human => "human",
            NodeKind::Other(s) => s,
        }
    }
}

// ─── Branch block ─────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    Conditional,
    AgentDriven,
}

/// One ordered rule of a conditional branch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchRule {
    pub condition: Condition,
    pub next_nodes: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchBlock {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: BranchKind,
    #[serde(default)]
    pub rules: Vec<BranchRule>,
    /// Taken when no rule matches (or an agent proposal is rejected).
    #[serde(default)]
    pub default: Vec<String>,
    /// Allow-list for agent-driven routing. Proposals outside it are
    /// rejected and fall back to `default`.
    #[serde(default)]
    pub available_next_nodes: Vec<String>,
}

// ─── Loop block ───────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopBlock {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Loop continues while this holds (and iterations remain).
    pub condition: Condition,
    pub max_iterations: u32,
    pub loop_back_to: String,
    /// Taken when the condition turns false.
    #[serde(default)]
    pub break_path: Vec<String>,
    /// Taken when `max_iterations` is exhausted.
    #[serde(default)]
    pub timeout_path: Vec<String>,
}

fn default_true() -> bool {
    true
}

// ─── IR node ──────────────────────────────────────────────────

/// One entry in the compiled graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IrNode {
    pub id: String,
    pub kind: NodeKind,
    /// The type tag the document declared, before normalization. Drives
    /// stream selection overrides.
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<BlobRef>,
    /// Nodes this one waits on.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Nodes this one feeds when it completes statically.
    #[serde(default)]
    pub dependents: BTreeSet<String>,
    /// Precomputed: no outgoing path under any branch/loop choice.
    pub is_terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchBlock>,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_block: Option<LoopBlock>,
}

impl IrNode {
    /// Join nodes gate consumption until every dependency has sent.
    pub fn is_join(&self) -> bool {
        self.dependencies.len() >= 2
    }
}

// ─── Workflow IR ──────────────────────────────────────────────

/// The compiled, normalized graph the Coordinator executes.
///
/// Serde round-trippable by construction: the Coordinator reloads it from
/// the key-value store on every completion, and the patch engine swaps it
/// wholesale.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowIr {
    pub workflow_id: String,
    pub nodes: BTreeMap<String, IrNode>,
    /// Nodes with no dependencies; each receives a seed token at submit.
    pub entry_nodes: Vec<String>,
}

impl WorkflowIr {
    pub fn node(&self, id: &str) -> Option<&IrNode> {
        self.nodes.get(id)
    }

    /// Terminal nodes under every declared branch/loop choice.
    pub fn terminal_nodes(&self) -> impl Iterator<Item = &IrNode> {
        self.nodes.values().filter(|n| n.is_terminal)
    }
}
