use crate::types::{BlobRef, SignalStatus, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run events — the durable audit trail for every run.
///
/// Four variants carry replayable state effects (`TokenConsumed`,
/// `TokensEmitted`, `ApprovalCreated`, `ApprovalDecided`); the replayer folds
/// exactly those. Everything else is observability.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunSubmitted {
        run_id: Uuid,
        base_artifact: BlobRef,
        entry_nodes: Vec<String>,
    },
    /// Counter −1; op key folded into the applied set.
    #[serde(rename = "node.consumed")]
    TokenConsumed {
        op_key: String,
        node_id: String,
        job_id: String,
    },
    /// Counter +|to_nodes|; op key folded into the applied set; when
    /// `output_ref` is set the emitting node's output lands in context.
    #[serde(rename = "node.emitted")]
    TokensEmitted {
        op_key: String,
        from_node: String,
        to_nodes: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_ref: Option<BlobRef>,
    },
    NodeRecorded {
        node_id: String,
        status: SignalStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_ref: Option<BlobRef>,
    },
    /// A node was auto-completed by the Coordinator (unknown type, removed
    /// by a patch, or worker-reported `skipped`).
    NodeSkipped {
        node_id: String,
        reason: String,
    },
    JoinArrived {
        node_id: String,
        from_node: String,
        pending: usize,
        expected: usize,
    },
    JoinReleased {
        node_id: String,
        members: Vec<String>,
    },
    BranchTaken {
        node_id: String,
        rule_index: Option<usize>,
        next_nodes: Vec<String>,
    },
    /// An agent worker proposed routes outside its allow-list.
    AgentRouteRejected {
        node_id: String,
        proposed: Vec<String>,
        allowed: Vec<String>,
    },
    LoopIteration {
        node_id: String,
        iteration: u32,
        max_iterations: u32,
    },
    LoopExited {
        node_id: String,
        /// "break" or "timeout".
        via: String,
        next_nodes: Vec<String>,
    },
    ConditionErrored {
        node_id: String,
        detail: String,
    },
    ResolveFailed {
        node_id: String,
        reference: String,
    },
    #[serde(rename = "approval.created")]
    ApprovalCreated {
        node_id: String,
        hold_id: String,
    },
    #[serde(rename = "approval.decided")]
    ApprovalDecided {
        node_id: String,
        hold_id: String,
        /// Emits that followed the decision, for replay.
        #[serde(default)]
        follow_up_emits: Vec<String>,
    },
    PatchApplied {
        seq: u32,
        op_count: usize,
        description: String,
        actor: String,
    },
    PatchCompacted {
        new_base: BlobRef,
        folded_seq: u32,
    },
    NodeReplayed {
        node_id: String,
        job_id: String,
        counter_reset: bool,
    },
    BackpressureThrottled {
        stream: String,
        depth: usize,
    },
    SignalIgnored {
        signal_desc: String,
    },
    RunCompleted {
        at: Timestamp,
    },
    RunFailed {
        reason: String,
        at: Timestamp,
    },
    RunCancelled {
        reason: String,
        at: Timestamp,
    },
}

impl RunEvent {
    /// Short tag for logs and the durable store's event_type column.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::RunSubmitted { .. } => "run.submitted",
            RunEvent::TokenConsumed { .. } => "node.consumed",
            RunEvent::TokensEmitted { .. } => "node.emitted",
            RunEvent::NodeRecorded { .. } => "node.recorded",
            RunEvent::NodeSkipped { .. } => "node.skipped",
            RunEvent::JoinArrived { .. } => "join.arrived",
            RunEvent::JoinReleased { .. } => "join.released",
            RunEvent::BranchTaken { .. } => "branch.taken",
            RunEvent::AgentRouteRejected { .. } => "branch.agent_rejected",
            RunEvent::LoopIteration { .. } => "loop.iteration",
            RunEvent::LoopExited { .. } => "loop.exited",
            RunEvent::ConditionErrored { .. } => "condition.errored",
            RunEvent::ResolveFailed { .. } => "resolve.failed",
            RunEvent::ApprovalCreated { .. } => "approval.created",
            RunEvent::ApprovalDecided { .. } => "approval.decided",
            RunEvent::PatchApplied { .. } => "patch.applied",
            RunEvent::PatchCompacted { .. } => "patch.compacted",
            RunEvent::NodeReplayed { .. } => "node.replayed",
            RunEvent::BackpressureThrottled { .. } => "backpressure.throttled",
            RunEvent::SignalIgnored { .. } => "signal.ignored",
            RunEvent::RunCompleted { .. } => "run.completed",
            RunEvent::RunFailed { .. } => "run.failed",
            RunEvent::RunCancelled { .. } => "run.cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_variants_use_wire_names() {
        let ev = RunEvent::TokenConsumed {
            op_key: "consume:a->b:j1".into(),
            node_id: "b".into(),
            job_id: "j1".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "node.consumed");

        let ev = RunEvent::TokensEmitted {
            op_key: "emit:j1".into(),
            from_node: "b".into(),
            to_nodes: vec!["c".into(), "d".into()],
            output_ref: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "node.emitted");
        assert_eq!(ev.kind(), "node.emitted");
    }

    #[test]
    fn event_round_trip() {
        let ev = RunEvent::BranchTaken {
            node_id: "score".into(),
            rule_index: Some(0),
            next_nodes: vec!["high".into()],
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: RunEvent = serde_json::from_str(&json).unwrap();
        match back {
            RunEvent::BranchTaken {
                rule_index,
                next_nodes,
                ..
            } => {
                assert_eq!(rule_index, Some(0));
                assert_eq!(next_nodes, vec!["high"]);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
