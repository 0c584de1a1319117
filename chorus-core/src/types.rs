use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Content-addressed blob reference (SHA-256 hex of the stored bytes).
pub type BlobRef = String;

/// Current wall clock as epoch milliseconds.
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

// ─── Run ──────────────────────────────────────────────────────

/// Lifecycle status of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl RunStatus {
    /// True if no further progress is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed { .. } | RunStatus::Cancelled
        )
    }
}

/// A single execution instance of a workflow.
///
/// The compiled graph currently in effect lives in the key-value store under
/// the run id; `base_artifact` points at the frozen submission-time document
/// and never changes, while `patch_seq` tracks how many patch sets have been
/// folded on top of it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    /// Frozen base workflow document in the blob store.
    pub base_artifact: BlobRef,
    /// Human-readable pointers captured at submission time.
    pub tags_snapshot: BTreeMap<String, String>,
    pub status: RunStatus,
    pub submitted_by: String,
    pub created_at: Timestamp,
    /// Bumped by the Coordinator on every processed signal; the timeout
    /// detector flags runs whose value falls behind the stall threshold.
    pub last_event_at: Timestamp,
    /// Wall-clock deadline for the whole run, if configured.
    pub deadline_at: Option<Timestamp>,
    /// Sequence number of the latest applied patch set (0 = unpatched).
    pub patch_seq: u32,
}

// ─── Token (the unit of work on the wire) ─────────────────────

/// A unit of work in flight, targeted at one node.
///
/// Published to the per-type work streams; the format is a stable contract
/// with workers. `config`, when present, is the fully resolved configuration
/// map — workers never touch the context store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Empty for seed tokens. Used for join tracking and observability.
    #[serde(default)]
    pub from_node: String,
    pub to_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_ref: Option<BlobRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default)]
    pub hop: u32,
    pub created_at: Timestamp,
}

// ─── Completion signal ────────────────────────────────────────

/// Worker-reported outcome of one token's execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Completed,
    Failed,
    Skipped,
}

/// A worker's statement that a node's execution finished.
///
/// `metadata` is opaque to the transport. Workers are expected to echo the
/// token's `from_node` under the `"from_node"` key; agent workers routing a
/// branch put their chosen `"next_nodes"` list there as well.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionSignal {
    #[serde(default = "signal_version")]
    pub version: String,
    /// Unique per execution attempt; the idempotency scope of the consume.
    pub job_id: String,
    pub run_id: Uuid,
    pub node_id: String,
    pub status: SignalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<BlobRef>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

fn signal_version() -> String {
    "1.0".to_string()
}

impl CompletionSignal {
    /// The echoed `from_node`, or `""` when the worker did not echo it.
    pub fn from_node(&self) -> &str {
        self.metadata
            .get("from_node")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Agent-chosen downstream nodes, when present in the metadata.
    pub fn next_nodes(&self) -> Option<Vec<String>> {
        let list = self.metadata.get("next_nodes")?.as_array()?;
        Some(
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        )
    }
}

// ─── Per-run hot state records ────────────────────────────────

/// One node's recorded outcome in the per-run context hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<BlobRef>,
    pub status: SignalStatus,
    pub recorded_at: Timestamp,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Per (run, node) loop bookkeeping; deleted when the loop exits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopState {
    pub current_iteration: u32,
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output_ref: Option<BlobRef>,
}

/// Result of one `apply_delta` invocation against the key-value store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub counter: i64,
    /// False when the op key had already been applied (duplicate delivery).
    pub changed: bool,
    /// True when this application crossed the counter to zero via a consume.
    pub hit_zero: bool,
}

// ─── Patch audit record ───────────────────────────────────────

/// One applied patch set. A run's current document is the base artifact
/// materialized with all records where `seq <= latest`, in seq order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchRecord {
    pub run_id: Uuid,
    pub seq: u32,
    /// JSON-Patch operation list over the workflow document.
    pub operations: Value,
    pub description: String,
    pub actor: String,
    pub created_at: Timestamp,
}

// ─── Counter op keys ──────────────────────────────────────────

/// Op key for consuming one token: `consume:{from}->{node}:{job_id}`.
///
/// The edge-qualified form distinguishes per-edge contributions into a join,
/// so deferred join consumes and the immediate path share one key per token.
pub fn consume_key(from: &str, node: &str, job_id: &str) -> String {
    format!("consume:{from}->{node}:{job_id}")
}

/// Op key for one emit batch: `emit:{job_id}`.
pub fn emit_key(job_id: &str) -> String {
    format!("emit:{job_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_round_trip_defaults() {
        let raw = r#"{
            "job_id": "job-1",
            "run_id": "018f4d7e-0000-7000-8000-000000000000",
            "node_id": "fetch",
            "status": "completed"
        }"#;
        let sig: CompletionSignal = serde_json::from_str(raw).unwrap();
        assert_eq!(sig.version, "1.0");
        assert_eq!(sig.from_node(), "");
        assert!(sig.next_nodes().is_none());
        assert!(sig.result_ref.is_none());
    }

    #[test]
    fn signal_metadata_accessors() {
        let mut sig: CompletionSignal = serde_json::from_str(
            r#"{"job_id":"j","run_id":"018f4d7e-0000-7000-8000-000000000000",
                "node_id":"route","status":"completed"}"#,
        )
        .unwrap();
        sig.metadata
            .insert("from_node".into(), Value::String("a".into()));
        sig.metadata
            .insert("next_nodes".into(), serde_json::json!(["b", "c"]));
        assert_eq!(sig.from_node(), "a");
        assert_eq!(sig.next_nodes().unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn op_keys_distinguish_edges() {
        let k1 = consume_key("a", "join", "job-1");
        let k2 = consume_key("b", "join", "job-2");
        assert_ne!(k1, k2);
        assert_eq!(k1, "consume:a->join:job-1");
        assert_eq!(emit_key("job-1"), "emit:job-1");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Failed {
            reason: "timeout".into()
        }
        .is_terminal());
    }
}
