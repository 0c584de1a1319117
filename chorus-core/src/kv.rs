use crate::compiler::ir::WorkflowIr;
use crate::types::{ContextEntry, DeltaOutcome, LoopState};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Key-value store for per-run hot state.
///
/// Keys (informative; backends may map them however they like):
///   counter:{run_id}              signed integer
///   applied:{run_id}              set of op keys
///   ir:{run_id}                   JSON-encoded IR
///   context:{run_id}              hash node_id -> ContextEntry
///   pending_tokens:{run_id}:{n}   set of join members
///   pending_approvals:{run_id}    set of hold ids
///   loop:{run_id}:{n}             LoopState
///   cancelled:{run_id}            flag
///
/// `apply_delta` MUST be a single atomic step on the backend (a server-side
/// script on Redis). Emulating it client-side with compare-and-swap would
/// break the idempotency invariant under contention, so no such fallback is
/// offered.
#[async_trait]
pub trait KvStore: Send + Sync {
    // ── Counter + applied set (the linearization point) ──

    /// Record `op_key` in the per-run applied set and adjust the counter by
    /// `delta`, atomically. A key seen before leaves the counter untouched
    /// and returns `changed == false`. `hit_zero` is true only when this
    /// application crossed the counter to zero via a negative delta.
    async fn apply_delta(&self, run_id: Uuid, op_key: &str, delta: i64) -> Result<DeltaOutcome>;

    /// Read-only membership test on the applied set. The Coordinator uses
    /// it to recognize redeliveries whose consume was applied by a join
    /// release rather than by their own handler.
    async fn is_applied(&self, run_id: Uuid, op_key: &str) -> Result<bool>;

    /// Seed the counter (number of entry-node tokens at submission).
    async fn init_counter(&self, run_id: Uuid, value: i64) -> Result<()>;

    async fn get_counter(&self, run_id: Uuid) -> Result<i64>;

    /// All op keys applied so far. Divergence recovery and invariant checks
    /// only — never on the hot path.
    async fn applied_members(&self, run_id: Uuid) -> Result<Vec<String>>;

    // ── IR pointer ──

    /// Swap the run's effective IR in a single write. Readers observe the
    /// pre- or post-swap graph, never a partial one.
    async fn store_ir(&self, run_id: Uuid, ir: &WorkflowIr) -> Result<()>;
    async fn load_ir(&self, run_id: Uuid) -> Result<Option<WorkflowIr>>;

    // ── Context (append-only until cleanup) ──

    async fn store_context(&self, run_id: Uuid, node_id: &str, entry: &ContextEntry) -> Result<()>;
    async fn load_context(&self, run_id: Uuid) -> Result<BTreeMap<String, ContextEntry>>;

    // ── Pending-join sets ──

    /// Add a member to the join set for `node_id`; returns the member list
    /// after insertion. Members encode `{from}|{node}|{job_id}`.
    async fn join_arrive(&self, run_id: Uuid, node_id: &str, member: &str) -> Result<Vec<String>>;
    async fn join_clear(&self, run_id: Uuid, node_id: &str) -> Result<()>;
    /// True if any join set for the run still has members.
    async fn join_any_pending(&self, run_id: Uuid) -> Result<bool>;

    // ── Pending approvals (HITL holds) ──

    async fn approval_add(&self, run_id: Uuid, hold_id: &str) -> Result<()>;
    async fn approval_remove(&self, run_id: Uuid, hold_id: &str) -> Result<()>;
    async fn approval_count(&self, run_id: Uuid) -> Result<usize>;

    // ── Loop state ──

    async fn store_loop(&self, run_id: Uuid, node_id: &str, state: &LoopState) -> Result<()>;
    async fn load_loop(&self, run_id: Uuid, node_id: &str) -> Result<Option<LoopState>>;
    async fn delete_loop(&self, run_id: Uuid, node_id: &str) -> Result<()>;

    // ── Cancellation flag ──

    async fn mark_cancelled(&self, run_id: Uuid) -> Result<()>;
    async fn is_cancelled(&self, run_id: Uuid) -> Result<bool>;

    // ── Cleanup ──

    /// Delete every hot-state key for the run (counter, applied, ir,
    /// context, joins, approvals, loops, cancellation flag).
    async fn delete_run_state(&self, run_id: Uuid) -> Result<()>;
}

/// Encode a pending-join member.
pub fn join_member(from: &str, node: &str, job_id: &str) -> String {
    format!("{from}|{node}|{job_id}")
}

/// Decode a pending-join member into (from, node, job_id).
pub fn parse_join_member(member: &str) -> Option<(&str, &str, &str)> {
    let mut parts = member.splitn(3, '|');
    Some((parts.next()?, parts.next()?, parts.next()?))
}
