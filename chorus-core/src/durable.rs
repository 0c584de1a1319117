use crate::events::RunEvent;
use crate::types::{PatchRecord, Run, RunStatus, Timestamp};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Long-lived relational store: run rows, patch audit chain, and the
/// append-only event log the replayer folds.
#[async_trait]
pub trait DurableStore: Send + Sync {
    // ── Runs ──

    async fn insert_run(&self, run: &Run) -> Result<()>;
    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>>;
    async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<()>;

    /// Bump `last_event_at`; called by the Coordinator on every processed
    /// signal so the timeout detector can spot stalls.
    async fn touch_run(&self, run_id: Uuid, at: Timestamp) -> Result<()>;

    /// Bump the run row's latest patch seq.
    async fn set_patch_seq(&self, run_id: Uuid, seq: u32) -> Result<()>;

    /// Swap the frozen base artifact (patch compaction only).
    async fn set_base_artifact(&self, run_id: Uuid, artifact: &str) -> Result<()>;

    /// RUNNING runs whose `last_event_at` is older than `cutoff`, or whose
    /// own deadline has passed.
    async fn list_stalled(&self, cutoff: Timestamp, now: Timestamp) -> Result<Vec<Run>>;

    // ── Patch chain ──

    async fn append_patch(&self, record: &PatchRecord) -> Result<()>;
    /// All patch records for the run in seq order.
    async fn load_patches(&self, run_id: Uuid) -> Result<Vec<PatchRecord>>;
    /// Drop the chain (patch compaction only).
    async fn clear_patches(&self, run_id: Uuid) -> Result<()>;

    // ── Event log ──

    /// Append an event; returns its sequence number (1-based, per run).
    async fn append_event(&self, run_id: Uuid, event: &RunEvent) -> Result<u64>;
    async fn read_events(&self, run_id: Uuid, from_seq: u64) -> Result<Vec<(u64, RunEvent)>>;
}
