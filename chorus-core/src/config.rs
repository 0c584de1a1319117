use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Engine tunables. Loaded once at startup (env/file in the server binary)
/// and shared read-only by every component.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // ── Graph and patch caps ──
    /// Total nodes a materialized document may hold.
    pub max_nodes: usize,
    /// `agent`-typed nodes a materialized document may hold.
    pub max_agent_nodes: usize,
    /// Operations in a single patch set.
    pub max_patch_ops: usize,
    /// Patch-chain depth before compaction is required.
    pub max_patch_depth: u32,

    // ── Deadlines ──
    /// Per-hop budget for one signal handler, in milliseconds.
    pub hop_deadline_ms: u64,
    /// Wall-clock budget for a whole run, in milliseconds.
    pub run_deadline_ms: Option<i64>,

    // ── Consumer loop ──
    /// Blocking-pop timeout on the signals queue, in milliseconds.
    pub signal_pop_timeout_ms: u64,
    /// Concurrent signal handlers per Coordinator instance.
    pub handler_concurrency: usize,

    // ── Backpressure ──
    /// Stream depth that starts throttling emits.
    pub backpressure_soft: usize,
    /// Stream depth that fails the run.
    pub backpressure_hard: usize,
    /// Sleep between publishes while throttled, in milliseconds.
    pub backpressure_pause_ms: u64,

    // ── Supervisors ──
    /// Timeout-detector sweep period, in milliseconds.
    pub sweep_period_ms: u64,
    /// A RUNNING run with no events for this long is stalled.
    pub stall_threshold_ms: i64,

    // ── Routing ──
    /// source_type -> stream overrides; the registration hook for new node
    /// types. Unmatched unknown types route to the default stream.
    pub stream_overrides: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_nodes: 500,
            max_agent_nodes: 32,
            max_patch_ops: 64,
            max_patch_depth: 16,
            hop_deadline_ms: 30_000,
            run_deadline_ms: Some(24 * 60 * 60 * 1000),
            signal_pop_timeout_ms: 1_000,
            handler_concurrency: 64,
            backpressure_soft: 1_000,
            backpressure_hard: 10_000,
            backpressure_pause_ms: 50,
            sweep_period_ms: 5_000,
            stall_threshold_ms: 60_000,
            stream_overrides: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn hop_deadline(&self) -> Duration {
        Duration::from_millis(self.hop_deadline_ms)
    }

    pub fn signal_pop_timeout(&self) -> Duration {
        Duration::from_millis(self.signal_pop_timeout_ms)
    }

    pub fn backpressure_pause(&self) -> Duration {
        Duration::from_millis(self.backpressure_pause_ms)
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.sweep_period_ms)
    }
}
