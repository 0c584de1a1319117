use crate::bus::EventBus;
use crate::kv::KvStore;
use crate::types::DeltaOutcome;
use anyhow::Result;
use std::sync::Arc;
use uuid::Uuid;

/// The atomic delta applier: one scripted key-value operation that records
/// an idempotency key and adjusts the per-run counter, plus the zero-event
/// publish on the crossing consume.
///
/// Correctness never depends on the publish — terminal-node checks also
/// fire completion — so a lost event only delays the supervisor.
#[derive(Clone)]
pub struct DeltaApplier {
    kv: Arc<dyn KvStore>,
    bus: Arc<dyn EventBus>,
}

impl DeltaApplier {
    pub fn new(kv: Arc<dyn KvStore>, bus: Arc<dyn EventBus>) -> Self {
        Self { kv, bus }
    }

    pub async fn apply(&self, run_id: Uuid, op_key: &str, delta: i64) -> Result<DeltaOutcome> {
        let outcome = self.kv.apply_delta(run_id, op_key, delta).await?;
        if outcome.hit_zero {
            self.bus.publish_completion_event(run_id).await?;
        }
        Ok(outcome)
    }
}
