use crate::blob::{self, BlobStore};
use crate::bus::EventBus;
use crate::compiler::ir::WorkflowIr;
use crate::delta::DeltaApplier;
use crate::kv::KvStore;
use crate::types::{consume_key, emit_key, BlobRef, ContextEntry, DeltaOutcome, Token};
use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// State primitives over the delta applier and the external stores — the
/// narrow surface ingress endpoints and the Coordinator drive runs through.
#[derive(Clone)]
pub struct StateSdk {
    kv: Arc<dyn KvStore>,
    blob: Arc<dyn BlobStore>,
    bus: Arc<dyn EventBus>,
    delta: DeltaApplier,
}

impl StateSdk {
    pub fn new(kv: Arc<dyn KvStore>, blob: Arc<dyn BlobStore>, bus: Arc<dyn EventBus>) -> Self {
        let delta = DeltaApplier::new(kv.clone(), bus.clone());
        Self {
            kv,
            blob,
            bus,
            delta,
        }
    }

    pub fn delta(&self) -> &DeltaApplier {
        &self.delta
    }

    // ── Counter ──

    /// Consume one token: `ApplyDelta(run, consume:{from}->{node}:{job}, -1)`.
    pub async fn consume(
        &self,
        run_id: Uuid,
        from: &str,
        node: &str,
        job_id: &str,
    ) -> Result<DeltaOutcome> {
        self.consume_op(run_id, &consume_key(from, node, job_id))
            .await
    }

    /// Consume by explicit op key (deferred join members).
    pub async fn consume_op(&self, run_id: Uuid, op_key: &str) -> Result<DeltaOutcome> {
        self.delta.apply(run_id, op_key, -1).await
    }

    /// Publish one token per (stream, token) pair, then apply one emit
    /// delta of +N under `emit:{batch_id}`.
    ///
    /// Publishes happen first; a crash in between leaves stray tokens with
    /// an un-incremented counter, which the supervisors resolve.
    pub async fn emit(
        &self,
        run_id: Uuid,
        batch_id: &str,
        tokens: &[(String, Token)],
    ) -> Result<DeltaOutcome> {
        for (stream, token) in tokens {
            self.bus.publish_token(stream, token).await?;
        }
        self.delta
            .apply(run_id, &emit_key(batch_id), tokens.len() as i64)
            .await
    }

    pub async fn initialize_counter(&self, run_id: Uuid, value: i64) -> Result<()> {
        self.kv.init_counter(run_id, value).await
    }

    pub async fn get_counter(&self, run_id: Uuid) -> Result<i64> {
        self.kv.get_counter(run_id).await
    }

    // ── IR ──

    pub async fn store_ir(&self, run_id: Uuid, ir: &WorkflowIr) -> Result<()> {
        self.kv.store_ir(run_id, ir).await
    }

    pub async fn load_ir(&self, run_id: Uuid) -> Result<Option<WorkflowIr>> {
        self.kv.load_ir(run_id).await
    }

    // ── Context ──

    pub async fn store_context(
        &self,
        run_id: Uuid,
        node_id: &str,
        entry: &ContextEntry,
    ) -> Result<()> {
        self.kv.store_context(run_id, node_id, entry).await
    }

    pub async fn load_context(&self, run_id: Uuid) -> Result<BTreeMap<String, ContextEntry>> {
        self.kv.load_context(run_id).await
    }

    // ── Blob proxies ──

    pub async fn store_output(&self, output: &Value) -> Result<BlobRef> {
        blob::put_json(self.blob.as_ref(), output).await
    }

    pub async fn load_payload(&self, payload_ref: &BlobRef) -> Result<Value> {
        blob::get_json(self.blob.as_ref(), payload_ref).await
    }

    pub async fn load_config(&self, config_ref: &BlobRef) -> Result<Value> {
        blob::get_json(self.blob.as_ref(), config_ref).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::memory::{MemoryBlobStore, MemoryBus, MemoryKv};
    use crate::types::now_ms;

    fn sdk_with_bus() -> (StateSdk, Arc<MemoryBus>) {
        let bus = Arc::new(MemoryBus::new());
        let sdk = StateSdk::new(
            Arc::new(MemoryKv::new()),
            Arc::new(MemoryBlobStore::new()),
            bus.clone(),
        );
        (sdk, bus)
    }

    fn token(run_id: Uuid, to: &str) -> Token {
        Token {
            id: Uuid::now_v7(),
            run_id,
            from_node: "a".into(),
            to_node: to.into(),
            payload_ref: None,
            config: None,
            hop: 1,
            created_at: now_ms(),
        }
    }

    /// Emit publishes every token before the single +N delta.
    #[tokio::test]
    async fn emit_publishes_then_counts() {
        let (sdk, bus) = sdk_with_bus();
        let run = Uuid::now_v7();
        sdk.initialize_counter(run, 0).await.unwrap();

        let batch = vec![
            ("wf.tasks.task".to_string(), token(run, "b")),
            ("wf.tasks.task".to_string(), token(run, "c")),
        ];
        let out = sdk.emit(run, "job-1", &batch).await.unwrap();
        assert_eq!(out.counter, 2);
        assert_eq!(bus.stream_len("wf.tasks.task").await.unwrap(), 2);

        // Replaying the same batch id republishes but never double-counts.
        let again = sdk.emit(run, "job-1", &batch).await.unwrap();
        assert!(!again.changed);
        assert_eq!(again.counter, 2);
    }

    #[tokio::test]
    async fn consume_then_duplicate_consume() {
        let (sdk, _bus) = sdk_with_bus();
        let run = Uuid::now_v7();
        sdk.initialize_counter(run, 1).await.unwrap();

        let first = sdk.consume(run, "", "a", "job-1").await.unwrap();
        assert!(first.changed);
        assert!(first.hit_zero);

        let dup = sdk.consume(run, "", "a", "job-1").await.unwrap();
        assert!(!dup.changed);
        assert_eq!(dup.counter, 0);
    }

    #[tokio::test]
    async fn output_round_trip() {
        let (sdk, _bus) = sdk_with_bus();
        let output = serde_json::json!({"score": 95});
        let r = sdk.store_output(&output).await.unwrap();
        assert_eq!(sdk.load_payload(&r).await.unwrap(), output);
    }
}
