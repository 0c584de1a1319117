use crate::blob::{self, BlobStore};
use crate::bus::EventBus;
use crate::compiler::ir::WorkflowIr;
use crate::compiler::lower::compile;
use crate::config::EngineConfig;
use crate::coordinator::stream_for_node;
use crate::durable::DurableStore;
use crate::events::RunEvent;
use crate::kv::KvStore;
use crate::patch::materialize;
use crate::replay::Replayer;
use crate::sdk::StateSdk;
use crate::types::{now_ms, RunStatus, Token};
use anyhow::anyhow;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum NodeReplayError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),
    #[error("run is {status:?}; pass force_replay to inject anyway")]
    RunNotFailed { status: RunStatus },
    #[error("node '{node}' does not exist in the run's current IR")]
    NodeNotFound { node: String },
    #[error("upstream context missing for dependency '{node}'")]
    UpstreamContextMissing { node: String },
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Replay request for a single node of an existing run.
#[derive(Debug, Clone, Default)]
pub struct NodeReplayRequest {
    pub node_id: String,
    /// Used for this execution only; the stored IR is not mutated.
    pub config_override: Option<Value>,
    /// Allow injection into runs that are not FAILED.
    pub force_replay: bool,
    /// Divergence recovery: set the counter to the event-log fold instead
    /// of applying a +1 emit; the injected token takes over a phantom slot.
    pub reset_counter: bool,
}

/// Injects a token at one named node, reusing recorded upstream outputs.
/// When the run's hot state was cleaned up (timeout path), it is rebuilt
/// from the base document, the patch chain, and the event log first.
pub struct NodeReplayService {
    kv: Arc<dyn KvStore>,
    blob: Arc<dyn BlobStore>,
    bus: Arc<dyn EventBus>,
    durable: Arc<dyn DurableStore>,
    sdk: StateSdk,
    config: EngineConfig,
}

impl NodeReplayService {
    pub fn new(
        kv: Arc<dyn KvStore>,
        blob: Arc<dyn BlobStore>,
        bus: Arc<dyn EventBus>,
        durable: Arc<dyn DurableStore>,
        config: EngineConfig,
    ) -> Self {
        let sdk = StateSdk::new(kv.clone(), blob.clone(), bus.clone());
        Self {
            kv,
            blob,
            bus,
            durable,
            sdk,
            config,
        }
    }

    /// Returns the injected token's id.
    pub async fn replay_node(
        &self,
        run_id: Uuid,
        request: NodeReplayRequest,
    ) -> Result<Uuid, NodeReplayError> {
        let run = self
            .durable
            .load_run(run_id)
            .await?
            .ok_or(NodeReplayError::RunNotFound(run_id))?;
        let failed = matches!(run.status, RunStatus::Failed { .. });
        if !failed && !request.force_replay {
            return Err(NodeReplayError::RunNotFailed { status: run.status });
        }

        let ir = match self.kv.load_ir(run_id).await? {
            Some(ir) => ir,
            None => self.rebuild_hot_state(run_id, &run.base_artifact).await?,
        };

        let Some(node) = ir.node(&request.node_id) else {
            return Err(NodeReplayError::NodeNotFound {
                node: request.node_id,
            });
        };

        // Upstream outputs are mandatory: the injected execution must see
        // the same inputs the original would have.
        let context = self.kv.load_context(run_id).await?;
        let mut upstream: BTreeMap<String, Value> = BTreeMap::new();
        for dep in &node.dependencies {
            let output_ref = context
                .get(dep)
                .and_then(|entry| entry.output_ref.clone())
                .ok_or_else(|| NodeReplayError::UpstreamContextMissing { node: dep.clone() })?;
            let value = self
                .sdk
                .load_payload(&output_ref)
                .await
                .map_err(NodeReplayError::Transport)?;
            upstream.insert(dep.clone(), value);
        }

        let payload_ref = match node.dependencies.len() {
            0 => None,
            1 => {
                let dep = node.dependencies.iter().next().expect("one dependency");
                context.get(dep).and_then(|e| e.output_ref.clone())
            }
            _ => {
                let mut merged = serde_json::Map::new();
                for (dep, value) in &upstream {
                    merged.insert(dep.clone(), value.clone());
                }
                Some(
                    self.sdk
                        .store_output(&Value::Object(merged))
                        .await
                        .map_err(NodeReplayError::Transport)?,
                )
            }
        };

        let config = match &request.config_override {
            Some(over) => Some(over.clone()),
            None => match &node.config_ref {
                None => None,
                Some(config_ref) => {
                    let raw = self
                        .sdk
                        .load_config(config_ref)
                        .await
                        .map_err(NodeReplayError::Transport)?;
                    Some(crate::resolver::resolve(&raw, &upstream).unwrap_or(raw))
                }
            },
        };

        let token = Token {
            id: Uuid::now_v7(),
            run_id,
            from_node: "replay".to_string(),
            to_node: node.id.clone(),
            payload_ref,
            config,
            hop: 0,
            created_at: now_ms(),
        };
        let stream = stream_for_node(node, &self.config.stream_overrides);

        if request.reset_counter {
            // Counter := event-log fold; the token is published without an
            // emit delta so it occupies the slot of the lost original.
            let replayer = Replayer::new(self.kv.clone(), self.durable.clone());
            let state = replayer.fold_run(run_id).await?;
            self.kv.init_counter(run_id, state.counter).await?;
            self.bus
                .publish_token(&stream, &token)
                .await
                .map_err(NodeReplayError::Transport)?;
        } else {
            let batch = vec![(stream, token.clone())];
            self.sdk
                .emit(run_id, &format!("replay:{}", token.id), &batch)
                .await
                .map_err(NodeReplayError::Transport)?;
            self.durable
                .append_event(
                    run_id,
                    &RunEvent::TokensEmitted {
                        op_key: crate::types::emit_key(&format!("replay:{}", token.id)),
                        from_node: "replay".into(),
                        to_nodes: vec![node.id.clone()],
                        output_ref: None,
                    },
                )
                .await?;
        }

        self.durable
            .append_event(
                run_id,
                &RunEvent::NodeReplayed {
                    node_id: node.id.clone(),
                    job_id: token.id.to_string(),
                    counter_reset: request.reset_counter,
                },
            )
            .await?;
        self.durable
            .update_run_status(run_id, RunStatus::Running)
            .await?;
        self.durable.touch_run(run_id, now_ms()).await?;

        tracing::info!(%run_id, node = %token.to_node, reset = request.reset_counter, "node replay injected");
        Ok(token.id)
    }

    /// Timeout cleanup removed the hot state; rebuild the IR from the base
    /// document plus the patch chain, and the rest from the event log.
    async fn rebuild_hot_state(
        &self,
        run_id: Uuid,
        base_artifact: &str,
    ) -> Result<WorkflowIr, NodeReplayError> {
        let base: Value = blob::get_json(self.blob.as_ref(), &base_artifact.to_string())
            .await
            .map_err(NodeReplayError::Transport)?;
        let chain = self.durable.load_patches(run_id).await?;
        let doc_value =
            materialize(base, &chain).map_err(|e| NodeReplayError::Transport(anyhow!("{e}")))?;
        let doc = serde_json::from_value(doc_value)
            .map_err(|e| NodeReplayError::Transport(anyhow!("base document invalid: {e}")))?;
        let ir = compile(&doc, self.blob.as_ref())
            .await
            .map_err(|e| NodeReplayError::Transport(anyhow!("recompile failed: {e}")))?;
        self.kv.store_ir(run_id, &ir).await?;

        let replayer = Replayer::new(self.kv.clone(), self.durable.clone());
        replayer.rebuild(run_id).await?;
        Ok(ir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::memory::{MemoryBlobStore, MemoryBus, MemoryDurable, MemoryKv};
    use crate::supervisor::TimeoutDetector;
    use crate::types::{CompletionSignal, SignalStatus};
    use serde_json::json;
    use std::time::Duration;

    struct Rig {
        coordinator: Arc<Coordinator>,
        service: NodeReplayService,
        bus: Arc<MemoryBus>,
        kv: Arc<MemoryKv>,
        blob: Arc<MemoryBlobStore>,
        durable: Arc<MemoryDurable>,
    }

    fn rig() -> Rig {
        let bus = Arc::new(MemoryBus::new());
        let kv = Arc::new(MemoryKv::new());
        let blob = Arc::new(MemoryBlobStore::new());
        let durable = Arc::new(MemoryDurable::new());
        let config = EngineConfig::default();
        let coordinator = Arc::new(Coordinator::new(
            bus.clone(),
            kv.clone(),
            blob.clone(),
            durable.clone(),
            config.clone(),
        ));
        let service = NodeReplayService::new(
            kv.clone(),
            blob.clone(),
            bus.clone(),
            durable.clone(),
            config,
        );
        Rig {
            coordinator,
            service,
            bus,
            kv,
            blob,
            durable,
        }
    }

    async fn submit_chain(rig: &Rig) -> Uuid {
        let doc = serde_json::from_value(json!({
            "id": "chain",
            "nodes": [{"id": "a"}, {"id": "b"}, {"id": "c"}],
            "edges": [{"from": "a", "to": "b"}, {"from": "b", "to": "c"}]
        }))
        .unwrap();
        rig.coordinator
            .submit(&doc, &Value::Null, BTreeMap::new(), "tester")
            .await
            .unwrap()
    }

    async fn take_one(rig: &Rig, stream: &str) -> Token {
        let mut tokens = rig.bus.take_tokens(stream, 1).await.unwrap();
        assert_eq!(tokens.len(), 1);
        tokens.remove(0)
    }

    async fn complete(rig: &Rig, token: &Token, output: Value) {
        let result_ref = blob::put_json(rig.blob.as_ref(), &output).await.unwrap();
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "from_node".to_string(),
            Value::String(token.from_node.clone()),
        );
        let signal = CompletionSignal {
            version: "1.0".into(),
            job_id: token.id.to_string(),
            run_id: token.run_id,
            node_id: token.to_node.clone(),
            status: SignalStatus::Completed,
            result_ref: Some(result_ref),
            metadata,
        };
        rig.coordinator.handle_signal(&signal).await.unwrap();
    }

    /// Full recovery: run times out mid-flight (hot state cleaned), one
    /// node is replayed with a counter reset, and the run drains to
    /// completion.
    #[tokio::test]
    async fn replay_after_timeout_recovers_the_run() {
        let rig = rig();
        let run_id = submit_chain(&rig).await;

        let a = take_one(&rig, "wf.tasks.task").await;
        complete(&rig, &a, json!({"a": 1})).await;
        let _b_in_flight = take_one(&rig, "wf.tasks.task").await;

        // Worker dies; the run stalls and the detector fails it.
        rig.durable.touch_run(run_id, 0).await.unwrap();
        let detector = TimeoutDetector::new(
            rig.kv.clone(),
            rig.durable.clone(),
            Duration::from_secs(5),
            60_000,
        );
        assert_eq!(detector.sweep().await.unwrap(), 1);
        assert!(rig.kv.load_ir(run_id).await.unwrap().is_none());

        // Inject b again, counter reset to the event-log fold.
        rig.service
            .replay_node(
                run_id,
                NodeReplayRequest {
                    node_id: "b".into(),
                    reset_counter: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(rig.kv.get_counter(run_id).await.unwrap(), 1);
        let b = take_one(&rig, "wf.tasks.task").await;
        assert_eq!(b.to_node, "b");
        // The rebuilt context supplied a's output as the payload.
        let payload: Value = blob::get_json(rig.blob.as_ref(), &b.payload_ref.clone().unwrap())
            .await
            .unwrap();
        assert_eq!(payload, json!({"a": 1}));

        complete(&rig, &b, json!({"b": 2})).await;
        let c = take_one(&rig, "wf.tasks.task").await;
        complete(&rig, &c, json!({"c": 3})).await;

        let run = rig.durable.load_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn replay_requires_failed_status_unless_forced() {
        let rig = rig();
        let run_id = submit_chain(&rig).await;

        let err = rig
            .service
            .replay_node(
                run_id,
                NodeReplayRequest {
                    node_id: "a".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeReplayError::RunNotFailed { .. }));

        // Forced injection applies a +1 emit.
        rig.service
            .replay_node(
                run_id,
                NodeReplayRequest {
                    node_id: "a".into(),
                    force_replay: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(rig.kv.get_counter(run_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn replay_demands_upstream_context() {
        let rig = rig();
        let run_id = submit_chain(&rig).await;
        rig.durable
            .update_run_status(
                run_id,
                RunStatus::Failed {
                    reason: "test".into(),
                },
            )
            .await
            .unwrap();

        let err = rig
            .service
            .replay_node(
                run_id,
                NodeReplayRequest {
                    node_id: "b".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeReplayError::UpstreamContextMissing { node } if node == "a"
        ));
    }

    #[tokio::test]
    async fn config_override_applies_to_this_execution_only() {
        let rig = rig();
        let doc = serde_json::from_value(json!({
            "id": "cfg",
            "nodes": [{"id": "a", "config": {"mode": "original"}}],
            "edges": []
        }))
        .unwrap();
        let run_id = rig
            .coordinator
            .submit(&doc, &Value::Null, BTreeMap::new(), "tester")
            .await
            .unwrap();
        let _seed = take_one(&rig, "wf.tasks.task").await;

        rig.service
            .replay_node(
                run_id,
                NodeReplayRequest {
                    node_id: "a".into(),
                    config_override: Some(json!({"mode": "patched"})),
                    force_replay: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let injected = take_one(&rig, "wf.tasks.task").await;
        assert_eq!(injected.config.unwrap(), json!({"mode": "patched"}));

        // The stored IR still points at the original config.
        let ir = rig.kv.load_ir(run_id).await.unwrap().unwrap();
        let stored: Value = blob::get_json(
            rig.blob.as_ref(),
            &ir.node("a").unwrap().config_ref.clone().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(stored, json!({"mode": "original"}));
    }
}
