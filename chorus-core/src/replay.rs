use crate::durable::DurableStore;
use crate::events::RunEvent;
use crate::kv::KvStore;
use crate::types::ContextEntry;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// Hot state reconstructed by folding the event log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayState {
    pub counter: i64,
    pub applied: BTreeSet<String>,
    pub context: BTreeMap<String, ContextEntry>,
    pub pending_approvals: BTreeSet<String>,
}

impl ReplayState {
    /// Fold events in sequence order. Op keys already folded are skipped,
    /// mirroring the live applier, so the fold is idempotent over any
    /// duplicated suffix.
    pub fn fold<'a>(events: impl IntoIterator<Item = &'a RunEvent>) -> Self {
        let mut state = ReplayState::default();
        for event in events {
            state.apply(event);
        }
        state
    }

    pub fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::TokenConsumed { op_key, .. } => {
                if self.applied.insert(op_key.clone()) {
                    self.counter -= 1;
                }
            }
            RunEvent::TokensEmitted {
                op_key,
                from_node,
                to_nodes,
                output_ref,
            } => {
                if self.applied.insert(op_key.clone()) {
                    self.counter += to_nodes.len() as i64;
                }
                if let Some(r) = output_ref {
                    // Seed emits have an empty from_node; their payload is
                    // run input, not node output.
                    if !from_node.is_empty() {
                        self.context
                            .entry(from_node.clone())
                            .or_insert_with(|| ContextEntry {
                                output_ref: Some(r.clone()),
                                status: crate::types::SignalStatus::Completed,
                                recorded_at: 0,
                                metadata: BTreeMap::new(),
                            });
                    }
                }
            }
            RunEvent::NodeRecorded {
                node_id,
                status,
                output_ref,
            } => {
                self.context.insert(
                    node_id.clone(),
                    ContextEntry {
                        output_ref: output_ref.clone(),
                        status: *status,
                        recorded_at: 0,
                        metadata: BTreeMap::new(),
                    },
                );
            }
            RunEvent::ApprovalCreated { hold_id, .. } => {
                self.pending_approvals.insert(hold_id.clone());
            }
            RunEvent::ApprovalDecided { hold_id, .. } => {
                self.pending_approvals.remove(hold_id);
            }
            _ => {}
        }
    }
}

/// Rebuilds a run's hot state from the durable event log. Audit, debugging,
/// and cold-start recovery when the key-value store is lost.
pub struct Replayer {
    kv: Arc<dyn KvStore>,
    durable: Arc<dyn DurableStore>,
}

impl Replayer {
    pub fn new(kv: Arc<dyn KvStore>, durable: Arc<dyn DurableStore>) -> Self {
        Self { kv, durable }
    }

    /// Fold the full log without touching any store.
    pub async fn fold_run(&self, run_id: Uuid) -> Result<ReplayState> {
        let events = self.durable.read_events(run_id, 0).await?;
        Ok(ReplayState::fold(events.iter().map(|(_, e)| e)))
    }

    /// Write the folded state back into the key-value store: counter set
    /// to the folded value, op keys recorded with zero-deltas (idempotent
    /// across repeated rebuilds), context entries and approval holds
    /// re-inserted.
    pub async fn rebuild(&self, run_id: Uuid) -> Result<ReplayState> {
        let events = self.durable.read_events(run_id, 0).await?;
        let state = ReplayState::fold(events.iter().map(|(_, e)| e));

        self.kv.init_counter(run_id, state.counter).await?;
        for op_key in &state.applied {
            self.kv.apply_delta(run_id, op_key, 0).await?;
        }
        for hold_id in &state.pending_approvals {
            self.kv.approval_add(run_id, hold_id).await?;
        }
        for (node_id, entry) in &state.context {
            self.kv.store_context(run_id, node_id, entry).await?;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::document::WorkflowDocument;
    use crate::coordinator::Coordinator;
    use crate::memory::{MemoryBlobStore, MemoryBus, MemoryDurable, MemoryKv};
    use crate::types::{CompletionSignal, SignalStatus, Token};
    use crate::bus::EventBus;
    use crate::config::EngineConfig;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    fn consumed(op: &str) -> RunEvent {
        RunEvent::TokenConsumed {
            op_key: op.into(),
            node_id: "n".into(),
            job_id: "j".into(),
        }
    }

    fn emitted(op: &str, from: &str, to: &[&str]) -> RunEvent {
        RunEvent::TokensEmitted {
            op_key: op.into(),
            from_node: from.into(),
            to_nodes: to.iter().map(|s| s.to_string()).collect(),
            output_ref: Some("ref-1".into()),
        }
    }

    #[test]
    fn fold_applies_each_op_key_once() {
        let events = vec![
            emitted("emit:seed", "", &["a"]),
            consumed("consume:->a:j1"),
            consumed("consume:->a:j1"),
            emitted("emit:j1", "a", &["b", "c"]),
            emitted("emit:j1", "a", &["b", "c"]),
        ];
        let state = ReplayState::fold(events.iter());
        assert_eq!(state.counter, 1 - 1 + 2);
        assert_eq!(state.applied.len(), 3);
    }

    #[test]
    fn fold_tracks_approvals() {
        let events = vec![
            RunEvent::ApprovalCreated {
                node_id: "review".into(),
                hold_id: "t1".into(),
            },
            RunEvent::ApprovalDecided {
                node_id: "review".into(),
                hold_id: "t1".into(),
                follow_up_emits: vec![],
            },
        ];
        let state = ReplayState::fold(events.iter());
        assert!(state.pending_approvals.is_empty());

        let half = ReplayState::fold(events.iter().take(1));
        assert_eq!(half.pending_approvals.len(), 1);
    }

    /// Replay over a live run's log matches the live hot state at every
    /// prefix boundary the scenario produces.
    #[tokio::test]
    async fn fold_matches_live_state_mid_run() {
        let bus = Arc::new(MemoryBus::new());
        let kv = Arc::new(MemoryKv::new());
        let blob = Arc::new(MemoryBlobStore::new());
        let durable = Arc::new(MemoryDurable::new());
        let coordinator = Coordinator::new(
            bus.clone(),
            kv.clone(),
            blob.clone(),
            durable.clone(),
            EngineConfig::default(),
        );

        let doc: WorkflowDocument = serde_json::from_value(json!({
            "id": "chain",
            "nodes": [{"id": "a"}, {"id": "b"}],
            "edges": [{"from": "a", "to": "b"}]
        }))
        .unwrap();
        let run_id = coordinator
            .submit(&doc, &json!({"x": 1}), BTreeMap::new(), "tester")
            .await
            .unwrap();

        let token: Token = bus.take_tokens("wf.tasks.task", 1).await.unwrap().remove(0);
        let result_ref = crate::blob::put_json(blob.as_ref(), &json!({"a": 1}))
            .await
            .unwrap();
        let mut metadata = BTreeMap::new();
        metadata.insert("from_node".to_string(), Value::String("".into()));
        let signal = CompletionSignal {
            version: "1.0".into(),
            job_id: token.id.to_string(),
            run_id,
            node_id: "a".into(),
            status: SignalStatus::Completed,
            result_ref: Some(result_ref),
            metadata,
        };
        coordinator.handle_signal(&signal).await.unwrap();

        let replayer = Replayer::new(kv.clone(), durable.clone());
        let folded = replayer.fold_run(run_id).await.unwrap();

        assert_eq!(folded.counter, kv.get_counter(run_id).await.unwrap());
        let live_applied: BTreeSet<String> =
            kv.applied_members(run_id).await.unwrap().into_iter().collect();
        assert_eq!(folded.applied, live_applied);
        let live_context = kv.load_context(run_id).await.unwrap();
        assert_eq!(
            folded.context.keys().collect::<Vec<_>>(),
            live_context.keys().collect::<Vec<_>>()
        );
    }

    /// Lost hot state is recoverable: rebuild writes counter, applied set
    /// and context back through the applier.
    #[tokio::test]
    async fn rebuild_restores_lost_hot_state() {
        let kv = Arc::new(MemoryKv::new());
        let durable = Arc::new(MemoryDurable::new());
        let run_id = Uuid::now_v7();

        durable
            .append_event(run_id, &emitted("emit:seed", "", &["a"]))
            .await
            .unwrap();
        durable
            .append_event(run_id, &consumed("consume:->a:j1"))
            .await
            .unwrap();
        durable
            .append_event(run_id, &emitted("emit:j1", "a", &["b"]))
            .await
            .unwrap();

        let replayer = Replayer::new(kv.clone(), durable.clone());
        let state = replayer.rebuild(run_id).await.unwrap();

        assert_eq!(state.counter, 1);
        assert_eq!(kv.get_counter(run_id).await.unwrap(), 1);
        assert_eq!(kv.applied_members(run_id).await.unwrap().len(), 3);
        assert!(kv.load_context(run_id).await.unwrap().contains_key("a"));

        // A second rebuild is a no-op thanks to op-key idempotency.
        let again = replayer.rebuild(run_id).await.unwrap();
        assert_eq!(again.counter, 1);
        assert_eq!(kv.get_counter(run_id).await.unwrap(), 1);
    }
}
