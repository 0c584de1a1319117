use crate::blob::{self, BlobStore};
use crate::compiler::document::WorkflowDocument;
use crate::compiler::lower::compile;
use crate::compiler::verify::CompileError;
use crate::config::EngineConfig;
use crate::durable::DurableStore;
use crate::events::RunEvent;
use crate::kv::KvStore;
use crate::types::{now_ms, BlobRef, PatchRecord, RunStatus};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Patch-time failures. None of them alter the stored IR.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),
    #[error("run is {status:?}; only live runs can be patched")]
    RunClosed { status: RunStatus },
    #[error("patch has {count} operations (max {max})")]
    TooManyOps { count: usize, max: usize },
    #[error("materialized document has {count} nodes (max {max})")]
    TooManyNodes { count: usize, max: usize },
    #[error("materialized document has {count} agent nodes (max {max})")]
    TooManyAgentNodes { count: usize, max: usize },
    #[error("patch chain depth {depth} exceeds {max}; compact the run first")]
    ChainDepthExceeded { depth: usize, max: u32 },
    #[error("operations are not a valid patch over the document: {0}")]
    InvalidOperations(String),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Mutates a running run's graph: materialize base + chain + new ops,
/// enforce caps, recompile, swap the IR pointer in a single write, append
/// the audit record.
///
/// The Coordinator reloads the IR on every completion, so a successful
/// patch takes effect on the next hop.
pub struct PatchEngine {
    kv: Arc<dyn KvStore>,
    blob: Arc<dyn BlobStore>,
    durable: Arc<dyn DurableStore>,
    config: EngineConfig,
}

impl PatchEngine {
    pub fn new(
        kv: Arc<dyn KvStore>,
        blob: Arc<dyn BlobStore>,
        durable: Arc<dyn DurableStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            kv,
            blob,
            durable,
            config,
        }
    }

    /// Apply one ordered operation set. Returns the new chain seq.
    pub async fn apply_patch(
        &self,
        run_id: Uuid,
        operations: Value,
        description: &str,
        actor: &str,
    ) -> Result<u32, PatchError> {
        let run = self
            .durable
            .load_run(run_id)
            .await?
            .ok_or(PatchError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(PatchError::RunClosed { status: run.status });
        }

        let op_count = operations.as_array().map(Vec::len).unwrap_or(0);
        if op_count == 0 {
            return Err(PatchError::InvalidOperations(
                "operations must be a non-empty array".into(),
            ));
        }
        if op_count > self.config.max_patch_ops {
            return Err(PatchError::TooManyOps {
                count: op_count,
                max: self.config.max_patch_ops,
            });
        }

        let chain = self.durable.load_patches(run_id).await?;
        if chain.len() as u32 >= self.config.max_patch_depth {
            return Err(PatchError::ChainDepthExceeded {
                depth: chain.len() + 1,
                max: self.config.max_patch_depth,
            });
        }

        // Materialize: base, then every applied set in seq order, then the
        // candidate operations.
        let base: Value = blob::get_json(self.blob.as_ref(), &run.base_artifact)
            .await
            .map_err(PatchError::Transport)?;
        let mut doc_value = materialize(base, &chain)?;
        apply_operations(&mut doc_value, &operations)?;

        let doc: WorkflowDocument = serde_json::from_value(doc_value)
            .map_err(|e| PatchError::InvalidOperations(e.to_string()))?;

        self.check_caps(&doc)?;

        // Recompile; a validation failure rejects the patch with the stored
        // IR untouched.
        let ir = compile(&doc, self.blob.as_ref()).await?;

        // The swap is one write: readers observe pre- or post-patch IR,
        // never a partial graph.
        self.kv.store_ir(run_id, &ir).await?;

        let seq = chain.last().map(|p| p.seq + 1).unwrap_or(1);
        let record = PatchRecord {
            run_id,
            seq,
            operations,
            description: description.to_string(),
            actor: actor.to_string(),
            created_at: now_ms(),
        };
        self.durable.append_patch(&record).await?;
        self.durable.set_patch_seq(run_id, seq).await?;
        self.durable
            .append_event(
                run_id,
                &RunEvent::PatchApplied {
                    seq,
                    op_count,
                    description: description.to_string(),
                    actor: actor.to_string(),
                },
            )
            .await?;

        tracing::info!(%run_id, seq, op_count, "patch applied");
        Ok(seq)
    }

    /// Freeze the materialized document as a new base artifact and drop the
    /// chain. Explicit administrative action for chains at the depth cap.
    pub async fn compact(&self, run_id: Uuid) -> Result<BlobRef, PatchError> {
        let run = self
            .durable
            .load_run(run_id)
            .await?
            .ok_or(PatchError::RunNotFound(run_id))?;
        let chain = self.durable.load_patches(run_id).await?;
        let folded_seq = chain.last().map(|p| p.seq).unwrap_or(0);

        let base: Value = blob::get_json(self.blob.as_ref(), &run.base_artifact)
            .await
            .map_err(PatchError::Transport)?;
        let doc_value = materialize(base, &chain)?;

        let new_base = self
            .blob
            .put(&serde_json::to_vec(&doc_value).map_err(|e| {
                PatchError::InvalidOperations(e.to_string())
            })?)
            .await
            .map_err(PatchError::Transport)?;

        self.durable.set_base_artifact(run_id, &new_base).await?;
        self.durable.clear_patches(run_id).await?;
        self.durable.set_patch_seq(run_id, 0).await?;
        self.durable
            .append_event(
                run_id,
                &RunEvent::PatchCompacted {
                    new_base: new_base.clone(),
                    folded_seq,
                },
            )
            .await?;
        Ok(new_base)
    }

    /// The run's effective document: base plus the full chain.
    pub async fn materialized_document(
        &self,
        run_id: Uuid,
    ) -> Result<WorkflowDocument, PatchError> {
        let run = self
            .durable
            .load_run(run_id)
            .await?
            .ok_or(PatchError::RunNotFound(run_id))?;
        let chain = self.durable.load_patches(run_id).await?;
        let base: Value = blob::get_json(self.blob.as_ref(), &run.base_artifact)
            .await
            .map_err(PatchError::Transport)?;
        let doc_value = materialize(base, &chain)?;
        serde_json::from_value(doc_value).map_err(|e| PatchError::InvalidOperations(e.to_string()))
    }

    fn check_caps(&self, doc: &WorkflowDocument) -> Result<(), PatchError> {
        if doc.nodes.len() > self.config.max_nodes {
            return Err(PatchError::TooManyNodes {
                count: doc.nodes.len(),
                max: self.config.max_nodes,
            });
        }
        let agents = doc.nodes.iter().filter(|n| n.node_type == "agent").count();
        if agents > self.config.max_agent_nodes {
            return Err(PatchError::TooManyAgentNodes {
                count: agents,
                max: self.config.max_agent_nodes,
            });
        }
        Ok(())
    }
}

/// Fold a patch chain over the base document, in seq order.
pub(crate) fn materialize(base: Value, chain: &[PatchRecord]) -> Result<Value, PatchError> {
    let mut doc = base;
    for record in chain {
        apply_operations(&mut doc, &record.operations)?;
    }
    Ok(doc)
}

fn apply_operations(doc: &mut Value, operations: &Value) -> Result<(), PatchError> {
    let ops: json_patch::Patch = serde_json::from_value(operations.clone())
        .map_err(|e| PatchError::InvalidOperations(e.to_string()))?;
    json_patch::patch(doc, &ops).map_err(|e| PatchError::InvalidOperations(e.to_string()))
}
