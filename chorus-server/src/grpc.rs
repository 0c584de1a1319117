use std::collections::BTreeMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use uuid::Uuid;

use chorus_core::compiler::document::WorkflowDocument;
use chorus_core::coordinator::Coordinator;
use chorus_core::node_replay::{NodeReplayError, NodeReplayRequest, NodeReplayService};
use chorus_core::patch::{PatchEngine, PatchError};
use chorus_core::CompileError;

pub mod proto {
    tonic::include_proto!("chorus.v1");
}

use proto::chorus_server::Chorus;
use proto::*;

pub struct ChorusService {
    pub coordinator: Arc<Coordinator>,
    pub patcher: Arc<PatchEngine>,
    pub replayer: Arc<NodeReplayService>,
}

// --- Error mapping ---

#[allow(clippy::result_large_err)]
fn parse_run_id(s: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(s).map_err(|e| Status::invalid_argument(format!("invalid run_id: {e}")))
}

#[allow(clippy::result_large_err)]
fn parse_json(field: &str, raw: &str) -> Result<serde_json::Value, Status> {
    serde_json::from_str(raw)
        .map_err(|e| Status::invalid_argument(format!("{field} is not valid JSON: {e}")))
}

fn submit_err(e: anyhow::Error) -> Status {
    match e.downcast_ref::<CompileError>() {
        Some(compile) => Status::invalid_argument(format!("validation failed: {compile}")),
        None => Status::internal(format!("{e:#}")),
    }
}

fn patch_err(e: PatchError) -> Status {
    match &e {
        PatchError::RunNotFound(_) => Status::not_found(e.to_string()),
        PatchError::RunClosed { .. } | PatchError::ChainDepthExceeded { .. } => {
            Status::failed_precondition(e.to_string())
        }
        PatchError::Transport(inner) => Status::internal(format!("{inner:#}")),
        _ => Status::invalid_argument(e.to_string()),
    }
}

fn replay_err(e: NodeReplayError) -> Status {
    match &e {
        NodeReplayError::RunNotFound(_) | NodeReplayError::NodeNotFound { .. } => {
            Status::not_found(e.to_string())
        }
        NodeReplayError::RunNotFailed { .. } => Status::failed_precondition(e.to_string()),
        NodeReplayError::UpstreamContextMissing { .. } => {
            Status::failed_precondition(e.to_string())
        }
        NodeReplayError::Transport(inner) => Status::internal(format!("{inner:#}")),
    }
}

#[tonic::async_trait]
impl Chorus for ChorusService {
    async fn submit_run(
        &self,
        request: Request<SubmitRunRequest>,
    ) -> Result<Response<SubmitRunResponse>, Status> {
        let req = request.into_inner();
        let doc: WorkflowDocument = serde_json::from_str(&req.document_json)
            .map_err(|e| Status::invalid_argument(format!("invalid workflow document: {e}")))?;
        let input = if req.input_json.is_empty() {
            serde_json::Value::Null
        } else {
            parse_json("input_json", &req.input_json)?
        };
        let tags: BTreeMap<String, String> = req.tags.into_iter().collect();

        let run_id = self
            .coordinator
            .submit(&doc, &input, tags, &req.actor)
            .await
            .map_err(submit_err)?;

        Ok(Response::new(SubmitRunResponse {
            run_id: run_id.to_string(),
        }))
    }

    async fn patch_run(
        &self,
        request: Request<PatchRunRequest>,
    ) -> Result<Response<PatchRunResponse>, Status> {
        let req = request.into_inner();
        let run_id = parse_run_id(&req.run_id)?;
        let operations = parse_json("operations_json", &req.operations_json)?;

        let seq = self
            .patcher
            .apply_patch(run_id, operations, &req.description, &req.actor)
            .await
            .map_err(patch_err)?;

        Ok(Response::new(PatchRunResponse { seq }))
    }

    async fn replay_node(
        &self,
        request: Request<ReplayNodeRequest>,
    ) -> Result<Response<ReplayNodeResponse>, Status> {
        let req = request.into_inner();
        let run_id = parse_run_id(&req.run_id)?;
        let config_override = if req.config_override_json.is_empty() {
            None
        } else {
            Some(parse_json("config_override_json", &req.config_override_json)?)
        };

        let token_id = self
            .replayer
            .replay_node(
                run_id,
                NodeReplayRequest {
                    node_id: req.node_id,
                    config_override,
                    force_replay: req.force_replay,
                    reset_counter: req.reset_counter,
                },
            )
            .await
            .map_err(replay_err)?;

        Ok(Response::new(ReplayNodeResponse {
            token_id: token_id.to_string(),
        }))
    }

    async fn get_run(
        &self,
        request: Request<GetRunRequest>,
    ) -> Result<Response<GetRunResponse>, Status> {
        let req = request.into_inner();
        let run_id = parse_run_id(&req.run_id)?;

        let inspection = self
            .coordinator
            .inspect(run_id)
            .await
            .map_err(|e| Status::internal(format!("{e:#}")))?
            .ok_or_else(|| Status::not_found(format!("run not found: {run_id}")))?;

        let status_json = serde_json::to_string(&inspection.run.status)
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(GetRunResponse {
            run_id: run_id.to_string(),
            status_json,
            counter: inspection.counter,
            recorded_nodes: inspection.context.keys().cloned().collect(),
            pending_approvals: inspection.pending_approvals as u32,
            joins_pending: inspection.joins_pending,
            patch_seq: inspection.run.patch_seq,
        }))
    }

    async fn cancel_run(
        &self,
        request: Request<CancelRunRequest>,
    ) -> Result<Response<CancelRunResponse>, Status> {
        let req = request.into_inner();
        let run_id = parse_run_id(&req.run_id)?;
        self.coordinator
            .cancel(run_id, &req.reason)
            .await
            .map_err(|e| Status::internal(format!("{e:#}")))?;
        Ok(Response::new(CancelRunResponse {}))
    }
}
