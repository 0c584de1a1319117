use crate::blob::{self, BlobStore};
use crate::bus::{EventBus, DEFAULT_STREAM, STREAM_PREFIX};
use crate::compiler::document::WorkflowDocument;
use crate::compiler::ir::{BranchKind, IrNode, NodeKind};
use crate::compiler::lower::compile;
use crate::condition::Evaluator;
use crate::config::EngineConfig;
use crate::durable::DurableStore;
use crate::events::RunEvent;
use crate::kv::{join_member, parse_join_member, KvStore};
use crate::sdk::StateSdk;
use crate::supervisor::verify_and_complete;
use crate::types::{
    consume_key, emit_key, now_ms, BlobRef, CompletionSignal, ContextEntry, LoopState, Run,
    RunStatus, SignalStatus, Token,
};
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

/// The central choreography loop.
///
/// Stateless across restarts: every handler reloads the run's IR and
/// context from the external stores, so patches take effect on the next
/// hop and any instance in a consumer group can process any signal.
pub struct Coordinator {
    bus: Arc<dyn EventBus>,
    kv: Arc<dyn KvStore>,
    blob: Arc<dyn BlobStore>,
    durable: Arc<dyn DurableStore>,
    sdk: StateSdk,
    evaluator: Evaluator,
    config: EngineConfig,
}

/// Read-only snapshot of a run for the inspection surface.
#[derive(Debug, Clone)]
pub struct RunInspection {
    pub run: Run,
    pub counter: i64,
    pub context: BTreeMap<String, ContextEntry>,
    pub pending_approvals: usize,
    pub joins_pending: bool,
}

/// What a loop decision does to the per-node loop state, applied only once
/// the signal's consume has been accepted.
enum LoopAction {
    None,
    Advance(LoopState),
    Exit,
}

impl Coordinator {
    pub fn new(
        bus: Arc<dyn EventBus>,
        kv: Arc<dyn KvStore>,
        blob: Arc<dyn BlobStore>,
        durable: Arc<dyn DurableStore>,
        config: EngineConfig,
    ) -> Self {
        let sdk = StateSdk::new(kv.clone(), blob.clone(), bus.clone());
        Self {
            bus,
            kv,
            blob,
            durable,
            sdk,
            evaluator: Evaluator::new(),
            config,
        }
    }

    pub fn sdk(&self) -> &StateSdk {
        &self.sdk
    }

    /// Sandbox registration hook; one evaluator per Coordinator instance.
    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    // ── Consumer loop ─────────────────────────────────────────

    /// Pop signals until shutdown, spawning one bounded handler per signal.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.handler_concurrency));
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            if let Err(e) = self.sweep_default_stream().await {
                tracing::error!(error = %e, "default-stream sweep failed");
            }

            let popped = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                popped = self.bus.pop_signal(self.config.signal_pop_timeout()) => popped?,
            };
            let Some(signal) = popped else { continue };

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("handler semaphore closed");
            let coordinator = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                coordinator.handle_with_deadline(signal).await;
            });
        }
    }

    /// Per-hop deadline wrapper: exceeding it logs, applies the consume so
    /// the counter still drains, and abandons the node.
    async fn handle_with_deadline(&self, signal: CompletionSignal) {
        match tokio::time::timeout(self.config.hop_deadline(), self.handle_signal(&signal)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(
                    run_id = %signal.run_id,
                    node = %signal.node_id,
                    job_id = %signal.job_id,
                    error = %e,
                    "signal handler failed"
                );
            }
            Err(_) => {
                tracing::error!(
                    run_id = %signal.run_id,
                    node = %signal.node_id,
                    job_id = %signal.job_id,
                    "hop deadline exceeded; consuming and abandoning"
                );
                let _ = self
                    .sdk
                    .consume(
                        signal.run_id,
                        signal.from_node(),
                        &signal.node_id,
                        &signal.job_id,
                    )
                    .await;
            }
        }
    }

    /// Tokens routed to the default stream target node types nothing is
    /// registered for; auto-complete them as skipped so the graph never
    /// deadlocks on typos or forward-compatibility nodes.
    async fn sweep_default_stream(&self) -> Result<()> {
        let tokens = self.bus.take_tokens(DEFAULT_STREAM, 32).await?;
        for token in tokens {
            tracing::warn!(
                run_id = %token.run_id,
                node = %token.to_node,
                "auto-completing token for unroutable node type"
            );
            self.durable
                .append_event(
                    token.run_id,
                    &RunEvent::NodeSkipped {
                        node_id: token.to_node.clone(),
                        reason: "unroutable node type".into(),
                    },
                )
                .await?;
            let mut metadata = BTreeMap::new();
            metadata.insert(
                "from_node".to_string(),
                Value::String(token.from_node.clone()),
            );
            metadata.insert("auto_completed".to_string(), Value::Bool(true));
            let synthetic = CompletionSignal {
                version: "1.0".into(),
                job_id: token.id.to_string(),
                run_id: token.run_id,
                node_id: token.to_node.clone(),
                status: SignalStatus::Skipped,
                result_ref: None,
                metadata,
            };
            self.bus.push_signal(&synthetic).await?;
        }
        Ok(())
    }

    // ── Signal handler ────────────────────────────────────────

    /// Drive one completion signal through consume, context, routing,
    /// publish and emit. Idempotent under redelivery: the consume op key is
    /// the single linearization point.
    pub async fn handle_signal(&self, signal: &CompletionSignal) -> Result<()> {
        let run_id = signal.run_id;
        let from = signal.from_node().to_string();
        let job_id = signal.job_id.clone();

        // ── Guard 1: run row ──
        let Some(run) = self.durable.load_run(run_id).await? else {
            tracing::warn!(%run_id, job_id, "signal for unknown run dropped");
            return Ok(());
        };

        // ── Guard 2: hot state (late signals after cleanup) ──
        let Some(ir) = self.sdk.load_ir(run_id).await? else {
            self.durable
                .append_event(
                    run_id,
                    &RunEvent::SignalIgnored {
                        signal_desc: format!(
                            "job {job_id} arrived with no hot state (run {:?})",
                            run.status
                        ),
                    },
                )
                .await?;
            return Ok(());
        };

        // ── Guard 3: cancellation — keep the counter truthful, drop the rest ──
        if run.status == RunStatus::Cancelled || self.kv.is_cancelled(run_id).await? {
            let out = self.sdk.consume(run_id, &from, &signal.node_id, &job_id).await?;
            if out.changed {
                self.durable
                    .append_event(
                        run_id,
                        &RunEvent::SignalIgnored {
                            signal_desc: format!("job {job_id} for cancelled run"),
                        },
                    )
                    .await?;
            }
            return Ok(());
        }

        // ── Locate the node; absent means removed-by-patch or never known ──
        let Some(node) = ir.node(&signal.node_id) else {
            tracing::warn!(%run_id, node = %signal.node_id, "signal for node absent from IR; graceful drop");
            let out = self.sdk.consume(run_id, &from, &signal.node_id, &job_id).await?;
            if out.changed {
                self.durable
                    .append_event(
                        run_id,
                        &RunEvent::TokenConsumed {
                            op_key: consume_key(&from, &signal.node_id, &job_id),
                            node_id: signal.node_id.clone(),
                            job_id: job_id.clone(),
                        },
                    )
                    .await?;
                self.durable
                    .append_event(
                        run_id,
                        &RunEvent::NodeSkipped {
                            node_id: signal.node_id.clone(),
                            reason: "absent from current IR".into(),
                        },
                    )
                    .await?;
                if out.hit_zero {
                    verify_and_complete(self.kv.as_ref(), self.durable.as_ref(), run_id).await?;
                }
            }
            self.durable.touch_run(run_id, now_ms()).await?;
            return Ok(());
        };

        // ── Load the node's output; skipped nodes get a sentinel ──
        let output = match &signal.result_ref {
            Some(r) => self.sdk.load_payload(r).await.unwrap_or(Value::Null),
            None => Value::Null,
        };
        let output_ref: Option<BlobRef> = match &signal.result_ref {
            Some(r) => Some(r.clone()),
            None if signal.status == SignalStatus::Skipped => {
                Some(self.sdk.store_output(&Value::Null).await?)
            }
            None => None,
        };

        // ── Worker failure: consume, record, completion check ──
        if signal.status == SignalStatus::Failed {
            return self
                .handle_failed(signal, node, &from, &job_id, output_ref)
                .await;
        }

        // ── Redelivery of a token already folded in (possibly by a join
        //    release): stop before touching any join set ──
        if self
            .kv
            .is_applied(run_id, &consume_key(&from, &signal.node_id, &job_id))
            .await?
        {
            tracing::debug!(%run_id, job_id, "duplicate signal; already applied");
            return Ok(());
        }

        // ── Routing decision (pure; state effects deferred) ──
        let (ctx_json, mut ctx_outputs) = self.load_context_view(run_id).await?;
        let (targets, loop_action, route_events) = self
            .decide_route(run_id, node, &output, &ctx_json, signal.next_nodes())
            .await?;

        let mut plain: Vec<String> = Vec::new();
        let mut join_targets: Vec<String> = Vec::new();
        let mut dropped: Vec<String> = Vec::new();
        for target in targets {
            match ir.node(&target) {
                Some(t) if t.is_join() => join_targets.push(target),
                Some(_) => plain.push(target),
                None => dropped.push(target),
            }
        }

        // ── Join set-tracking ──
        let member = join_member(&from, &signal.node_id, &job_id);
        let mut satisfied: Vec<(String, Vec<String>)> = Vec::new();
        for target in &join_targets {
            let members = self.kv.join_arrive(run_id, target, &member).await?;
            let expected = ir
                .node(target)
                .map(|n| n.dependencies.len())
                .unwrap_or(usize::MAX);
            let arrived = distinct_senders(&members);
            self.durable
                .append_event(
                    run_id,
                    &RunEvent::JoinArrived {
                        node_id: target.clone(),
                        from_node: signal.node_id.clone(),
                        pending: arrived,
                        expected,
                    },
                )
                .await?;
            if arrived >= expected {
                satisfied.push((target.clone(), members));
            }
        }

        // ── Deferral: every target is an unsatisfied join ──
        if plain.is_empty() && satisfied.is_empty() && !join_targets.is_empty() {
            self.record_output(run_id, signal, node, output_ref.clone())
                .await?;
            self.durable.touch_run(run_id, now_ms()).await?;
            return Ok(());
        }

        // ── Apply consume: the duplicate-delivery linearization point ──
        let own = self.sdk.consume(run_id, &from, &signal.node_id, &job_id).await?;
        if !own.changed {
            tracing::debug!(%run_id, job_id, "duplicate signal; no further side effects");
            return Ok(());
        }
        self.durable
            .append_event(
                run_id,
                &RunEvent::TokenConsumed {
                    op_key: consume_key(&from, &signal.node_id, &job_id),
                    node_id: signal.node_id.clone(),
                    job_id: job_id.clone(),
                },
            )
            .await?;

        // ── Record output + clear any human hold ──
        self.record_output(run_id, signal, node, output_ref.clone())
            .await?;
        ctx_outputs.insert(signal.node_id.clone(), output.clone());

        // ── Apply the loop decision ──
        match loop_action {
            LoopAction::Advance(mut state) => {
                state.last_output_ref = output_ref.clone();
                self.kv.store_loop(run_id, &signal.node_id, &state).await?;
            }
            LoopAction::Exit => self.kv.delete_loop(run_id, &signal.node_id).await?,
            LoopAction::None => {}
        }
        for event in route_events {
            self.durable.append_event(run_id, &event).await?;
        }
        for target in dropped {
            self.durable
                .append_event(
                    run_id,
                    &RunEvent::NodeSkipped {
                        node_id: target,
                        reason: "route target absent from current IR".into(),
                    },
                )
                .await?;
        }

        // ── Build downstream tokens ──
        let mut batch: Vec<(String, Token)> = Vec::new();
        let mut emitted: Vec<String> = Vec::new();
        let hop = next_hop(signal);

        for target in &plain {
            let target_node = ir.node(target).expect("partitioned above");
            let token = self
                .build_token(run_id, signal, target_node, output_ref.clone(), hop, &ctx_outputs)
                .await?;
            batch.push((self.stream_for(target_node), token));
            emitted.push(target.clone());
        }

        // ── Release satisfied joins ──
        for (target, members) in &satisfied {
            for m in members {
                let Some((f, n, j)) = parse_join_member(m) else {
                    continue;
                };
                let op_key = consume_key(f, n, j);
                let out = self.sdk.consume_op(run_id, &op_key).await?;
                if out.changed {
                    self.durable
                        .append_event(
                            run_id,
                            &RunEvent::TokenConsumed {
                                op_key,
                                node_id: n.to_string(),
                                job_id: j.to_string(),
                            },
                        )
                        .await?;
                }
            }

            let target_node = ir.node(target).expect("partitioned above");
            let merged = merged_payload(target_node, &ctx_outputs);
            let merged_ref = self.sdk.store_output(&merged).await?;
            let token = self
                .build_token(run_id, signal, target_node, Some(merged_ref), hop, &ctx_outputs)
                .await?;
            batch.push((self.stream_for(target_node), token));
            emitted.push(target.clone());

            self.durable
                .append_event(
                    run_id,
                    &RunEvent::JoinReleased {
                        node_id: target.clone(),
                        members: members.clone(),
                    },
                )
                .await?;
            self.kv.join_clear(run_id, target).await?;
        }

        // ── Publish + emit ──
        if !batch.is_empty() {
            for (stream, _) in &batch {
                self.guard_backpressure(run_id, stream).await?;
            }
            self.sdk.emit(run_id, &job_id, &batch).await?;
            self.durable
                .append_event(
                    run_id,
                    &RunEvent::TokensEmitted {
                        op_key: emit_key(&job_id),
                        from_node: signal.node_id.clone(),
                        to_nodes: emitted,
                        output_ref: output_ref.clone(),
                    },
                )
                .await?;
        } else if own.hit_zero {
            // Terminal node, or a branch with no matching rule and an empty
            // default: nothing emitted, counter drained. Backup to the
            // event-driven completion path.
            verify_and_complete(self.kv.as_ref(), self.durable.as_ref(), run_id).await?;
        }

        self.durable.touch_run(run_id, now_ms()).await?;
        Ok(())
    }

    async fn handle_failed(
        &self,
        signal: &CompletionSignal,
        node: &IrNode,
        from: &str,
        job_id: &str,
        output_ref: Option<BlobRef>,
    ) -> Result<()> {
        let run_id = signal.run_id;
        let out = self.sdk.consume(run_id, from, &signal.node_id, job_id).await?;
        if !out.changed {
            return Ok(());
        }
        self.durable
            .append_event(
                run_id,
                &RunEvent::TokenConsumed {
                    op_key: consume_key(from, &signal.node_id, job_id),
                    node_id: signal.node_id.clone(),
                    job_id: job_id.to_string(),
                },
            )
            .await?;
        self.record_output(run_id, signal, node, output_ref).await?;
        self.durable.touch_run(run_id, now_ms()).await?;

        // No error routes declared: the node is terminal for this signal;
        // remaining branches may still drain the counter, otherwise the
        // timeout detector ends the run.
        if out.hit_zero {
            verify_and_complete(self.kv.as_ref(), self.durable.as_ref(), run_id).await?;
        }
        Ok(())
    }

    /// Write the node's outcome into context and settle any approval hold.
    async fn record_output(
        &self,
        run_id: Uuid,
        signal: &CompletionSignal,
        node: &IrNode,
        output_ref: Option<BlobRef>,
    ) -> Result<()> {
        let entry = ContextEntry {
            output_ref: output_ref.clone(),
            status: signal.status,
            recorded_at: now_ms(),
            metadata: signal.metadata.clone(),
        };
        self.sdk.store_context(run_id, &signal.node_id, &entry).await?;
        self.durable
            .append_event(
                run_id,
                &RunEvent::NodeRecorded {
                    node_id: signal.node_id.clone(),
                    status: signal.status,
                    output_ref,
                },
            )
            .await?;

        if node.kind == NodeKind::Human {
            self.kv.approval_remove(run_id, &signal.job_id).await?;
            self.durable
                .append_event(
                    run_id,
                    &RunEvent::ApprovalDecided {
                        node_id: signal.node_id.clone(),
                        hold_id: signal.job_id.clone(),
                        follow_up_emits: vec![],
                    },
                )
                .await?;
        }
        Ok(())
    }

    // ── Routing ───────────────────────────────────────────────

    /// Decide the downstream set: loop block first, then branch block, then
    /// static dependents. Pure except for the loop-state read; the returned
    /// action is applied only after the consume is accepted.
    async fn decide_route(
        &self,
        run_id: Uuid,
        node: &IrNode,
        output: &Value,
        ctx: &Value,
        proposed: Option<Vec<String>>,
    ) -> Result<(Vec<String>, LoopAction, Vec<RunEvent>)> {
        let mut events = Vec::new();

        if let Some(lp) = node.loop_block.as_ref().filter(|l| l.enabled) {
            let state = self
                .kv
                .load_loop(run_id, &node.id)
                .await?
                .unwrap_or(LoopState {
                    current_iteration: 0,
                    max_iterations: lp.max_iterations,
                    last_output_ref: None,
                });

            let keep_looping = match self
                .evaluator
                .eval(&lp.condition, output, ctx, self.blob.as_ref())
                .await
            {
                Ok(verdict) => verdict,
                Err(e) => {
                    events.push(RunEvent::ConditionErrored {
                        node_id: node.id.clone(),
                        detail: e.to_string(),
                    });
                    false
                }
            };

            if !keep_looping {
                events.push(RunEvent::LoopExited {
                    node_id: node.id.clone(),
                    via: "break".into(),
                    next_nodes: lp.break_path.clone(),
                });
                return Ok((lp.break_path.clone(), LoopAction::Exit, events));
            }
            if state.current_iteration < lp.max_iterations {
                let mut advanced = state;
                advanced.current_iteration += 1;
                events.push(RunEvent::LoopIteration {
                    node_id: node.id.clone(),
                    iteration: advanced.current_iteration,
                    max_iterations: lp.max_iterations,
                });
                return Ok((
                    vec![lp.loop_back_to.clone()],
                    LoopAction::Advance(advanced),
                    events,
                ));
            }
            events.push(RunEvent::LoopExited {
                node_id: node.id.clone(),
                via: "timeout".into(),
                next_nodes: lp.timeout_path.clone(),
            });
            return Ok((lp.timeout_path.clone(), LoopAction::Exit, events));
        }

        if let Some(br) = node.branch.as_ref().filter(|b| b.enabled) {
            match br.kind {
                BranchKind::Conditional => {
                    for (index, rule) in br.rules.iter().enumerate() {
                        let hit = match self
                            .evaluator
                            .eval(&rule.condition, output, ctx, self.blob.as_ref())
                            .await
                        {
                            Ok(verdict) => verdict,
                            Err(e) => {
                                events.push(RunEvent::ConditionErrored {
                                    node_id: node.id.clone(),
                                    detail: e.to_string(),
                                });
                                false
                            }
                        };
                        if hit {
                            events.push(RunEvent::BranchTaken {
                                node_id: node.id.clone(),
                                rule_index: Some(index),
                                next_nodes: rule.next_nodes.clone(),
                            });
                            return Ok((rule.next_nodes.clone(), LoopAction::None, events));
                        }
                    }
                    events.push(RunEvent::BranchTaken {
                        node_id: node.id.clone(),
                        rule_index: None,
                        next_nodes: br.default.clone(),
                    });
                    Ok((br.default.clone(), LoopAction::None, events))
                }
                BranchKind::AgentDriven => {
                    match proposed {
                        Some(routes) if !routes.is_empty() => {
                            let allowed = routes
                                .iter()
                                .all(|r| br.available_next_nodes.contains(r));
                            if allowed {
                                events.push(RunEvent::BranchTaken {
                                    node_id: node.id.clone(),
                                    rule_index: None,
                                    next_nodes: routes.clone(),
                                });
                                Ok((routes, LoopAction::None, events))
                            } else {
                                // Security invariant: agents never route
                                // outside their allow-list.
                                events.push(RunEvent::AgentRouteRejected {
                                    node_id: node.id.clone(),
                                    proposed: routes,
                                    allowed: br.available_next_nodes.clone(),
                                });
                                events.push(RunEvent::BranchTaken {
                                    node_id: node.id.clone(),
                                    rule_index: None,
                                    next_nodes: br.default.clone(),
                                });
                                Ok((br.default.clone(), LoopAction::None, events))
                            }
                        }
                        _ => {
                            events.push(RunEvent::BranchTaken {
                                node_id: node.id.clone(),
                                rule_index: None,
                                next_nodes: br.default.clone(),
                            });
                            Ok((br.default.clone(), LoopAction::None, events))
                        }
                    }
                }
            }
        } else {
            Ok((
                node.dependents.iter().cloned().collect(),
                LoopAction::None,
                events,
            ))
        }
    }

    // ── Token construction ────────────────────────────────────

    /// Resolve the target's config against accumulated context and wrap it
    /// in a token. Resolution failures fall back to the unresolved original
    /// so the worker surfaces a clearer error.
    async fn build_token(
        &self,
        run_id: Uuid,
        signal: &CompletionSignal,
        target: &IrNode,
        payload_ref: Option<BlobRef>,
        hop: u32,
        ctx_outputs: &BTreeMap<String, Value>,
    ) -> Result<Token> {
        let config = match &target.config_ref {
            None => None,
            Some(config_ref) => {
                let raw = self.sdk.load_config(config_ref).await?;
                match crate::resolver::resolve(&raw, ctx_outputs) {
                    Ok(resolved) => Some(resolved),
                    Err(e) => {
                        tracing::warn!(
                            %run_id,
                            node = %target.id,
                            error = %e,
                            "config resolution failed; publishing unresolved form"
                        );
                        self.durable
                            .append_event(
                                run_id,
                                &RunEvent::ResolveFailed {
                                    node_id: target.id.clone(),
                                    reference: e.to_string(),
                                },
                            )
                            .await?;
                        Some(raw)
                    }
                }
            }
        };

        let token = Token {
            id: Uuid::now_v7(),
            run_id,
            from_node: signal.node_id.clone(),
            to_node: target.id.clone(),
            payload_ref,
            config,
            hop,
            created_at: now_ms(),
        };

        if target.kind == NodeKind::Human {
            self.kv.approval_add(run_id, &token.id.to_string()).await?;
            self.durable
                .append_event(
                    run_id,
                    &RunEvent::ApprovalCreated {
                        node_id: target.id.clone(),
                        hold_id: token.id.to_string(),
                    },
                )
                .await?;
        }
        Ok(token)
    }

    fn stream_for(&self, node: &IrNode) -> String {
        stream_for_node(node, &self.config.stream_overrides)
    }

    async fn guard_backpressure(&self, run_id: Uuid, stream: &str) -> Result<()> {
        let depth = self.bus.stream_len(stream).await?;
        if depth >= self.config.backpressure_hard {
            let reason = "backpressure_exceeded".to_string();
            self.durable
                .update_run_status(run_id, RunStatus::Failed {
                    reason: reason.clone(),
                })
                .await?;
            self.durable
                .append_event(
                    run_id,
                    &RunEvent::RunFailed {
                        reason,
                        at: now_ms(),
                    },
                )
                .await?;
            return Err(anyhow!("backpressure_exceeded on {stream} (depth {depth})"));
        }
        if depth >= self.config.backpressure_soft {
            self.durable
                .append_event(
                    run_id,
                    &RunEvent::BackpressureThrottled {
                        stream: stream.to_string(),
                        depth,
                    },
                )
                .await?;
            tokio::time::sleep(self.config.backpressure_pause()).await;
        }
        Ok(())
    }

    /// Context as condition input (`node -> {output, metadata}`) plus the
    /// flat output map the resolver consumes.
    async fn load_context_view(
        &self,
        run_id: Uuid,
    ) -> Result<(Value, BTreeMap<String, Value>)> {
        let entries = self.sdk.load_context(run_id).await?;
        let mut ctx = serde_json::Map::new();
        let mut outputs = BTreeMap::new();
        for (node_id, entry) in entries {
            let value = match &entry.output_ref {
                Some(r) => self.sdk.load_payload(r).await.unwrap_or(Value::Null),
                None => Value::Null,
            };
            ctx.insert(
                node_id.clone(),
                serde_json::json!({ "output": value, "metadata": entry.metadata }),
            );
            outputs.insert(node_id, value);
        }
        Ok((Value::Object(ctx), outputs))
    }

    // ── Ingress facade ────────────────────────────────────────

    /// Validate, compile, freeze, seed. The submit path of the public
    /// ingress: IR into the key-value store, counter initialized, one seed
    /// token per entry node published from a synthetic empty `from`.
    pub async fn submit(
        &self,
        doc: &WorkflowDocument,
        input: &Value,
        tags_snapshot: BTreeMap<String, String>,
        actor: &str,
    ) -> Result<Uuid> {
        let ir = compile(doc, self.blob.as_ref()).await?;
        let base_artifact = blob::put_json(self.blob.as_ref(), doc).await?;

        let run_id = Uuid::now_v7();
        let now = now_ms();
        let run = Run {
            run_id,
            base_artifact: base_artifact.clone(),
            tags_snapshot,
            status: RunStatus::Queued,
            submitted_by: actor.to_string(),
            created_at: now,
            last_event_at: now,
            deadline_at: self.config.run_deadline_ms.map(|d| now + d),
            patch_seq: 0,
        };
        self.durable.insert_run(&run).await?;
        self.sdk.store_ir(run_id, &ir).await?;
        self.sdk.initialize_counter(run_id, 0).await?;
        self.durable
            .append_event(
                run_id,
                &RunEvent::RunSubmitted {
                    run_id,
                    base_artifact,
                    entry_nodes: ir.entry_nodes.clone(),
                },
            )
            .await?;

        let payload_ref = if input.is_null() {
            None
        } else {
            Some(self.sdk.store_output(input).await?)
        };

        let seed_signal = CompletionSignal {
            version: "1.0".into(),
            job_id: format!("seed:{run_id}"),
            run_id,
            node_id: String::new(),
            status: SignalStatus::Completed,
            result_ref: None,
            metadata: BTreeMap::new(),
        };
        let empty_outputs = BTreeMap::new();
        let mut batch = Vec::new();
        for entry in &ir.entry_nodes {
            let node = ir.node(entry).expect("entry nodes exist");
            let token = self
                .build_token(run_id, &seed_signal, node, payload_ref.clone(), 0, &empty_outputs)
                .await?;
            batch.push((self.stream_for(node), token));
        }
        self.sdk
            .emit(run_id, &format!("seed:{run_id}"), &batch)
            .await?;
        self.durable
            .append_event(
                run_id,
                &RunEvent::TokensEmitted {
                    op_key: emit_key(&format!("seed:{run_id}")),
                    from_node: String::new(),
                    to_nodes: ir.entry_nodes.clone(),
                    output_ref: payload_ref,
                },
            )
            .await?;
        self.durable
            .update_run_status(run_id, RunStatus::Running)
            .await?;

        tracing::info!(%run_id, workflow = %doc.id, "run submitted");
        Ok(run_id)
    }

    /// Cancel a run: status, hot-state flag, and the worker-facing marker.
    /// In-flight signals still consume; their outputs are ignored.
    pub async fn cancel(&self, run_id: Uuid, reason: &str) -> Result<()> {
        let Some(run) = self.durable.load_run(run_id).await? else {
            return Err(anyhow!("run not found: {run_id}"));
        };
        if run.status.is_terminal() {
            return Ok(());
        }
        self.kv.mark_cancelled(run_id).await?;
        self.durable
            .update_run_status(run_id, RunStatus::Cancelled)
            .await?;
        self.bus.publish_cancel(run_id).await?;
        self.durable
            .append_event(
                run_id,
                &RunEvent::RunCancelled {
                    reason: reason.to_string(),
                    at: now_ms(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn inspect(&self, run_id: Uuid) -> Result<Option<RunInspection>> {
        let Some(run) = self.durable.load_run(run_id).await? else {
            return Ok(None);
        };
        Ok(Some(RunInspection {
            counter: self.kv.get_counter(run_id).await?,
            context: self.sdk.load_context(run_id).await?,
            pending_approvals: self.kv.approval_count(run_id).await?,
            joins_pending: self.kv.join_any_pending(run_id).await?,
            run,
        }))
    }
}

// ─── Helpers ──────────────────────────────────────────────────

/// Static type -> stream mapping with the override hook; unknown kinds land
/// on the default stream and are auto-completed.
pub(crate) fn stream_for_node(node: &IrNode, overrides: &BTreeMap<String, String>) -> String {
    if let Some(stream) = overrides.get(&node.source_type) {
        return stream.clone();
    }
    match &node.kind {
        NodeKind::Task => format!("{STREAM_PREFIX}task"),
        NodeKind::Agent => format!("{STREAM_PREFIX}agent"),
        NodeKind::Human => format!("{STREAM_PREFIX}human"),
        NodeKind::Other(_) => DEFAULT_STREAM.to_string(),
    }
}

/// Distinct dependency nodes that have arrived at a join.
fn distinct_senders(members: &[String]) -> usize {
    members
        .iter()
        .filter_map(|m| parse_join_member(m).map(|(_, node, _)| node))
        .collect::<std::collections::BTreeSet<_>>()
        .len()
}

/// Merged payload for a released join: every dependency's output keyed by
/// node id.
fn merged_payload(target: &IrNode, outputs: &BTreeMap<String, Value>) -> Value {
    let mut merged = serde_json::Map::new();
    for dep in &target.dependencies {
        merged.insert(
            dep.clone(),
            outputs.get(dep).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(merged)
}

/// Hop counter for downstream tokens; workers echo theirs in metadata.
fn next_hop(signal: &CompletionSignal) -> u32 {
    signal
        .metadata
        .get("hop")
        .and_then(Value::as_u64)
        .map(|h| h as u32 + 1)
        .unwrap_or(1)
}
