use crate::bus::EventBus;
use crate::durable::DurableStore;
use crate::events::RunEvent;
use crate::kv::KvStore;
use crate::types::{now_ms, RunStatus};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Completion verification: counter at zero, no human holds, no join sets
/// outstanding. On success writes COMPLETED first, then deletes hot state,
/// so a crash in between degrades to garbage, not a lost completion.
///
/// Returns true when the run was marked completed by this call.
pub async fn verify_and_complete(
    kv: &dyn KvStore,
    durable: &dyn DurableStore,
    run_id: Uuid,
) -> Result<bool> {
    let Some(run) = durable.load_run(run_id).await? else {
        return Ok(false);
    };
    if run.status.is_terminal() {
        return Ok(false);
    }

    // Optimistic checks — a concurrent emit may have revived the run.
    if kv.get_counter(run_id).await? != 0 {
        return Ok(false);
    }
    if kv.approval_count(run_id).await? != 0 {
        return Ok(false);
    }
    if kv.join_any_pending(run_id).await? {
        return Ok(false);
    }

    let at = now_ms();
    durable
        .update_run_status(run_id, RunStatus::Completed)
        .await?;
    durable
        .append_event(run_id, &RunEvent::RunCompleted { at })
        .await?;
    kv.delete_run_state(run_id).await?;
    tracing::info!(%run_id, "run completed");
    Ok(true)
}

// ─── Completion supervisor ────────────────────────────────────

/// Subscribes to the zero-events the delta applier publishes and verifies
/// each candidate run. The event is an optimization; the Coordinator's
/// terminal-node check covers lost events.
pub struct CompletionSupervisor {
    bus: Arc<dyn EventBus>,
    kv: Arc<dyn KvStore>,
    durable: Arc<dyn DurableStore>,
    poll_timeout: Duration,
}

impl CompletionSupervisor {
    pub fn new(bus: Arc<dyn EventBus>, kv: Arc<dyn KvStore>, durable: Arc<dyn DurableStore>) -> Self {
        Self {
            bus,
            kv,
            durable,
            poll_timeout: Duration::from_millis(1_000),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                event = self.bus.next_completion_event(self.poll_timeout) => {
                    if let Some(run_id) = event? {
                        if let Err(e) =
                            verify_and_complete(self.kv.as_ref(), self.durable.as_ref(), run_id).await
                        {
                            tracing::error!(%run_id, error = %e, "completion verification failed");
                        }
                    }
                }
            }
        }
    }
}

// ─── Timeout detector ─────────────────────────────────────────

/// Periodic sweep marking stalled RUNNING runs FAILED(timeout) and cleaning
/// their hot state.
pub struct TimeoutDetector {
    kv: Arc<dyn KvStore>,
    durable: Arc<dyn DurableStore>,
    period: Duration,
    stall_threshold_ms: i64,
}

impl TimeoutDetector {
    pub fn new(
        kv: Arc<dyn KvStore>,
        durable: Arc<dyn DurableStore>,
        period: Duration,
        stall_threshold_ms: i64,
    ) -> Self {
        Self {
            kv,
            durable,
            period,
            stall_threshold_ms,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "timeout sweep failed");
                    }
                }
            }
        }
    }

    /// One pass: fail every run whose last event is older than the stall
    /// threshold or whose own deadline has passed.
    pub async fn sweep(&self) -> Result<usize> {
        let now = now_ms();
        let cutoff = now - self.stall_threshold_ms;
        let stalled = self.durable.list_stalled(cutoff, now).await?;
        let mut failed = 0usize;
        for run in stalled {
            let run_id = run.run_id;
            tracing::warn!(%run_id, last_event_at = run.last_event_at, "run timed out");
            self.durable
                .update_run_status(
                    run_id,
                    RunStatus::Failed {
                        reason: "timeout".into(),
                    },
                )
                .await?;
            self.durable
                .append_event(
                    run_id,
                    &RunEvent::RunFailed {
                        reason: "timeout".into(),
                        at: now,
                    },
                )
                .await?;
            self.kv.delete_run_state(run_id).await?;
            failed += 1;
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBus, MemoryDurable, MemoryKv};
    use crate::types::Run;
    use std::collections::BTreeMap;

    fn running_run(last_event_at: i64) -> Run {
        Run {
            run_id: Uuid::now_v7(),
            base_artifact: "base".into(),
            tags_snapshot: BTreeMap::new(),
            status: RunStatus::Running,
            submitted_by: "tester".into(),
            created_at: now_ms(),
            last_event_at,
            deadline_at: None,
            patch_seq: 0,
        }
    }

    #[tokio::test]
    async fn verification_requires_zero_counter_and_empty_holds() {
        let kv = MemoryKv::new();
        let durable = MemoryDurable::new();
        let run = running_run(now_ms());
        durable.insert_run(&run).await.unwrap();

        kv.init_counter(run.run_id, 1).await.unwrap();
        assert!(!verify_and_complete(&kv, &durable, run.run_id)
            .await
            .unwrap());

        kv.init_counter(run.run_id, 0).await.unwrap();
        kv.approval_add(run.run_id, "hold-1").await.unwrap();
        assert!(!verify_and_complete(&kv, &durable, run.run_id)
            .await
            .unwrap());

        kv.approval_remove(run.run_id, "hold-1").await.unwrap();
        kv.join_arrive(run.run_id, "merge", "a|merge|j").await.unwrap();
        assert!(!verify_and_complete(&kv, &durable, run.run_id)
            .await
            .unwrap());

        kv.join_clear(run.run_id, "merge").await.unwrap();
        assert!(verify_and_complete(&kv, &durable, run.run_id)
            .await
            .unwrap());

        let stored = durable.load_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);

        // Second verification is a no-op.
        assert!(!verify_and_complete(&kv, &durable, run.run_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn completion_cleans_hot_state() {
        let kv = MemoryKv::new();
        let durable = MemoryDurable::new();
        let run = running_run(now_ms());
        durable.insert_run(&run).await.unwrap();
        kv.init_counter(run.run_id, 0).await.unwrap();
        kv.apply_delta(run.run_id, "emit:x", 0).await.unwrap();

        verify_and_complete(&kv, &durable, run.run_id)
            .await
            .unwrap();
        assert!(kv.applied_members(run.run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_fails_only_stalled_runs() {
        let kv = Arc::new(MemoryKv::new());
        let durable = Arc::new(MemoryDurable::new());

        let stalled = running_run(now_ms() - 120_000);
        let fresh = running_run(now_ms());
        durable.insert_run(&stalled).await.unwrap();
        durable.insert_run(&fresh).await.unwrap();

        let detector = TimeoutDetector::new(
            kv.clone(),
            durable.clone(),
            Duration::from_secs(5),
            60_000,
        );
        let failed = detector.sweep().await.unwrap();
        assert_eq!(failed, 1);

        let stored = durable.load_run(stalled.run_id).await.unwrap().unwrap();
        assert_eq!(
            stored.status,
            RunStatus::Failed {
                reason: "timeout".into()
            }
        );
        let untouched = durable.load_run(fresh.run_id).await.unwrap().unwrap();
        assert_eq!(untouched.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn supervisor_consumes_zero_events() {
        let bus = Arc::new(MemoryBus::new());
        let kv = Arc::new(MemoryKv::new());
        let durable = Arc::new(MemoryDurable::new());

        let run = running_run(now_ms());
        durable.insert_run(&run).await.unwrap();
        kv.init_counter(run.run_id, 0).await.unwrap();

        let supervisor = Arc::new(CompletionSupervisor::new(
            bus.clone(),
            kv.clone(),
            durable.clone(),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(supervisor.run(rx));

        bus.publish_completion_event(run.run_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let _ = handle.await;

        let stored = durable.load_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
    }
}
