use crate::blob::{content_ref, BlobStore};
use crate::bus::EventBus;
use crate::compiler::ir::WorkflowIr;
use crate::durable::DurableStore;
use crate::events::RunEvent;
use crate::kv::KvStore;
use crate::types::{
    BlobRef, CompletionSignal, ContextEntry, DeltaOutcome, LoopState, PatchRecord, Run, RunStatus,
    Timestamp, Token,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use uuid::Uuid;

// ─── Bus ──────────────────────────────────────────────────────

struct BusInner {
    signals: VecDeque<CompletionSignal>,
    streams: HashMap<String, VecDeque<Token>>,
}

/// In-memory message bus for tests and single-process deployments.
pub struct MemoryBus {
    inner: Mutex<BusInner>,
    signal_notify: Notify,
    zero_tx: broadcast::Sender<Uuid>,
    zero_rx: Mutex<broadcast::Receiver<Uuid>>,
    cancel_tx: broadcast::Sender<Uuid>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (zero_tx, zero_rx) = broadcast::channel(256);
        let (cancel_tx, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(BusInner {
                signals: VecDeque::new(),
                streams: HashMap::new(),
            }),
            signal_notify: Notify::new(),
            zero_tx,
            zero_rx: Mutex::new(zero_rx),
            cancel_tx,
        }
    }

    /// Cancellation markers, for worker-side tests.
    pub fn subscribe_cancel(&self) -> broadcast::Receiver<Uuid> {
        self.cancel_tx.subscribe()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn push_signal(&self, signal: &CompletionSignal) -> Result<()> {
        self.inner.lock().await.signals.push_back(signal.clone());
        self.signal_notify.notify_one();
        Ok(())
    }

    async fn pop_signal(&self, timeout: Duration) -> Result<Option<CompletionSignal>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(signal) = self.inner.lock().await.signals.pop_front() {
                return Ok(Some(signal));
            }
            let notified = self.signal_notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn publish_token(&self, stream: &str, token: &Token) -> Result<()> {
        self.inner
            .lock()
            .await
            .streams
            .entry(stream.to_string())
            .or_default()
            .push_back(token.clone());
        Ok(())
    }

    async fn stream_len(&self, stream: &str) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .await
            .streams
            .get(stream)
            .map(VecDeque::len)
            .unwrap_or(0))
    }

    async fn take_tokens(&self, stream: &str, max: usize) -> Result<Vec<Token>> {
        let mut inner = self.inner.lock().await;
        let Some(queue) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let take = max.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    async fn publish_completion_event(&self, run_id: Uuid) -> Result<()> {
        // No subscribers is fine; the zero-event is an optimization.
        let _ = self.zero_tx.send(run_id);
        Ok(())
    }

    async fn next_completion_event(&self, timeout: Duration) -> Result<Option<Uuid>> {
        let mut rx = self.zero_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Ok(run_id)) => Ok(Some(run_id)),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => Ok(None),
            Ok(Err(broadcast::error::RecvError::Closed)) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    async fn publish_cancel(&self, run_id: Uuid) -> Result<()> {
        let _ = self.cancel_tx.send(run_id);
        Ok(())
    }
}

// ─── Key-value store ──────────────────────────────────────────

struct KvInner {
    counters: HashMap<Uuid, i64>,
    applied: HashMap<Uuid, BTreeSet<String>>,
    /// JSON-encoded, like the real backend — round-trips are exercised.
    irs: HashMap<Uuid, String>,
    contexts: HashMap<Uuid, BTreeMap<String, ContextEntry>>,
    /// Join members in arrival order.
    joins: HashMap<(Uuid, String), Vec<String>>,
    approvals: HashMap<Uuid, BTreeSet<String>>,
    loops: HashMap<(Uuid, String), LoopState>,
    cancelled: HashSet<Uuid>,
}

/// In-memory key-value store. `apply_delta` is atomic under the single
/// inner lock, mirroring the server-side script contract.
pub struct MemoryKv {
    inner: RwLock<KvInner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(KvInner {
                counters: HashMap::new(),
                applied: HashMap::new(),
                irs: HashMap::new(),
                contexts: HashMap::new(),
                joins: HashMap::new(),
                approvals: HashMap::new(),
                loops: HashMap::new(),
                cancelled: HashSet::new(),
            }),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn apply_delta(&self, run_id: Uuid, op_key: &str, delta: i64) -> Result<DeltaOutcome> {
        let mut w = self.inner.write().await;
        let applied = w.applied.entry(run_id).or_default();
        if !applied.insert(op_key.to_string()) {
            let counter = w.counters.get(&run_id).copied().unwrap_or(0);
            return Ok(DeltaOutcome {
                counter,
                changed: false,
                hit_zero: false,
            });
        }
        let counter = w.counters.entry(run_id).or_insert(0);
        *counter += delta;
        let value = *counter;
        Ok(DeltaOutcome {
            counter: value,
            changed: true,
            hit_zero: value == 0 && delta < 0,
        })
    }

    async fn is_applied(&self, run_id: Uuid, op_key: &str) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .applied
            .get(&run_id)
            .map(|s| s.contains(op_key))
            .unwrap_or(false))
    }

    async fn init_counter(&self, run_id: Uuid, value: i64) -> Result<()> {
        self.inner.write().await.counters.insert(run_id, value);
        Ok(())
    }

    async fn get_counter(&self, run_id: Uuid) -> Result<i64> {
        Ok(self
            .inner
            .read()
            .await
            .counters
            .get(&run_id)
            .copied()
            .unwrap_or(0))
    }

    async fn applied_members(&self, run_id: Uuid) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .await
            .applied
            .get(&run_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn store_ir(&self, run_id: Uuid, ir: &WorkflowIr) -> Result<()> {
        let encoded = serde_json::to_string(ir)?;
        self.inner.write().await.irs.insert(run_id, encoded);
        Ok(())
    }

    async fn load_ir(&self, run_id: Uuid) -> Result<Option<WorkflowIr>> {
        let r = self.inner.read().await;
        match r.irs.get(&run_id) {
            Some(encoded) => Ok(Some(serde_json::from_str(encoded)?)),
            None => Ok(None),
        }
    }

    async fn store_context(&self, run_id: Uuid, node_id: &str, entry: &ContextEntry) -> Result<()> {
        self.inner
            .write()
            .await
            .contexts
            .entry(run_id)
            .or_default()
            .insert(node_id.to_string(), entry.clone());
        Ok(())
    }

    async fn load_context(&self, run_id: Uuid) -> Result<BTreeMap<String, ContextEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .contexts
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn join_arrive(&self, run_id: Uuid, node_id: &str, member: &str) -> Result<Vec<String>> {
        let mut w = self.inner.write().await;
        let members = w.joins.entry((run_id, node_id.to_string())).or_default();
        if !members.iter().any(|m| m == member) {
            members.push(member.to_string());
        }
        Ok(members.clone())
    }

    async fn join_clear(&self, run_id: Uuid, node_id: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .joins
            .remove(&(run_id, node_id.to_string()));
        Ok(())
    }

    async fn join_any_pending(&self, run_id: Uuid) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .joins
            .iter()
            .any(|((rid, _), members)| *rid == run_id && !members.is_empty()))
    }

    async fn approval_add(&self, run_id: Uuid, hold_id: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .approvals
            .entry(run_id)
            .or_default()
            .insert(hold_id.to_string());
        Ok(())
    }

    async fn approval_remove(&self, run_id: Uuid, hold_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(set) = w.approvals.get_mut(&run_id) {
            set.remove(hold_id);
        }
        Ok(())
    }

    async fn approval_count(&self, run_id: Uuid) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .await
            .approvals
            .get(&run_id)
            .map(BTreeSet::len)
            .unwrap_or(0))
    }

    async fn store_loop(&self, run_id: Uuid, node_id: &str, state: &LoopState) -> Result<()> {
        self.inner
            .write()
            .await
            .loops
            .insert((run_id, node_id.to_string()), state.clone());
        Ok(())
    }

    async fn load_loop(&self, run_id: Uuid, node_id: &str) -> Result<Option<LoopState>> {
        Ok(self
            .inner
            .read()
            .await
            .loops
            .get(&(run_id, node_id.to_string()))
            .cloned())
    }

    async fn delete_loop(&self, run_id: Uuid, node_id: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .loops
            .remove(&(run_id, node_id.to_string()));
        Ok(())
    }

    async fn mark_cancelled(&self, run_id: Uuid) -> Result<()> {
        self.inner.write().await.cancelled.insert(run_id);
        Ok(())
    }

    async fn is_cancelled(&self, run_id: Uuid) -> Result<bool> {
        Ok(self.inner.read().await.cancelled.contains(&run_id))
    }

    async fn delete_run_state(&self, run_id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.counters.remove(&run_id);
        w.applied.remove(&run_id);
        w.irs.remove(&run_id);
        w.contexts.remove(&run_id);
        w.joins.retain(|(rid, _), _| *rid != run_id);
        w.approvals.remove(&run_id);
        w.loops.retain(|(rid, _), _| *rid != run_id);
        w.cancelled.remove(&run_id);
        Ok(())
    }
}

// ─── Blob store ───────────────────────────────────────────────

/// In-memory content-addressed blob store.
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobRef, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<BlobRef> {
        let r = content_ref(bytes);
        self.blobs.write().await.insert(r.clone(), bytes.to_vec());
        Ok(r)
    }

    async fn get(&self, r: &BlobRef) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(r)
            .cloned()
            .ok_or_else(|| anyhow!("blob not found: {r}"))
    }
}

// ─── Durable store ────────────────────────────────────────────

struct DurableInner {
    runs: HashMap<Uuid, Run>,
    patches: HashMap<Uuid, Vec<PatchRecord>>,
    events: HashMap<Uuid, Vec<(u64, RunEvent)>>,
    event_seq: HashMap<Uuid, u64>,
}

/// In-memory durable store for tests and single-process deployments.
pub struct MemoryDurable {
    inner: RwLock<DurableInner>,
}

impl MemoryDurable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(DurableInner {
                runs: HashMap::new(),
                patches: HashMap::new(),
                events: HashMap::new(),
                event_seq: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryDurable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryDurable {
    async fn insert_run(&self, run: &Run) -> Result<()> {
        self.inner
            .write()
            .await
            .runs
            .insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(self.inner.read().await.runs.get(&run_id).cloned())
    }

    async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<()> {
        let mut w = self.inner.write().await;
        let run = w
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        run.status = status;
        Ok(())
    }

    async fn touch_run(&self, run_id: Uuid, at: Timestamp) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(run) = w.runs.get_mut(&run_id) {
            run.last_event_at = at;
        }
        Ok(())
    }

    async fn set_patch_seq(&self, run_id: Uuid, seq: u32) -> Result<()> {
        let mut w = self.inner.write().await;
        let run = w
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        run.patch_seq = seq;
        Ok(())
    }

    async fn set_base_artifact(&self, run_id: Uuid, artifact: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        let run = w
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        run.base_artifact = artifact.to_string();
        Ok(())
    }

    async fn list_stalled(&self, cutoff: Timestamp, now: Timestamp) -> Result<Vec<Run>> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .values()
            .filter(|r| {
                r.status == RunStatus::Running
                    && (r.last_event_at < cutoff || r.deadline_at.is_some_and(|d| d < now))
            })
            .cloned()
            .collect())
    }

    async fn append_patch(&self, record: &PatchRecord) -> Result<()> {
        self.inner
            .write()
            .await
            .patches
            .entry(record.run_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn load_patches(&self, run_id: Uuid) -> Result<Vec<PatchRecord>> {
        let mut patches = self
            .inner
            .read()
            .await
            .patches
            .get(&run_id)
            .cloned()
            .unwrap_or_default();
        patches.sort_by_key(|p| p.seq);
        Ok(patches)
    }

    async fn clear_patches(&self, run_id: Uuid) -> Result<()> {
        self.inner.write().await.patches.remove(&run_id);
        Ok(())
    }

    async fn append_event(&self, run_id: Uuid, event: &RunEvent) -> Result<u64> {
        let mut w = self.inner.write().await;
        let seq = w.event_seq.entry(run_id).or_insert(0);
        *seq += 1;
        let current = *seq;
        w.events
            .entry(run_id)
            .or_default()
            .push((current, event.clone()));
        Ok(current)
    }

    async fn read_events(&self, run_id: Uuid, from_seq: u64) -> Result<Vec<(u64, RunEvent)>> {
        Ok(self
            .inner
            .read()
            .await
            .events
            .get(&run_id)
            .map(|evts| {
                evts.iter()
                    .filter(|(seq, _)| *seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
