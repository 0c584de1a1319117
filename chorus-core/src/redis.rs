//! Redis-backed transports (feature `redis`).
//!
//! `apply_delta` runs as a server-side Lua script: membership test, set
//! insert and counter adjustment in one atomic unit. A client-side
//! compare-and-swap emulation would break the idempotency invariant under
//! contention, so none is provided.

use crate::bus::{EventBus, COMPLETION_EVENTS, SIGNALS_QUEUE};
use crate::compiler::ir::WorkflowIr;
use crate::kv::KvStore;
use crate::types::{CompletionSignal, ContextEntry, DeltaOutcome, LoopState, Token};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection, PubSub};
use redis::AsyncCommands;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use uuid::Uuid;

const APPLY_DELTA_LUA: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
  local current = tonumber(redis.call('GET', KEYS[2]) or '0')
  return {current, 0, 0}
end
redis.call('SADD', KEYS[1], ARGV[1])
local counter = redis.call('INCRBY', KEYS[2], tonumber(ARGV[2]))
local hit_zero = 0
if counter == 0 and tonumber(ARGV[2]) < 0 then
  hit_zero = 1
end
return {counter, 1, hit_zero}
"#;

fn applied_key(run_id: Uuid) -> String {
    format!("applied:{run_id}")
}
fn counter_key(run_id: Uuid) -> String {
    format!("counter:{run_id}")
}
fn ir_key(run_id: Uuid) -> String {
    format!("ir:{run_id}")
}
fn context_key(run_id: Uuid) -> String {
    format!("context:{run_id}")
}
fn join_key(run_id: Uuid, node_id: &str) -> String {
    format!("pending_tokens:{run_id}:{node_id}")
}
fn join_index_key(run_id: Uuid) -> String {
    format!("pending_tokens_index:{run_id}")
}
fn approvals_key(run_id: Uuid) -> String {
    format!("pending_approvals:{run_id}")
}
fn loop_key(run_id: Uuid, node_id: &str) -> String {
    format!("loop:{run_id}:{node_id}")
}
fn loop_index_key(run_id: Uuid) -> String {
    format!("loop_index:{run_id}")
}
fn cancelled_key(run_id: Uuid) -> String {
    format!("cancelled:{run_id}")
}

// ─── Key-value store ──────────────────────────────────────────

pub struct RedisKv {
    manager: ConnectionManager,
    apply_delta: redis::Script,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("redis connection failed")?;
        Ok(Self {
            manager,
            apply_delta: redis::Script::new(APPLY_DELTA_LUA),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn apply_delta(&self, run_id: Uuid, op_key: &str, delta: i64) -> Result<DeltaOutcome> {
        let mut conn = self.conn();
        let (counter, changed, hit_zero): (i64, i64, i64) = self
            .apply_delta
            .key(applied_key(run_id))
            .key(counter_key(run_id))
            .arg(op_key)
            .arg(delta)
            .invoke_async(&mut conn)
            .await?;
        Ok(DeltaOutcome {
            counter,
            changed: changed == 1,
            hit_zero: hit_zero == 1,
        })
    }

    async fn is_applied(&self, run_id: Uuid, op_key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let member: bool = conn.sismember(applied_key(run_id), op_key).await?;
        Ok(member)
    }

    async fn init_counter(&self, run_id: Uuid, value: i64) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.set(counter_key(run_id), value).await?;
        Ok(())
    }

    async fn get_counter(&self, run_id: Uuid) -> Result<i64> {
        let mut conn = self.conn();
        let value: Option<i64> = conn.get(counter_key(run_id)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn applied_members(&self, run_id: Uuid) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.smembers(applied_key(run_id)).await?;
        Ok(members)
    }

    async fn store_ir(&self, run_id: Uuid, ir: &WorkflowIr) -> Result<()> {
        let mut conn = self.conn();
        let encoded = serde_json::to_string(ir)?;
        let _: () = conn.set(ir_key(run_id), encoded).await?;
        Ok(())
    }

    async fn load_ir(&self, run_id: Uuid) -> Result<Option<WorkflowIr>> {
        let mut conn = self.conn();
        let encoded: Option<String> = conn.get(ir_key(run_id)).await?;
        match encoded {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store_context(&self, run_id: Uuid, node_id: &str, entry: &ContextEntry) -> Result<()> {
        let mut conn = self.conn();
        let encoded = serde_json::to_string(entry)?;
        let _: () = conn.hset(context_key(run_id), node_id, encoded).await?;
        Ok(())
    }

    async fn load_context(&self, run_id: Uuid) -> Result<BTreeMap<String, ContextEntry>> {
        let mut conn = self.conn();
        let raw: BTreeMap<String, String> = conn.hgetall(context_key(run_id)).await?;
        let mut context = BTreeMap::new();
        for (node_id, encoded) in raw {
            context.insert(node_id, serde_json::from_str(&encoded)?);
        }
        Ok(context)
    }

    async fn join_arrive(&self, run_id: Uuid, node_id: &str, member: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let _: () = conn.sadd(join_key(run_id, node_id), member).await?;
        let _: () = conn.sadd(join_index_key(run_id), node_id).await?;
        let members: Vec<String> = conn.smembers(join_key(run_id, node_id)).await?;
        Ok(members)
    }

    async fn join_clear(&self, run_id: Uuid, node_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.del(join_key(run_id, node_id)).await?;
        let _: () = conn.srem(join_index_key(run_id), node_id).await?;
        Ok(())
    }

    async fn join_any_pending(&self, run_id: Uuid) -> Result<bool> {
        let mut conn = self.conn();
        let nodes: Vec<String> = conn.smembers(join_index_key(run_id)).await?;
        for node_id in nodes {
            let size: usize = conn.scard(join_key(run_id, &node_id)).await?;
            if size > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn approval_add(&self, run_id: Uuid, hold_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.sadd(approvals_key(run_id), hold_id).await?;
        Ok(())
    }

    async fn approval_remove(&self, run_id: Uuid, hold_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.srem(approvals_key(run_id), hold_id).await?;
        Ok(())
    }

    async fn approval_count(&self, run_id: Uuid) -> Result<usize> {
        let mut conn = self.conn();
        let count: usize = conn.scard(approvals_key(run_id)).await?;
        Ok(count)
    }

    async fn store_loop(&self, run_id: Uuid, node_id: &str, state: &LoopState) -> Result<()> {
        let mut conn = self.conn();
        let encoded = serde_json::to_string(state)?;
        let _: () = conn.set(loop_key(run_id, node_id), encoded).await?;
        let _: () = conn.sadd(loop_index_key(run_id), node_id).await?;
        Ok(())
    }

    async fn load_loop(&self, run_id: Uuid, node_id: &str) -> Result<Option<LoopState>> {
        let mut conn = self.conn();
        let encoded: Option<String> = conn.get(loop_key(run_id, node_id)).await?;
        match encoded {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete_loop(&self, run_id: Uuid, node_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.del(loop_key(run_id, node_id)).await?;
        let _: () = conn.srem(loop_index_key(run_id), node_id).await?;
        Ok(())
    }

    async fn mark_cancelled(&self, run_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.set(cancelled_key(run_id), 1).await?;
        Ok(())
    }

    async fn is_cancelled(&self, run_id: Uuid) -> Result<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(cancelled_key(run_id)).await?;
        Ok(exists)
    }

    async fn delete_run_state(&self, run_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let join_nodes: Vec<String> = conn.smembers(join_index_key(run_id)).await?;
        for node_id in join_nodes {
            let _: () = conn.del(join_key(run_id, &node_id)).await?;
        }
        let loop_nodes: Vec<String> = conn.smembers(loop_index_key(run_id)).await?;
        for node_id in loop_nodes {
            let _: () = conn.del(loop_key(run_id, &node_id)).await?;
        }
        let _: () = conn
            .del(vec![
                counter_key(run_id),
                applied_key(run_id),
                ir_key(run_id),
                context_key(run_id),
                approvals_key(run_id),
                join_index_key(run_id),
                loop_index_key(run_id),
                cancelled_key(run_id),
            ])
            .await?;
        Ok(())
    }
}

// ─── Blob store ───────────────────────────────────────────────

/// Content-addressed blobs under `blob:{sha256}`. Equal content writes the
/// same key, so puts are idempotent.
pub struct RedisBlob {
    manager: ConnectionManager,
}

impl RedisBlob {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl crate::blob::BlobStore for RedisBlob {
    async fn put(&self, bytes: &[u8]) -> Result<crate::types::BlobRef> {
        let mut conn = self.manager.clone();
        let blob_ref = crate::blob::content_ref(bytes);
        let _: () = conn.set(format!("blob:{blob_ref}"), bytes).await?;
        Ok(blob_ref)
    }

    async fn get(&self, r: &crate::types::BlobRef) -> Result<Vec<u8>> {
        let mut conn = self.manager.clone();
        let bytes: Option<Vec<u8>> = conn.get(format!("blob:{r}")).await?;
        bytes.ok_or_else(|| anyhow::anyhow!("blob not found: {r}"))
    }
}

// ─── Message bus ──────────────────────────────────────────────

/// Lists carry completion signals (LPUSH/BRPOP keeps FIFO order), streams
/// carry tokens, pub/sub carries zero-events and cancellation markers.
pub struct RedisBus {
    manager: ConnectionManager,
    /// Dedicated connection for BRPOP; blocking commands must not share
    /// the multiplexer.
    blocking: Mutex<MultiplexedConnection>,
    completions: Mutex<PubSub>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = client.get_connection_manager().await?;
        let blocking = client.get_multiplexed_async_connection().await?;
        let mut completions = client.get_async_pubsub().await?;
        completions.subscribe(COMPLETION_EVENTS).await?;
        Ok(Self {
            manager,
            blocking: Mutex::new(blocking),
            completions: Mutex::new(completions),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn push_signal(&self, signal: &CompletionSignal) -> Result<()> {
        let mut conn = self.conn();
        let encoded = serde_json::to_string(signal)?;
        let _: () = conn.lpush(SIGNALS_QUEUE, encoded).await?;
        Ok(())
    }

    async fn pop_signal(&self, timeout: Duration) -> Result<Option<CompletionSignal>> {
        let mut conn = self.blocking.lock().await;
        let popped: Option<(String, String)> = conn
            .brpop(SIGNALS_QUEUE, timeout.as_secs_f64())
            .await?;
        match popped {
            Some((_, encoded)) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }

    async fn publish_token(&self, stream: &str, token: &Token) -> Result<()> {
        let mut conn = self.conn();
        let encoded = serde_json::to_string(token)?;
        let _: String = conn.xadd(stream, "*", &[("data", encoded)]).await?;
        Ok(())
    }

    async fn stream_len(&self, stream: &str) -> Result<usize> {
        let mut conn = self.conn();
        let len: usize = conn.xlen(stream).await?;
        Ok(len)
    }

    async fn take_tokens(&self, stream: &str, max: usize) -> Result<Vec<Token>> {
        let mut conn = self.conn();
        let reply: redis::streams::StreamRangeReply =
            conn.xrange_count(stream, "-", "+", max).await?;
        let mut tokens = Vec::with_capacity(reply.ids.len());
        for entry in reply.ids {
            if let Some(encoded) = entry.get::<String>("data") {
                tokens.push(serde_json::from_str(&encoded)?);
            }
            let _: () = conn.xdel(stream, &[entry.id.clone()]).await?;
        }
        Ok(tokens)
    }

    async fn publish_completion_event(&self, run_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.publish(COMPLETION_EVENTS, run_id.to_string()).await?;
        Ok(())
    }

    async fn next_completion_event(&self, timeout: Duration) -> Result<Option<Uuid>> {
        let mut pubsub = self.completions.lock().await;
        let mut stream = pubsub.on_message();
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(message)) => {
                let payload: String = message.get_payload()?;
                Ok(payload.parse().ok())
            }
            Ok(None) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    async fn publish_cancel(&self, run_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn
            .publish(format!("cancel:{run_id}"), "cancelled")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_url() -> Option<String> {
        std::env::var("TEST_REDIS_URL").ok()
    }

    /// Requires a live Redis: TEST_REDIS_URL=redis://127.0.0.1/ cargo test
    /// -p chorus-core --features redis -- --ignored
    #[tokio::test]
    #[ignore]
    async fn apply_delta_is_atomic_and_idempotent() {
        let Some(url) = test_url() else { return };
        let kv = RedisKv::connect(&url).await.unwrap();
        let run = Uuid::now_v7();

        let first = kv.apply_delta(run, "consume:a->b:j1", -1).await.unwrap();
        assert!(first.changed);
        assert_eq!(first.counter, -1);

        let dup = kv.apply_delta(run, "consume:a->b:j1", -1).await.unwrap();
        assert!(!dup.changed);
        assert_eq!(dup.counter, -1);

        kv.delete_run_state(run).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn signals_round_trip_fifo() {
        let Some(url) = test_url() else { return };
        let bus = RedisBus::connect(&url).await.unwrap();

        for i in 0..3 {
            let signal: CompletionSignal = serde_json::from_str(&format!(
                r#"{{"job_id":"j{i}","run_id":"018f4d7e-0000-7000-8000-000000000000",
                     "node_id":"n","status":"completed"}}"#
            ))
            .unwrap();
            bus.push_signal(&signal).await.unwrap();
        }
        for i in 0..3 {
            let popped = bus
                .pop_signal(Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(popped.job_id, format!("j{i}"));
        }
    }
}
