use crate::types::{CompletionSignal, Token};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Queue workers append completion signals to.
pub const SIGNALS_QUEUE: &str = "completion_signals";

/// Pub/sub channel carrying run ids whose counter hit zero.
pub const COMPLETION_EVENTS: &str = "completion_events";

/// Prefix of the per-type token streams (`wf.tasks.task`, `wf.tasks.agent`,
/// `wf.tasks.human`, ...).
pub const STREAM_PREFIX: &str = "wf.tasks.";

/// Stream for node types nothing is registered for; its consumer is the
/// Coordinator's own skipped-node handler.
pub const DEFAULT_STREAM: &str = "wf.tasks.default";

/// Message bus: the signals queue, the per-type token streams, and the two
/// pub/sub channels (zero-events and cancellation markers).
#[async_trait]
pub trait EventBus: Send + Sync {
    // ── Completion signals (FIFO queue) ──

    async fn push_signal(&self, signal: &CompletionSignal) -> Result<()>;

    /// Blocking pop with a bounded timeout; `None` on timeout.
    async fn pop_signal(&self, timeout: Duration) -> Result<Option<CompletionSignal>>;

    // ── Token streams ──

    async fn publish_token(&self, stream: &str, token: &Token) -> Result<()>;

    /// Current depth of a stream — the backpressure signal.
    async fn stream_len(&self, stream: &str) -> Result<usize>;

    /// Pop up to `max` tokens from a stream. Workers (and the Coordinator's
    /// default-stream sweep) drain with this.
    async fn take_tokens(&self, stream: &str, max: usize) -> Result<Vec<Token>>;

    // ── Zero-events ──

    /// Publish a run id on `completion_events` after a zero transition.
    async fn publish_completion_event(&self, run_id: Uuid) -> Result<()>;

    /// Await the next zero-event; `None` on timeout. One subscriber per
    /// Coordinator/supervisor instance.
    async fn next_completion_event(&self, timeout: Duration) -> Result<Option<Uuid>>;

    // ── Cancellation markers ──

    /// Broadcast a cancellation marker on `cancel:{run_id}`. Workers observe
    /// it on their next poll and decline new work for the run.
    async fn publish_cancel(&self, run_id: Uuid) -> Result<()>;
}
