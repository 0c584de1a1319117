//! Chorus core: a choreographed workflow execution engine.
//!
//! A compiled workflow graph (the IR) is driven to completion by a
//! stateless [`coordinator::Coordinator`] that folds worker completion
//! signals into idempotent counter deltas, dynamic routing decisions, and
//! new work tokens. All state lives behind four transport traits
//! ([`bus::EventBus`], [`kv::KvStore`], [`blob::BlobStore`],
//! [`durable::DurableStore`]); in-memory implementations back tests and
//! single-process deployments, with Redis and Postgres backends behind
//! features.

pub mod blob;
pub mod bus;
pub mod compiler;
pub mod condition;
pub mod config;
pub mod coordinator;
pub mod delta;
pub mod durable;
pub mod events;
pub mod kv;
pub mod memory;
pub mod node_replay;
pub mod patch;
pub mod replay;
pub mod resolver;
pub mod sdk;
pub mod supervisor;
pub mod types;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "postgres")]
pub mod durable_postgres;

pub use compiler::{compile, CompileError};
pub use config::EngineConfig;
pub use coordinator::Coordinator;
pub use patch::{PatchEngine, PatchError};
pub use types::{CompletionSignal, Run, RunStatus, SignalStatus, Token};
