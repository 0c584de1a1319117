use std::sync::Arc;

use chorus_core::blob::BlobStore;
use chorus_core::bus::EventBus;
use chorus_core::coordinator::Coordinator;
use chorus_core::durable::DurableStore;
use chorus_core::kv::KvStore;
use chorus_core::memory::{MemoryBlobStore, MemoryBus, MemoryDurable, MemoryKv};
use chorus_core::node_replay::NodeReplayService;
use chorus_core::patch::PatchEngine;
use chorus_core::supervisor::{CompletionSupervisor, TimeoutDetector};
use chorus_core::EngineConfig;
use chorus_server::grpc::proto::chorus_server::ChorusServer;
use chorus_server::grpc::ChorusService;
use tokio::sync::watch;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let addr = std::env::var("CHORUS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:50052".to_string())
        .parse()?;
    let config = load_config()?;

    let (bus, kv, blob) = connect_hot_stores().await?;
    let durable = connect_durable_store().await?;

    let coordinator = Arc::new(Coordinator::new(
        bus.clone(),
        kv.clone(),
        blob.clone(),
        durable.clone(),
        config.clone(),
    ));
    let patcher = Arc::new(PatchEngine::new(
        kv.clone(),
        blob.clone(),
        durable.clone(),
        config.clone(),
    ));
    let replayer = Arc::new(NodeReplayService::new(
        kv.clone(),
        blob.clone(),
        bus.clone(),
        durable.clone(),
        config.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The choreography loop and both supervisors run alongside the ingress.
    let consumer = tokio::spawn(coordinator.clone().run(shutdown_rx.clone()));
    let completion = Arc::new(CompletionSupervisor::new(
        bus.clone(),
        kv.clone(),
        durable.clone(),
    ));
    let completion_task = tokio::spawn(completion.run(shutdown_rx.clone()));
    let detector = Arc::new(TimeoutDetector::new(
        kv.clone(),
        durable.clone(),
        config.sweep_period(),
        config.stall_threshold_ms,
    ));
    let detector_task = tokio::spawn(detector.run(shutdown_rx.clone()));

    let service = ChorusService {
        coordinator,
        patcher,
        replayer,
    };

    tracing::info!(%addr, "chorus gRPC server listening");
    Server::builder()
        .add_service(ChorusServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = consumer.await;
    let _ = completion_task.await;
    let _ = detector_task.await;
    Ok(())
}

/// Engine config from the file `CHORUS_CONFIG` points at, defaults
/// otherwise.
fn load_config() -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match std::env::var("CHORUS_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)?;
            tracing::info!(path, "engine config loaded");
            Ok(serde_json::from_str(&raw)?)
        }
        Err(_) => Ok(EngineConfig::default()),
    }
}

/// Bus, key-value and blob stores: Redis when `REDIS_URL` is set and the
/// feature is compiled in, in-memory otherwise.
async fn connect_hot_stores() -> Result<
    (Arc<dyn EventBus>, Arc<dyn KvStore>, Arc<dyn BlobStore>),
    Box<dyn std::error::Error>,
> {
    #[cfg(feature = "redis")]
    if let Ok(url) = std::env::var("REDIS_URL") {
        tracing::info!("using Redis transports");
        let bus = chorus_core::redis::RedisBus::connect(&url).await?;
        let kv = chorus_core::redis::RedisKv::connect(&url).await?;
        let blob = chorus_core::redis::RedisBlob::connect(&url).await?;
        return Ok((Arc::new(bus), Arc::new(kv), Arc::new(blob)));
    }

    tracing::info!("using in-memory transports (single-process mode)");
    Ok((
        Arc::new(MemoryBus::new()),
        Arc::new(MemoryKv::new()),
        Arc::new(MemoryBlobStore::new()),
    ))
}

/// Durable store: Postgres when `DATABASE_URL` is set and the feature is
/// compiled in, in-memory otherwise.
async fn connect_durable_store() -> Result<Arc<dyn DurableStore>, Box<dyn std::error::Error>> {
    #[cfg(feature = "postgres")]
    if let Ok(url) = std::env::var("DATABASE_URL") {
        tracing::info!("connecting to PostgreSQL");
        let pool = sqlx::PgPool::connect(&url).await?;
        let store = chorus_core::durable_postgres::PostgresDurable::new(pool);
        store.migrate().await?;
        tracing::info!("using PostgresDurable (migrations applied)");
        return Ok(Arc::new(store));
    }

    tracing::info!("using in-memory durable store");
    Ok(Arc::new(MemoryDurable::new()))
}
