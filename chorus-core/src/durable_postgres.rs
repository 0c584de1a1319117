//! PostgreSQL-backed `DurableStore` (feature `postgres`).

use crate::durable::DurableStore;
use crate::events::RunEvent;
use crate::types::{PatchRecord, Run, RunStatus, Timestamp};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

pub struct PostgresDurable {
    pool: sqlx::PgPool,
}

impl PostgresDurable {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema if it does not exist. Timestamps are epoch
    /// milliseconds; statuses and operations are JSONB.
    pub async fn migrate(&self) -> Result<()> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id        UUID PRIMARY KEY,
                base_artifact TEXT NOT NULL,
                tags_snapshot JSONB NOT NULL DEFAULT '{}'::jsonb,
                status        JSONB NOT NULL,
                submitted_by  TEXT NOT NULL,
                created_at    BIGINT NOT NULL,
                last_event_at BIGINT NOT NULL,
                deadline_at   BIGINT,
                patch_seq     INT NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS patches (
                run_id      UUID NOT NULL,
                seq         INT NOT NULL,
                operations  JSONB NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                actor       TEXT NOT NULL DEFAULT '',
                created_at  BIGINT NOT NULL,
                PRIMARY KEY (run_id, seq)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS event_log (
                run_id       UUID NOT NULL,
                sequence_num BIGINT NOT NULL,
                event_type   TEXT NOT NULL,
                event_data   JSONB NOT NULL,
                PRIMARY KEY (run_id, sequence_num)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_runs_status_activity
            ON runs ((status->>'status'), last_event_at)
            "#,
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("chorus migration failed")?;
        }
        Ok(())
    }
}

fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<Run> {
    let status_json: serde_json::Value = row.get("status");
    let tags_json: serde_json::Value = row.get("tags_snapshot");
    Ok(Run {
        run_id: row.get("run_id"),
        base_artifact: row.get("base_artifact"),
        tags_snapshot: serde_json::from_value(tags_json)?,
        status: serde_json::from_value(status_json)?,
        submitted_by: row.get("submitted_by"),
        created_at: row.get("created_at"),
        last_event_at: row.get("last_event_at"),
        deadline_at: row.get("deadline_at"),
        patch_seq: row.get::<i32, _>("patch_seq") as u32,
    })
}

#[async_trait]
impl DurableStore for PostgresDurable {
    // ── Runs ──

    async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                run_id, base_artifact, tags_snapshot, status, submitted_by,
                created_at, last_event_at, deadline_at, patch_seq
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.base_artifact)
        .bind(serde_json::to_value(&run.tags_snapshot)?)
        .bind(serde_json::to_value(&run.status)?)
        .bind(&run.submitted_by)
        .bind(run.created_at)
        .bind(run.last_event_at)
        .bind(run.deadline_at)
        .bind(run.patch_seq as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    async fn update_run_status(&self, run_id: Uuid, status: RunStatus) -> Result<()> {
        let updated = sqlx::query("UPDATE runs SET status = $1 WHERE run_id = $2")
            .bind(serde_json::to_value(&status)?)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(anyhow!("run not found: {run_id}"));
        }
        Ok(())
    }

    async fn touch_run(&self, run_id: Uuid, at: Timestamp) -> Result<()> {
        sqlx::query("UPDATE runs SET last_event_at = $1 WHERE run_id = $2")
            .bind(at)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_patch_seq(&self, run_id: Uuid, seq: u32) -> Result<()> {
        sqlx::query("UPDATE runs SET patch_seq = $1 WHERE run_id = $2")
            .bind(seq as i32)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_base_artifact(&self, run_id: Uuid, artifact: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET base_artifact = $1 WHERE run_id = $2")
            .bind(artifact)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_stalled(&self, cutoff: Timestamp, now: Timestamp) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM runs
            WHERE status->>'status' = 'RUNNING'
              AND (last_event_at < $1 OR (deadline_at IS NOT NULL AND deadline_at < $2))
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    // ── Patch chain ──

    async fn append_patch(&self, record: &PatchRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO patches (run_id, seq, operations, description, actor, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.run_id)
        .bind(record.seq as i32)
        .bind(&record.operations)
        .bind(&record.description)
        .bind(&record.actor)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_patches(&self, run_id: Uuid) -> Result<Vec<PatchRecord>> {
        let rows = sqlx::query(
            "SELECT seq, operations, description, actor, created_at
             FROM patches WHERE run_id = $1 ORDER BY seq",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| PatchRecord {
                run_id,
                seq: row.get::<i32, _>("seq") as u32,
                operations: row.get("operations"),
                description: row.get("description"),
                actor: row.get("actor"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn clear_patches(&self, run_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM patches WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Event log ──

    async fn append_event(&self, run_id: Uuid, event: &RunEvent) -> Result<u64> {
        let event_data = serde_json::to_value(event)?;
        // Sequence numbers are per run; a concurrent append can collide on
        // the primary key, so retry a couple of times.
        for _ in 0..3 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO event_log (run_id, sequence_num, event_type, event_data)
                SELECT $1, COALESCE(MAX(sequence_num), 0) + 1, $2, $3
                FROM event_log WHERE run_id = $1
                RETURNING sequence_num
                "#,
            )
            .bind(run_id)
            .bind(event.kind())
            .bind(&event_data)
            .fetch_one(&self.pool)
            .await;
            match inserted {
                Ok(row) => return Ok(row.get::<i64, _>("sequence_num") as u64),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(anyhow!("event append kept colliding for run {run_id}"))
    }

    async fn read_events(&self, run_id: Uuid, from_seq: u64) -> Result<Vec<(u64, RunEvent)>> {
        let rows = sqlx::query(
            "SELECT sequence_num, event_data FROM event_log
             WHERE run_id = $1 AND sequence_num >= $2 ORDER BY sequence_num",
        )
        .bind(run_id)
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let seq = row.get::<i64, _>("sequence_num") as u64;
                let data: serde_json::Value = row.get("event_data");
                Ok((seq, serde_json::from_value(data)?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_ms;
    use std::collections::BTreeMap;

    async fn test_store() -> Option<PostgresDurable> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = sqlx::PgPool::connect(&url).await.ok()?;
        let store = PostgresDurable::new(pool);
        store.migrate().await.ok()?;
        Some(store)
    }

    /// Requires a live Postgres: TEST_DATABASE_URL=postgres://... cargo
    /// test -p chorus-core --features postgres -- --ignored
    #[tokio::test]
    #[ignore]
    async fn run_round_trip() {
        let Some(store) = test_store().await else { return };
        let run = Run {
            run_id: Uuid::now_v7(),
            base_artifact: "abc".into(),
            tags_snapshot: BTreeMap::from([("team".to_string(), "growth".to_string())]),
            status: RunStatus::Running,
            submitted_by: "tester".into(),
            created_at: now_ms(),
            last_event_at: now_ms(),
            deadline_at: None,
            patch_seq: 0,
        };
        store.insert_run(&run).await.unwrap();

        let loaded = store.load_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.base_artifact, "abc");
        assert_eq!(loaded.status, RunStatus::Running);

        store
            .update_run_status(
                run.run_id,
                RunStatus::Failed {
                    reason: "timeout".into(),
                },
            )
            .await
            .unwrap();
        let failed = store.load_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(
            failed.status,
            RunStatus::Failed {
                reason: "timeout".into()
            }
        );
    }

    #[tokio::test]
    #[ignore]
    async fn event_log_sequences() {
        let Some(store) = test_store().await else { return };
        let run_id = Uuid::now_v7();
        for i in 0..3u64 {
            let seq = store
                .append_event(
                    run_id,
                    &RunEvent::NodeSkipped {
                        node_id: format!("n{i}"),
                        reason: "test".into(),
                    },
                )
                .await
                .unwrap();
            assert_eq!(seq, i + 1);
        }
        let events = store.read_events(run_id, 2).await.unwrap();
        assert_eq!(events.len(), 2);
    }
}
