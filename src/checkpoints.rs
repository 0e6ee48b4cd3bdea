//! Ingestion checkpoints in the `checkpoints` table.
//!
//! Scopes are `incremental:<project>` (an [`IngestionCheckpoint`], stored
//! as RFC 3339) and `backfill:<project>` (the next page offset).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use ticket_flow_core::models::IngestionCheckpoint;

#[derive(Clone)]
pub struct Checkpoints {
    pool: SqlitePool,
}

fn incremental_scope(project: &str) -> String {
    format!("incremental:{}", project)
}

fn backfill_scope(project: &str) -> String {
    format!("backfill:{}", project)
}

impl Checkpoints {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn get(&self, scope: &str) -> Result<Option<String>> {
        let cursor: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE scope = ?")
                .bind(scope)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cursor)
    }

    async fn set(&self, scope: &str, cursor: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO checkpoints (scope, cursor, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(scope) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
            "#,
        )
        .bind(scope)
        .bind(cursor)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self, scope: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE scope = ?")
            .bind(scope)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn incremental(&self, project: &str) -> Result<Option<IngestionCheckpoint>> {
        let Some(raw) = self.get(&incremental_scope(project)).await? else {
            return Ok(None);
        };
        let last_modified = DateTime::parse_from_rfc3339(&raw)
            .with_context(|| format!("Invalid checkpoint for {}: {}", project, raw))?
            .with_timezone(&Utc);
        Ok(Some(IngestionCheckpoint {
            project: project.to_string(),
            last_modified,
        }))
    }

    pub async fn set_incremental(&self, checkpoint: &IngestionCheckpoint) -> Result<()> {
        self.set(
            &incremental_scope(&checkpoint.project),
            &checkpoint.last_modified.to_rfc3339(),
        )
        .await
    }

    /// Next page offset of an unfinished backfill.
    pub async fn backfill_offset(&self, project: &str) -> Result<Option<usize>> {
        Ok(self
            .get(&backfill_scope(project))
            .await?
            .and_then(|raw| raw.parse().ok()))
    }

    pub async fn set_backfill_offset(&self, project: &str, offset: usize) -> Result<()> {
        self.set(&backfill_scope(project), &offset.to_string()).await
    }

    pub async fn clear_backfill(&self, project: &str) -> Result<()> {
        self.clear(&backfill_scope(project)).await
    }
}
