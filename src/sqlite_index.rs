//! SQLite-backed [`SimilarityIndex`].
//!
//! One row per ticket in `ticket_vectors`, so an upsert is a single
//! `INSERT .. ON CONFLICT` statement and a concurrent query never sees a
//! half-written vector. Queries load the vectors in scope and rank them
//! by brute-force cosine similarity.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use ticket_flow_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use ticket_flow_core::index::{IndexEntry, IndexHit, IndexedTicket, ScopeFilter, SimilarityIndex};
use ticket_flow_core::ranking::nearest;

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

fn row_last_modified(row: &SqliteRow) -> Result<DateTime<Utc>> {
    from_millis(row.get::<i64, _>("last_modified"))
}

#[async_trait]
impl SimilarityIndex for SqliteIndex {
    async fn upsert(&self, entry: IndexEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ticket_vectors (ticket_id, project, title, status, last_modified,
                                        content_hash, model, dims, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ticket_id) DO UPDATE SET
                project = excluded.project,
                title = excluded.title,
                status = excluded.status,
                last_modified = excluded.last_modified,
                content_hash = excluded.content_hash,
                model = excluded.model,
                dims = excluded.dims,
                embedding = excluded.embedding
            "#,
        )
        .bind(&entry.ticket_id)
        .bind(&entry.project)
        .bind(&entry.title)
        .bind(&entry.status)
        .bind(entry.last_modified.timestamp_millis())
        .bind(&entry.content_hash)
        .bind(&entry.model)
        .bind(entry.vector.len() as i64)
        .bind(vec_to_blob(&entry.vector))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, ticket_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM ticket_vectors WHERE ticket_id = ?")
            .bind(ticket_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query(&self, vector: &[f32], k: usize, filter: &ScopeFilter) -> Result<Vec<IndexHit>> {
        let rows = match &filter.project {
            Some(project) => {
                sqlx::query(
                    "SELECT ticket_id, project, title, last_modified, embedding \
                     FROM ticket_vectors WHERE project = ?",
                )
                .bind(project)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT ticket_id, project, title, last_modified, embedding FROM ticket_vectors",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            hits.push(IndexHit {
                ticket_id: row.get("ticket_id"),
                project: row.get("project"),
                title: Some(row.get("title")),
                score: cosine_similarity(vector, &blob_to_vec(&blob)),
                last_modified: row_last_modified(row)?,
            });
        }

        Ok(nearest(hits, k))
    }

    async fn content_hash(&self, ticket_id: &str) -> Result<Option<String>> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT content_hash FROM ticket_vectors WHERE ticket_id = ?")
                .bind(ticket_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(hash)
    }

    async fn list(&self, filter: &ScopeFilter) -> Result<Vec<IndexedTicket>> {
        let sql = "SELECT ticket_id, project, status, last_modified, content_hash \
                   FROM ticket_vectors WHERE (? IS NULL OR project = ?) ORDER BY ticket_id";
        let rows = sqlx::query(sql)
            .bind(&filter.project)
            .bind(&filter.project)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(IndexedTicket {
                    ticket_id: row.get("ticket_id"),
                    project: row.get("project"),
                    status: row.get("status"),
                    last_modified: row_last_modified(row)?,
                    content_hash: row.get("content_hash"),
                })
            })
            .collect()
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ticket_vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}
