//! SQLite-backed [`ConversationBackend`].
//!
//! The full state is stored as JSON in `state_json`; `version`, `phase`,
//! and `expires_at` are duplicated into columns so compare-and-swap and
//! the expiry sweep run as plain SQL.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use ticket_flow_core::conversation::ConversationBackend;
use ticket_flow_core::models::{ConversationKey, ConversationState};

pub struct SqliteConversations {
    pool: SqlitePool,
}

impl SqliteConversations {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationBackend for SqliteConversations {
    async fn load(&self, key: &ConversationKey) -> Result<Option<ConversationState>> {
        let json: Option<String> = sqlx::query_scalar(
            "SELECT state_json FROM conversations WHERE workspace = ? AND channel = ? AND user_id = ?",
        )
        .bind(&key.workspace)
        .bind(&key.conversation)
        .bind(&key.user)
        .fetch_optional(&self.pool)
        .await?;

        json.map(|j| {
            serde_json::from_str(&j).with_context(|| format!("Corrupt conversation state for {}", key))
        })
        .transpose()
    }

    async fn save(&self, state: &ConversationState, expected_version: Option<u64>) -> Result<bool> {
        let json = serde_json::to_string(state)?;
        let key = &state.key;

        let result = match expected_version {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO conversations (workspace, channel, user_id, version, phase,
                                               state_json, expires_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(workspace, channel, user_id) DO NOTHING
                    "#,
                )
                .bind(&key.workspace)
                .bind(&key.conversation)
                .bind(&key.user)
                .bind(state.version as i64)
                .bind(state.phase.as_str())
                .bind(&json)
                .bind(state.expires_at.timestamp_millis())
                .bind(state.updated_at.timestamp_millis())
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE conversations
                    SET version = ?, phase = ?, state_json = ?, expires_at = ?, updated_at = ?
                    WHERE workspace = ? AND channel = ? AND user_id = ? AND version = ?
                    "#,
                )
                .bind(state.version as i64)
                .bind(state.phase.as_str())
                .bind(&json)
                .bind(state.expires_at.timestamp_millis())
                .bind(state.updated_at.timestamp_millis())
                .bind(&key.workspace)
                .bind(&key.conversation)
                .bind(&key.user)
                .bind(expected as i64)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, key: &ConversationKey, expected_version: u64) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM conversations \
             WHERE workspace = ? AND channel = ? AND user_id = ? AND version = ?",
        )
        .bind(&key.workspace)
        .bind(&key.conversation)
        .bind(&key.user)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn expired_keys(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ConversationKey>> {
        let rows = sqlx::query(
            "SELECT workspace, channel, user_id FROM conversations \
             WHERE expires_at < ? ORDER BY expires_at LIMIT ?",
        )
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ConversationKey {
                workspace: row.get("workspace"),
                conversation: row.get("channel"),
                user: row.get("user_id"),
            })
            .collect())
    }
}
