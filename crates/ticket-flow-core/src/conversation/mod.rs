//! Conversation persistence.
//!
//! A [`ConversationBackend`] is a plain keyed record store with one
//! concurrency primitive: compare-and-swap on the state's version. The
//! [`store::ConversationStore`] builds transition application, event
//! de-duplication, and lazy expiry on top of it, so every backend gets
//! the same semantics.
//!
//! Implementations:
//! - [`memory::InMemoryConversations`] for tests and single-process hosts
//! - `SqliteConversations` in the `ticket-flow` app crate

pub mod memory;
pub mod store;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{ConversationKey, ConversationState};

#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn load(&self, key: &ConversationKey) -> Result<Option<ConversationState>>;

    /// Write `state`.
    ///
    /// With `expected_version == None` the write only succeeds if no state
    /// exists for the key. With `Some(v)` it only succeeds if the stored
    /// version is still `v`. Returns `false` when the condition failed.
    async fn save(&self, state: &ConversationState, expected_version: Option<u64>) -> Result<bool>;

    /// Delete the state if its version is still `expected_version`.
    async fn remove(&self, key: &ConversationKey, expected_version: u64) -> Result<bool>;

    /// Keys whose expiry deadline is before `now`, oldest first.
    async fn expired_keys(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ConversationKey>>;
}
