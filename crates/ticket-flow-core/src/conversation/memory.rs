//! In-memory [`ConversationBackend`].
//!
//! A `HashMap` behind `std::sync::Mutex`. The lock is held only for the
//! duration of a single load or compare-and-swap, never across awaits.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::ConversationBackend;
use crate::models::{ConversationKey, ConversationState};

#[derive(Default)]
pub struct InMemoryConversations {
    states: Mutex<HashMap<ConversationKey, ConversationState>>,
}

impl InMemoryConversations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> anyhow::Error {
    anyhow!("in-memory conversation lock poisoned")
}

#[async_trait]
impl ConversationBackend for InMemoryConversations {
    async fn load(&self, key: &ConversationKey) -> Result<Option<ConversationState>> {
        let states = self.states.lock().map_err(|_| poisoned())?;
        Ok(states.get(key).cloned())
    }

    async fn save(&self, state: &ConversationState, expected_version: Option<u64>) -> Result<bool> {
        let mut states = self.states.lock().map_err(|_| poisoned())?;
        let current = states.get(&state.key).map(|s| s.version);
        if current != expected_version {
            return Ok(false);
        }
        states.insert(state.key.clone(), state.clone());
        Ok(true)
    }

    async fn remove(&self, key: &ConversationKey, expected_version: u64) -> Result<bool> {
        let mut states = self.states.lock().map_err(|_| poisoned())?;
        match states.get(key) {
            Some(s) if s.version == expected_version => {
                states.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expired_keys(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ConversationKey>> {
        let states = self.states.lock().map_err(|_| poisoned())?;
        let mut expired: Vec<&ConversationState> =
            states.values().filter(|s| s.expires_at < now).collect();
        expired.sort_by_key(|s| s.expires_at);
        Ok(expired
            .into_iter()
            .take(limit)
            .map(|s| s.key.clone())
            .collect())
    }
}
