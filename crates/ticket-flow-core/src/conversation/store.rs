//! The conversation state store.
//!
//! [`ConversationStore::apply`] is the only way a conversation changes.
//! Each call is a read-modify-write guarded by compare-and-swap on the
//! version counter, so writes to one key are serialized without any lock
//! spanning unrelated keys, and no lock is held while callers wait on the
//! network.
//!
//! # Apply algorithm
//!
//! 1. Load the state (`NotFound` if absent).
//! 2. If the event id is in the state's seen set, return the state
//!    unchanged with `replayed = true`.
//! 3. Reject with `StaleVersion` unless the stored version equals the
//!    caller's expected version.
//! 4. If the expiry deadline has passed, apply `Expire` (when the phase
//!    is non-terminal) and then `Reset`, so the transition runs against a
//!    fresh `IDLE` state.
//! 5. Run the pure transition, remember the event id, and push the
//!    expiry deadline forward.
//! 6. Compare-and-swap against the version read in step 1.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::ConversationBackend;
use crate::error::TransitionError;
use crate::machine::{apply_transition, Effect, Transition};
use crate::models::{ConversationKey, ConversationState, Phase};
use crate::ui::{self, ReplyTarget};

/// Timing and retention settings, decoupled from application config.
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    /// Untouched conversations expire after this long.
    pub idle_ttl: Duration,
    /// Event ids older than this are forgotten.
    pub dedup_window: Duration,
    /// Most event ids remembered per conversation.
    pub dedup_capacity: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::minutes(30),
            dedup_window: Duration::minutes(10),
            dedup_capacity: 64,
        }
    }
}

/// Result of a successful (or replayed) transition.
#[derive(Debug, Clone)]
pub struct Applied {
    pub state: ConversationState,
    pub effects: Vec<Effect>,
    /// The event had already been applied; nothing changed.
    pub replayed: bool,
    /// The stored state had expired and was reset first.
    pub reset_from_expiry: bool,
}

pub struct ConversationStore {
    backend: Arc<dyn ConversationBackend>,
    settings: StoreSettings,
}

fn storage(err: anyhow::Error) -> TransitionError {
    TransitionError::Storage(format!("{err:#}"))
}

impl ConversationStore {
    pub fn new(backend: Arc<dyn ConversationBackend>, settings: StoreSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub async fn get(&self, key: &ConversationKey) -> Result<Option<ConversationState>, TransitionError> {
        self.backend.load(key).await.map_err(storage)
    }

    /// Load the state for `key`, creating an `IDLE` one if none exists.
    pub async fn get_or_create(
        &self,
        key: &ConversationKey,
        reply_to: ReplyTarget,
        now: DateTime<Utc>,
    ) -> Result<ConversationState, TransitionError> {
        if let Some(state) = self.get(key).await? {
            return Ok(state);
        }
        let fresh = ConversationState::new(key.clone(), reply_to, now, self.settings.idle_ttl);
        if self.backend.save(&fresh, None).await.map_err(storage)? {
            return Ok(fresh);
        }
        // Another event created it first.
        self.get(key)
            .await?
            .ok_or_else(|| TransitionError::NotFound(key.to_string()))
    }

    pub async fn has_seen(&self, key: &ConversationKey, event_id: &str) -> Result<bool, TransitionError> {
        Ok(self
            .get(key)
            .await?
            .is_some_and(|state| state.has_seen(event_id)))
    }

    /// Apply `transition` to the conversation at `expected_version`.
    pub async fn apply(
        &self,
        key: &ConversationKey,
        expected_version: u64,
        event_id: Option<&str>,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Applied, TransitionError> {
        let current = self
            .get(key)
            .await?
            .ok_or_else(|| TransitionError::NotFound(key.to_string()))?;

        if let Some(id) = event_id {
            if current.has_seen(id) {
                debug!(key = %key, event_id = id, "Duplicate event ignored");
                return Ok(Applied {
                    state: current,
                    effects: Vec::new(),
                    replayed: true,
                    reset_from_expiry: false,
                });
            }
        }

        if current.version != expected_version {
            return Err(TransitionError::StaleVersion {
                key: key.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let name = transition.name();
        let reset_from_expiry = current.is_expired(now);
        let (base, mut effects) = if reset_from_expiry {
            debug!(key = %key, phase = %current.phase, "Resetting expired conversation");
            reset_expired(&current, now)?
        } else {
            (current.clone(), Vec::new())
        };

        let (mut next, transition_effects) = match apply_transition(&base, transition, now) {
            Ok(applied) => applied,
            Err(err) => {
                if reset_from_expiry {
                    let mut reset = base;
                    reset.expires_at = now + self.settings.idle_ttl;
                    self.backend
                        .save(&reset, Some(current.version))
                        .await
                        .map_err(storage)?;
                }
                return Err(err);
            }
        };

        if next.phase == Phase::AwaitingConfirmation && next.candidates.is_none() {
            return Err(TransitionError::InvalidTransition {
                phase: base.phase,
                transition: name,
            });
        }

        if let Some(id) = event_id {
            next.remember_event(
                id,
                now,
                self.settings.dedup_window,
                self.settings.dedup_capacity,
            );
        }
        next.expires_at = now + self.settings.idle_ttl;

        if !self
            .backend
            .save(&next, Some(current.version))
            .await
            .map_err(storage)?
        {
            let actual = self.get(key).await?.map(|s| s.version).unwrap_or(0);
            return Err(TransitionError::StaleVersion {
                key: key.to_string(),
                expected: expected_version,
                actual,
            });
        }

        debug!(
            key = %key,
            transition = name,
            from = %current.phase,
            to = %next.phase,
            version = next.version,
            "Transition applied"
        );

        effects.extend(transition_effects);
        Ok(Applied {
            state: next,
            effects,
            replayed: false,
            reset_from_expiry,
        })
    }

    /// Evict up to `limit` expired conversations. Returns how many were removed.
    pub async fn sweep(&self, now: DateTime<Utc>, limit: usize) -> Result<usize, TransitionError> {
        let keys = self
            .backend
            .expired_keys(now, limit)
            .await
            .map_err(storage)?;
        let mut evicted = 0;
        for key in keys {
            let Some(state) = self.get(&key).await? else {
                continue;
            };
            // Touched again since it was listed.
            if !state.is_expired(now) {
                continue;
            }
            if self
                .backend
                .remove(&key, state.version)
                .await
                .map_err(storage)?
            {
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}

/// `Expire` (if still non-terminal) followed by `Reset`.
fn reset_expired(
    state: &ConversationState,
    now: DateTime<Utc>,
) -> Result<(ConversationState, Vec<Effect>), TransitionError> {
    let mut effects = Vec::new();
    let mut current = state.clone();
    if !current.phase.is_terminal() {
        let in_flight = current.phase != Phase::Idle;
        let (expired, _) = apply_transition(&current, Transition::Expire, now)?;
        if in_flight {
            effects.push(Effect::Ui(ui::expired(&expired)));
        }
        current = expired;
    }
    let (reset, _) = apply_transition(&current, Transition::Reset, now)?;
    Ok((reset, effects))
}
