//! Core data models shared by the conversation store, the duplicate
//! detection engine, and the ingestion pipeline.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ui::ReplyTarget;

/// Identity of one ticket-flow instance.
///
/// `conversation` is the thread id when the flow lives in a thread, or
/// the channel id for direct conversations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub workspace: String,
    pub conversation: String,
    pub user: String,
}

impl ConversationKey {
    pub fn new(
        workspace: impl Into<String>,
        conversation: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            conversation: conversation.into(),
            user: user.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.workspace, self.conversation, self.user)
    }
}

/// A named state in the conversation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    Drafting,
    DuplicateCheck,
    AwaitingConfirmation,
    Creating,
    Completed,
    Failed,
    Expired,
}

impl Phase {
    /// Terminal phases end a flow; only `Start`, `Retry`, or `Reset` leave them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Drafting => "DRAFTING",
            Phase::DuplicateCheck => "DUPLICATE_CHECK",
            Phase::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            Phase::Creating => "CREATING",
            Phase::Completed => "COMPLETED",
            Phase::Failed => "FAILED",
            Phase::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Draft ticket fields accumulated over the conversation.
///
/// Everything is optional until the user (or the suggestion
/// collaborator) fills it in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftFields {
    /// The user's own description, exactly as typed.
    #[serde(default)]
    pub raw_text: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub issue_type: Option<String>,
    /// Criticality label, `P0` (highest) through `P4` (lowest).
    #[serde(default)]
    pub criticality: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl DraftFields {
    /// Overlay every field that `other` provides onto `self`.
    pub fn merge(&mut self, other: DraftFields) {
        fn take(slot: &mut Option<String>, value: Option<String>) {
            if let Some(v) = value {
                if !v.trim().is_empty() {
                    *slot = Some(v);
                }
            }
        }
        take(&mut self.raw_text, other.raw_text);
        take(&mut self.title, other.title);
        take(&mut self.description, other.description);
        take(&mut self.issue_type, other.issue_type);
        take(&mut self.criticality, other.criticality);
        take(&mut self.project, other.project);
        if !other.labels.is_empty() {
            self.labels = other.labels;
        }
    }

    /// True when there is any text a duplicate check can run against.
    pub fn has_content(&self) -> bool {
        [&self.title, &self.description, &self.raw_text]
            .iter()
            .any(|f| f.as_deref().is_some_and(|s| !s.trim().is_empty()))
    }

    /// The text submitted to duplicate detection: title plus description,
    /// falling back to the raw user text when neither was produced.
    pub fn detection_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(t) = self.title.as_deref() {
            parts.push(t);
        }
        if let Some(d) = self.description.as_deref() {
            parts.push(d);
        }
        if parts.iter().all(|p| p.trim().is_empty()) {
            if let Some(raw) = self.raw_text.as_deref() {
                return raw.to_string();
            }
        }
        parts.join("\n\n")
    }

    /// The title to submit, falling back to the first line of the raw text.
    pub fn effective_title(&self) -> Option<String> {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(|t| t.trim().to_string())
            .or_else(|| {
                self.raw_text
                    .as_deref()
                    .and_then(|raw| raw.lines().map(str::trim).find(|l| !l.is_empty()))
                    .map(|line| line.chars().take(120).collect())
            })
    }
}

/// A previously created ticket similar enough to warrant review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub ticket_id: String,
    /// Cosine similarity clamped to `[0, 1]`.
    pub score: f32,
    /// 1-based position in the ranked list.
    pub rank: usize,
    #[serde(default)]
    pub title: Option<String>,
    pub last_modified: DateTime<Utc>,
}

/// Why a candidate list is a fallback rather than a real detection result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    Unavailable,
    Timeout,
}

/// The candidate list stored with a conversation.
///
/// An empty list with `degraded == None` means detection ran and found
/// nothing; `degraded == Some(_)` means detection did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSet {
    pub candidates: Vec<DuplicateCandidate>,
    #[serde(default)]
    pub degraded: Option<DegradedReason>,
}

impl CandidateSet {
    pub fn found(candidates: Vec<DuplicateCandidate>) -> Self {
        Self {
            candidates,
            degraded: None,
        }
    }

    pub fn degraded(reason: DegradedReason) -> Self {
        Self {
            candidates: Vec::new(),
            degraded: Some(reason),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// An inbound event id already applied to a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenEvent {
    pub id: String,
    pub at: DateTime<Utc>,
}

/// One state-machine instance, owned by the conversation store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub key: ConversationKey,
    pub reply_to: ReplyTarget,
    pub phase: Phase,
    /// Incremented by every accepted transition.
    pub version: u64,
    #[serde(default)]
    pub draft: DraftFields,
    /// Present from the moment detection finished until the draft is revised.
    #[serde(default)]
    pub candidates: Option<CandidateSet>,
    /// Version at which the flow entered `CREATING`; the tracker is called
    /// at most once for this version.
    #[serde(default)]
    pub creation_version: Option<u64>,
    #[serde(default)]
    pub created_ticket: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub seen_events: VecDeque<SeenEvent>,
}

impl ConversationState {
    /// A fresh `IDLE` state at version 0.
    pub fn new(key: ConversationKey, reply_to: ReplyTarget, now: DateTime<Utc>, idle_ttl: Duration) -> Self {
        Self {
            key,
            reply_to,
            phase: Phase::Idle,
            version: 0,
            draft: DraftFields::default(),
            candidates: None,
            creation_version: None,
            created_ticket: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            expires_at: now + idle_ttl,
            seen_events: VecDeque::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn has_seen(&self, event_id: &str) -> bool {
        self.seen_events.iter().any(|e| e.id == event_id)
    }

    /// Record an applied event id, dropping ids older than `window` and
    /// keeping at most `capacity` entries.
    pub fn remember_event(
        &mut self,
        event_id: &str,
        now: DateTime<Utc>,
        window: Duration,
        capacity: usize,
    ) {
        let horizon = now - window;
        self.seen_events.retain(|e| e.at >= horizon);
        self.seen_events.push_back(SeenEvent {
            id: event_id.to_string(),
            at: now,
        });
        while self.seen_events.len() > capacity.max(1) {
            self.seen_events.pop_front();
        }
    }
}

/// Normalized tracker ticket used for indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRecord {
    pub id: String,
    pub project: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub issue_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub last_modified: DateTime<Utc>,
}

impl TicketRecord {
    /// Title and description joined the same way a draft is, so ticket
    /// and draft vectors are comparable.
    pub fn indexed_text(&self) -> String {
        if self.description.trim().is_empty() {
            self.title.clone()
        } else {
            format!("{}\n\n{}", self.title, self.description)
        }
    }
}

/// Last successfully ingested modification time for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionCheckpoint {
    pub project: String,
    pub last_modified: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ConversationState {
        ConversationState::new(
            ConversationKey::new("T1", "1700000000.0001", "U1"),
            ReplyTarget::new("C1", Some("1700000000.0001")),
            Utc::now(),
            Duration::minutes(30),
        )
    }

    #[test]
    fn test_merge_keeps_existing_when_absent() {
        let mut draft = DraftFields {
            title: Some("Login fails".into()),
            ..Default::default()
        };
        draft.merge(DraftFields {
            description: Some("After SSO redirect".into()),
            title: Some("   ".into()),
            ..Default::default()
        });
        assert_eq!(draft.title.as_deref(), Some("Login fails"));
        assert_eq!(draft.description.as_deref(), Some("After SSO redirect"));
    }

    #[test]
    fn test_detection_text_falls_back_to_raw() {
        let draft = DraftFields {
            raw_text: Some("checkout page is blank".into()),
            ..Default::default()
        };
        assert!(draft.has_content());
        assert_eq!(draft.detection_text(), "checkout page is blank");
        assert_eq!(draft.effective_title().as_deref(), Some("checkout page is blank"));
    }

    #[test]
    fn test_remember_event_is_bounded() {
        let mut s = state();
        let now = Utc::now();
        for i in 0..10 {
            s.remember_event(&format!("ev-{i}"), now, Duration::minutes(10), 4);
        }
        assert_eq!(s.seen_events.len(), 4);
        assert!(s.has_seen("ev-9"));
        assert!(!s.has_seen("ev-0"));
    }

    #[test]
    fn test_remember_event_drops_old_ids() {
        let mut s = state();
        let now = Utc::now();
        s.remember_event("old", now - Duration::minutes(20), Duration::minutes(10), 8);
        s.remember_event("new", now, Duration::minutes(10), 8);
        assert!(!s.has_seen("old"));
        assert!(s.has_seen("new"));
    }
}
