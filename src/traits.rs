//! Collaborator traits for the issue tracker and the language-suggestion
//! service.
//!
//! The orchestrator and the ingestion pipeline only see these traits.
//! HTTP adapters live in [`crate::jira`] and [`crate::suggestions`];
//! tests supply in-process fakes.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────┐  search/get   ┌──────────────┐
//!   │  Ingestion   │──────────────▶│              │
//!   └──────────────┘               │ IssueTracker │
//!   ┌──────────────┐  create/get   │  (Jira, …)   │
//!   │ Orchestrator │──────────────▶│              │
//!   └──────┬───────┘               └──────────────┘
//!          │ suggest/summarize     ┌──────────────────┐
//!          └──────────────────────▶│SuggestionProvider│
//!                                  └──────────────────┘
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ticket_flow_core::models::{DraftFields, TicketRecord};

// ═══════════════════════════════════════════════════════════════════════
// Issue Tracker
// ═══════════════════════════════════════════════════════════════════════

/// Failure reported by an [`IssueTracker`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// The tracker refused the request (validation, permissions).
    #[error("tracker rejected the request: {0}")]
    CreateFailed(String),
    /// Network failure or 5xx. For `create`, the ticket may or may not
    /// exist; it is still surfaced as a failed attempt.
    #[error("tracker temporarily unavailable: {0}")]
    Transient(String),
    #[error("ticket {0} not found")]
    NotFound(String),
}

/// Filter for [`IssueTracker::search`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerQuery {
    /// Only tickets modified at or after this instant. Adapters may widen
    /// the bound and return some older tickets too; callers tolerate that.
    pub modified_after: Option<DateTime<Utc>>,
    /// Zero-based offset for pagination.
    pub start_at: usize,
    pub max_results: usize,
    /// Only tickets assigned to this tracker account (see
    /// [`IssueTracker::find_user`]).
    pub assignee: Option<String>,
    /// Only tickets whose status is not one of these.
    pub exclude_statuses: Vec<String>,
}

/// Fields submitted when creating a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateFields {
    pub project: String,
    pub title: String,
    pub description: String,
    pub issue_type: String,
    /// `P0`..`P4`.
    pub criticality: Option<String>,
    pub labels: Vec<String>,
    /// Chat user who asked for the ticket.
    pub reporter: Option<String>,
}

impl CreateFields {
    /// Build from a draft, falling back to the given defaults for project
    /// and issue type.
    pub fn from_draft(
        draft: &DraftFields,
        default_project: &str,
        default_issue_type: &str,
    ) -> Option<Self> {
        let title = draft.effective_title()?;
        let description = draft
            .description
            .clone()
            .filter(|d| !d.trim().is_empty())
            .or_else(|| draft.raw_text.clone())
            .unwrap_or_default();
        Some(Self {
            project: draft
                .project
                .clone()
                .unwrap_or_else(|| default_project.to_string()),
            title,
            description,
            issue_type: draft
                .issue_type
                .clone()
                .unwrap_or_else(|| default_issue_type.to_string()),
            criticality: draft.criticality.clone(),
            labels: draft.labels.clone(),
            reporter: None,
        })
    }
}

/// A ticket created by [`IssueTracker::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTicket {
    pub id: String,
    pub url: Option<String>,
}

/// External issue tracker.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`search`](IssueTracker::search) | Page through a project's tickets, oldest modification first |
/// | [`create`](IssueTracker::create) | Create one ticket; never retried by the caller or the adapter |
/// | [`get`](IssueTracker::get) | Fetch one ticket by id |
/// | [`find_user`](IssueTracker::find_user) | Map a chat user's profile to a tracker account |
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn search(
        &self,
        project: &str,
        query: &TrackerQuery,
    ) -> Result<Vec<TicketRecord>, TrackerError>;

    async fn create(&self, fields: &CreateFields) -> Result<CreatedTicket, TrackerError>;

    async fn get(&self, ticket_id: &str) -> Result<TicketRecord, TrackerError>;

    /// The account id to use as [`TrackerQuery::assignee`], matched by
    /// email first and then by display name. `Ok(None)` when nobody
    /// matches.
    async fn find_user(
        &self,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<Option<String>, TrackerError>;
}

/// A tracker that refuses everything; used when `tracker.provider = "disabled"`.
pub struct DisabledTracker;

#[async_trait]
impl IssueTracker for DisabledTracker {
    async fn search(&self, _: &str, _: &TrackerQuery) -> Result<Vec<TicketRecord>, TrackerError> {
        Err(TrackerError::Transient("issue tracker is disabled".to_string()))
    }

    async fn create(&self, _: &CreateFields) -> Result<CreatedTicket, TrackerError> {
        Err(TrackerError::CreateFailed("issue tracker is disabled".to_string()))
    }

    async fn get(&self, ticket_id: &str) -> Result<TicketRecord, TrackerError> {
        Err(TrackerError::NotFound(ticket_id.to_string()))
    }

    async fn find_user(&self, _: Option<&str>, _: Option<&str>) -> Result<Option<String>, TrackerError> {
        Err(TrackerError::Transient("issue tracker is disabled".to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Suggestions
// ═══════════════════════════════════════════════════════════════════════

/// Advisory ticket fields proposed from the user's raw text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub issue_type: Option<String>,
    #[serde(default)]
    pub criticality: Option<String>,
}

impl Suggestion {
    /// The suggestion as draft fields, with the user's text alongside.
    pub fn into_draft(self, raw_text: &str) -> DraftFields {
        DraftFields {
            raw_text: Some(raw_text.to_string()),
            title: self.title,
            description: self.description,
            issue_type: self.issue_type,
            criticality: self.criticality.filter(|c| is_criticality(c)),
            ..Default::default()
        }
    }
}

/// `P0` through `P4`.
pub fn is_criticality(value: &str) -> bool {
    matches!(value, "P0" | "P1" | "P2" | "P3" | "P4")
}

/// Language-suggestion collaborator. Never required for correctness:
/// every failure is logged and the flow continues without it.
#[async_trait]
pub trait SuggestionProvider: Send + Sync {
    async fn suggest(&self, raw_text: &str) -> Result<Suggestion>;

    /// One or two sentences describing the ticket's problem and status.
    async fn summarize(&self, ticket: &TicketRecord) -> Result<String>;
}

/// Used when `suggestions.provider = "disabled"`.
pub struct NoSuggestions;

#[async_trait]
impl SuggestionProvider for NoSuggestions {
    async fn suggest(&self, _raw_text: &str) -> Result<Suggestion> {
        anyhow::bail!("suggestions are disabled")
    }

    async fn summarize(&self, _ticket: &TicketRecord) -> Result<String> {
        anyhow::bail!("suggestions are disabled")
    }
}
