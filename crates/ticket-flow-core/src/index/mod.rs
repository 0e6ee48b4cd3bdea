//! Similarity index abstraction.
//!
//! The [`SimilarityIndex`] trait maintains one vector per ticket id and
//! supports upsert, delete, and k-nearest-neighbour query, enabling
//! pluggable vector stores (SQLite, in-memory, hosted services).
//!
//! Implementations must be `Send + Sync` and must make each upsert atomic
//! per ticket id: a concurrent query sees either the old entry or the new
//! one, never a partially written vector.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Everything stored for one ticket.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub ticket_id: String,
    pub project: String,
    pub title: String,
    pub status: String,
    pub last_modified: DateTime<Utc>,
    /// Hash of the normalized text the vector was computed from.
    pub content_hash: String,
    pub model: String,
    pub vector: Vec<f32>,
}

/// A query result before thresholding and tie-breaking.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub ticket_id: String,
    pub project: String,
    pub title: Option<String>,
    /// Raw cosine similarity.
    pub score: f32,
    pub last_modified: DateTime<Utc>,
}

/// Stored metadata for one ticket, without its vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedTicket {
    pub ticket_id: String,
    pub project: String,
    pub status: String,
    pub last_modified: DateTime<Utc>,
    pub content_hash: String,
}

/// Restricts a query to a project scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    pub project: Option<String>,
}

impl ScopeFilter {
    pub fn project(project: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
        }
    }

    pub fn matches(&self, project: &str) -> bool {
        self.project.as_deref().map_or(true, |p| p == project)
    }
}

/// Abstract vector store keyed by ticket id.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](SimilarityIndex::upsert) | Insert or replace the entry for a ticket |
/// | [`delete`](SimilarityIndex::delete) | Remove a ticket's entry |
/// | [`query`](SimilarityIndex::query) | k nearest neighbours within a scope |
/// | [`content_hash`](SimilarityIndex::content_hash) | Hash stored for a ticket, for idempotent re-ingestion |
/// | [`list`](SimilarityIndex::list) | Metadata of every entry in a scope, for retention pruning |
/// | [`count`](SimilarityIndex::count) | Number of stored entries |
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    async fn upsert(&self, entry: IndexEntry) -> Result<()>;

    /// Returns `true` when an entry was removed.
    async fn delete(&self, ticket_id: &str) -> Result<bool>;

    /// Up to `k` hits ordered by descending raw score.
    async fn query(&self, vector: &[f32], k: usize, filter: &ScopeFilter) -> Result<Vec<IndexHit>>;

    async fn content_hash(&self, ticket_id: &str) -> Result<Option<String>>;

    async fn list(&self, filter: &ScopeFilter) -> Result<Vec<IndexedTicket>>;

    async fn count(&self) -> Result<usize>;
}
