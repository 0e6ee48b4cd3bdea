//! Ingestion pipeline.
//!
//! Pulls tickets from the [`IssueTracker`], normalizes their text,
//! embeds them, and upserts them into the [`SimilarityIndex`]. Two modes
//! share the same page processing:
//!
//! - **Backfill** pages through every ticket in a project. The next page
//!   offset is checkpointed after each page, so an interrupted backfill
//!   resumes at the last page boundary.
//! - **Incremental** asks for tickets modified since the project's
//!   [`IngestionCheckpoint`], paging by modification time, and advances
//!   the checkpoint after each page has been fully upserted.
//!
//! A ticket whose normalized text hash matches the stored one is not
//! re-embedded. Closed tickets older than the retention window are
//! removed from the index, both when they come by in a sweep and by a
//! prune pass over the index at the end of every sweep.
//!
//! Backfill and incremental sweeps for the same project never overlap:
//! both take the project's [`ScopeLocks`] entry and fail fast with
//! [`IngestionError::AlreadyRunning`] when it is held. The lock is
//! in-process; run one ingesting process per database.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use ticket_flow_core::embedding::EmbeddingProvider;
use ticket_flow_core::error::EmbeddingError;
use ticket_flow_core::index::{IndexEntry, ScopeFilter, SimilarityIndex};
use ticket_flow_core::models::{IngestionCheckpoint, TicketRecord};
use ticket_flow_core::text::{content_hash, normalize_text};

use crate::checkpoints::Checkpoints;
use crate::config::IngestionConfig;
use crate::traits::{IssueTracker, TrackerError, TrackerQuery};

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("ingestion is already running for project {0}")]
    AlreadyRunning(String),
    /// Embedding provider still unavailable after the batch retries; the
    /// sweep stops without advancing its checkpoint.
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// One ticket could not be embedded; logged and skipped.
    #[error("failed to ingest {ticket_id}: {reason}")]
    RecordFailed { ticket_id: String, reason: String },
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub pages: usize,
    pub fetched: usize,
    pub embedded: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl IngestStats {
    pub fn print(&self, label: &str) {
        println!("{}", label);
        println!("  pages: {}", self.pages);
        println!("  fetched: {} tickets", self.fetched);
        println!("  embedded: {}", self.embedded);
        println!("  unchanged: {}", self.unchanged);
        println!("  removed: {}", self.deleted);
        println!("  failed: {}", self.failed);
    }
}

// ============ Scope locks ============

/// In-process advisory locks, one per project scope.
#[derive(Default)]
pub struct ScopeLocks {
    held: Mutex<HashSet<String>>,
}

/// Releases its scope on drop.
pub struct ScopeGuard {
    locks: Arc<ScopeLocks>,
    scope: String,
}

impl ScopeLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take `scope`, or `None` if it is already held.
    pub fn try_acquire(self: &Arc<Self>, scope: &str) -> Option<ScopeGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(scope.to_string()) {
            return None;
        }
        Some(ScopeGuard {
            locks: Arc::clone(self),
            scope: scope.to_string(),
        })
    }

    pub fn is_held(&self, scope: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(scope)
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.scope);
    }
}

// ============ Pipeline ============

struct Pending {
    record: TicketRecord,
    text: String,
    hash: String,
}

pub struct IngestionPipeline {
    tracker: Arc<dyn IssueTracker>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn SimilarityIndex>,
    checkpoints: Checkpoints,
    locks: Arc<ScopeLocks>,
    config: IngestionConfig,
}

impl IngestionPipeline {
    pub fn new(
        tracker: Arc<dyn IssueTracker>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn SimilarityIndex>,
        checkpoints: Checkpoints,
        locks: Arc<ScopeLocks>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            tracker,
            embedder,
            index,
            checkpoints,
            locks,
            config,
        }
    }

    fn lock(&self, project: &str) -> Result<ScopeGuard, IngestionError> {
        self.locks
            .try_acquire(project)
            .ok_or_else(|| IngestionError::AlreadyRunning(project.to_string()))
    }

    /// Index every ticket in `project`, resuming an interrupted run unless
    /// `restart` is set.
    pub async fn backfill(&self, project: &str, restart: bool) -> Result<IngestStats, IngestionError> {
        let _guard = self.lock(project)?;

        if restart {
            self.checkpoints.clear_backfill(project).await?;
        }
        let mut offset = self.checkpoints.backfill_offset(project).await?.unwrap_or(0);
        // Tickets no longer in the tracker can only be detected by a scan
        // that saw the whole project in one run.
        let mut seen: Option<HashSet<String>> = (offset == 0).then(HashSet::new);
        let mut newest: Option<DateTime<Utc>> = None;
        let mut stats = IngestStats::default();

        info!(project, offset, "Backfill starting");
        loop {
            let query = TrackerQuery {
                start_at: offset,
                max_results: self.config.page_size,
                ..Default::default()
            };
            let page = self.tracker.search(project, &query).await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            if let Some(ids) = seen.as_mut() {
                ids.extend(page.iter().map(|r| r.id.clone()));
            }
            newest = newest.max(page.iter().map(|r| r.last_modified).max());

            self.process_page(page, &mut stats).await?;
            offset += page_len;
            self.checkpoints.set_backfill_offset(project, offset).await?;
            debug!(project, offset, "Backfill page committed");

            if page_len < self.config.page_size {
                break;
            }
        }
        self.checkpoints.clear_backfill(project).await?;

        if let Some(newest) = newest {
            let current = self.checkpoints.incremental(project).await?;
            if current.map_or(true, |c| c.last_modified < newest) {
                self.checkpoints
                    .set_incremental(&IngestionCheckpoint {
                        project: project.to_string(),
                        last_modified: newest,
                    })
                    .await?;
            }
        }

        if let Some(ids) = seen {
            stats.deleted += self.remove_missing(project, &ids).await?;
        }
        stats.deleted += self.prune(project).await?;

        info!(
            project,
            fetched = stats.fetched,
            embedded = stats.embedded,
            deleted = stats.deleted,
            failed = stats.failed,
            "Backfill finished"
        );
        Ok(stats)
    }

    /// Index tickets modified since the project's checkpoint.
    ///
    /// Pages are keyed on modification time rather than offset: each query
    /// starts at the newest timestamp seen so far, so a ticket updated
    /// mid-sweep moves ahead of the cursor instead of shifting unseen
    /// tickets behind it. Trackers may return tickets from before the
    /// bound; those seen earlier in the sweep are skipped.
    pub async fn sync_incremental(&self, project: &str) -> Result<IngestStats, IngestionError> {
        let _guard = self.lock(project)?;

        let since = self
            .checkpoints
            .incremental(project)
            .await?
            .map(|c| c.last_modified);
        let mut cursor = since;
        // Offset within the tickets at or before `cursor`; only grows while
        // a full page fails to move the cursor.
        let mut start_at = 0;
        let mut seen: HashSet<(String, DateTime<Utc>)> = HashSet::new();
        let mut stats = IngestStats::default();

        debug!(project, since = ?since, "Incremental sweep starting");
        loop {
            let query = TrackerQuery {
                modified_after: cursor,
                start_at,
                max_results: self.config.page_size,
                ..Default::default()
            };
            let mut page = self.tracker.search(project, &query).await?;
            let page_len = page.len();
            let newest = page.iter().map(|r| r.last_modified).max();
            page.retain(|r| seen.insert((r.id.clone(), r.last_modified)));

            if !page.is_empty() {
                self.process_page(page, &mut stats).await?;
            }

            if let Some(last_modified) = newest {
                let current = self.checkpoints.incremental(project).await?;
                if current.map_or(true, |c| c.last_modified < last_modified) {
                    self.checkpoints
                        .set_incremental(&IngestionCheckpoint {
                            project: project.to_string(),
                            last_modified,
                        })
                        .await?;
                }
            }
            if page_len < self.config.page_size.max(1) {
                break;
            }
            match newest {
                Some(n) if cursor.map_or(true, |c| n > c) => {
                    cursor = Some(n);
                    start_at = 0;
                }
                _ => start_at += page_len,
            }
        }

        stats.deleted += self.prune(project).await?;
        if stats.fetched > 0 || stats.deleted > 0 {
            info!(
                project,
                fetched = stats.fetched,
                embedded = stats.embedded,
                deleted = stats.deleted,
                failed = stats.failed,
                "Incremental sweep finished"
            );
        }
        Ok(stats)
    }

    /// Incremental sweep over every project. A failing project is logged
    /// and does not stop the others.
    pub async fn sync_all(&self, projects: &[String]) -> Vec<(String, Result<IngestStats, IngestionError>)> {
        let mut results = Vec::with_capacity(projects.len());
        for project in projects {
            let result = self.sync_incremental(project).await;
            if let Err(e) = &result {
                error!(project = %project, error = %e, "Incremental sweep failed");
            }
            results.push((project.clone(), result));
        }
        results
    }

    /// Run incremental sweeps forever, `interval` apart.
    pub async fn watch(&self, projects: &[String], interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sync_all(projects).await;
        }
    }

    /// Drop closed tickets older than the retention window from the index.
    pub async fn prune(&self, project: &str) -> Result<usize, IngestionError> {
        let horizon = self.retention_horizon();
        let mut removed = 0;
        for entry in self.index.list(&ScopeFilter::project(project)).await? {
            if self.is_closed(&entry.status)
                && entry.last_modified < horizon
                && self.index.delete(&entry.ticket_id).await?
            {
                debug!(project, ticket_id = %entry.ticket_id, "Pruned closed ticket");
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove_missing(&self, project: &str, seen: &HashSet<String>) -> Result<usize, IngestionError> {
        let mut removed = 0;
        for entry in self.index.list(&ScopeFilter::project(project)).await? {
            if !seen.contains(&entry.ticket_id) && self.index.delete(&entry.ticket_id).await? {
                debug!(project, ticket_id = %entry.ticket_id, "Removed ticket missing from tracker");
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn retention_horizon(&self) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::days(self.config.closed_retention_days)
    }

    fn is_closed(&self, status: &str) -> bool {
        self.config
            .closed_statuses
            .iter()
            .any(|s| s.eq_ignore_ascii_case(status))
    }

    fn is_eligible(&self, record: &TicketRecord) -> bool {
        !(self.is_closed(&record.status) && record.last_modified < self.retention_horizon())
    }

    /// Hash of everything the stored entry depends on: the embedding
    /// model, the status used for pruning, and the normalized text.
    fn record_hash(&self, record: &TicketRecord, text: &str) -> String {
        content_hash(&format!(
            "{}\n{}\n{}",
            self.embedder.model_name(),
            record.status,
            text
        ))
    }

    async fn process_page(&self, page: Vec<TicketRecord>, stats: &mut IngestStats) -> Result<(), IngestionError> {
        stats.pages += 1;
        stats.fetched += page.len();

        let mut pending = Vec::new();
        for record in page {
            if !self.is_eligible(&record) {
                if self.index.delete(&record.id).await? {
                    debug!(ticket_id = %record.id, status = %record.status, "Removed ineligible ticket");
                    stats.deleted += 1;
                }
                continue;
            }
            let text = normalize_text(&record.indexed_text());
            let hash = self.record_hash(&record, &text);
            if self.index.content_hash(&record.id).await?.as_deref() == Some(hash.as_str()) {
                stats.unchanged += 1;
                continue;
            }
            pending.push(Pending { record, text, hash });
        }

        let batch_size = self.config.batch_size.max(1);
        while !pending.is_empty() {
            let rest = pending.split_off(batch_size.min(pending.len()));
            let batch = std::mem::replace(&mut pending, rest);
            self.embed_batch(batch, stats).await?;
        }
        Ok(())
    }

    async fn embed_batch(&self, batch: Vec<Pending>, stats: &mut IngestStats) -> Result<(), IngestionError> {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
        match self.embed_with_retry(&texts).await {
            Ok(vectors) => {
                for (item, vector) in batch.into_iter().zip(vectors) {
                    self.store(item, vector).await?;
                    stats.embedded += 1;
                }
                Ok(())
            }
            Err(EmbeddingError::Unavailable(msg)) => Err(IngestionError::ProviderUnavailable(msg)),
            Err(EmbeddingError::Rejected(msg)) => {
                // Find the offending record(s) one at a time.
                debug!(size = texts.len(), reason = %msg, "Batch rejected, embedding records individually");
                for item in batch {
                    match self.embed_record(&item).await {
                        Ok(vector) => {
                            self.store(item, vector).await?;
                            stats.embedded += 1;
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping ticket");
                            stats.failed += 1;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    async fn embed_record(&self, item: &Pending) -> Result<Vec<f32>, IngestionError> {
        let failed = |reason: String| IngestionError::RecordFailed {
            ticket_id: item.record.id.clone(),
            reason,
        };
        let mut vectors = self
            .embed_with_retry(std::slice::from_ref(&item.text))
            .await
            .map_err(|e| failed(e.to_string()))?;
        vectors
            .pop()
            .ok_or_else(|| failed("provider returned no vector".to_string()))
    }

    /// Embed `texts`, retrying unavailability with exponential backoff
    /// (`backoff_base_ms`, doubled per attempt). Rejections are returned
    /// at once.
    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut attempt = 0;
        loop {
            match self.embedder.embed(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(EmbeddingError::Unavailable(msg)) if attempt < self.config.max_retries => {
                    let delay = self.config.backoff_base_ms.saturating_mul(1 << attempt.min(10));
                    warn!(attempt, delay_ms = delay, reason = %msg, "Embedding unavailable, backing off");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn store(&self, item: Pending, vector: Vec<f32>) -> Result<(), IngestionError> {
        let record = item.record;
        self.index
            .upsert(IndexEntry {
                ticket_id: record.id,
                project: record.project,
                title: record.title,
                status: record.status,
                last_modified: record.last_modified,
                content_hash: item.hash,
                model: self.embedder.model_name().to_string(),
                vector,
            })
            .await?;
        Ok(())
    }
}
