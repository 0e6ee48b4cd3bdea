//! In-memory [`SimilarityIndex`] implementation for tests and embedding
//! into other hosts.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. An upsert swaps the whole
//! entry under the write lock, so readers never observe a partial vector.
//! Query is brute-force cosine similarity over all entries in scope.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{IndexEntry, IndexHit, IndexedTicket, ScopeFilter, SimilarityIndex};
use crate::embedding::cosine_similarity;
use crate::ranking::nearest;

pub struct InMemoryIndex {
    entries: RwLock<HashMap<String, IndexEntry>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of one entry, for assertions.
    pub fn get(&self, ticket_id: &str) -> Option<IndexEntry> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(ticket_id).cloned())
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> anyhow::Error {
    anyhow!("in-memory index lock poisoned")
}

#[async_trait]
impl SimilarityIndex for InMemoryIndex {
    async fn upsert(&self, entry: IndexEntry) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(entry.ticket_id.clone(), entry);
        Ok(())
    }

    async fn delete(&self, ticket_id: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        Ok(entries.remove(ticket_id).is_some())
    }

    async fn query(&self, vector: &[f32], k: usize, filter: &ScopeFilter) -> Result<Vec<IndexHit>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let hits: Vec<IndexHit> = entries
            .values()
            .filter(|e| filter.matches(&e.project))
            .map(|e| IndexHit {
                ticket_id: e.ticket_id.clone(),
                project: e.project.clone(),
                title: Some(e.title.clone()),
                score: cosine_similarity(vector, &e.vector),
                last_modified: e.last_modified,
            })
            .collect();
        Ok(nearest(hits, k))
    }

    async fn content_hash(&self, ticket_id: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(ticket_id).map(|e| e.content_hash.clone()))
    }

    async fn list(&self, filter: &ScopeFilter) -> Result<Vec<IndexedTicket>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let mut tickets: Vec<IndexedTicket> = entries
            .values()
            .filter(|e| filter.matches(&e.project))
            .map(|e| IndexedTicket {
                ticket_id: e.ticket_id.clone(),
                project: e.project.clone(),
                status: e.status.clone(),
                last_modified: e.last_modified,
                content_hash: e.content_hash.clone(),
            })
            .collect();
        tickets.sort_by(|a, b| a.ticket_id.cmp(&b.ticket_id));
        Ok(tickets)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(|_| poisoned())?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: &str, project: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            ticket_id: id.to_string(),
            project: project.to_string(),
            title: format!("title {id}"),
            status: "Open".to_string(),
            last_modified: Utc::now(),
            content_hash: format!("hash-{id}"),
            model: "test".to_string(),
            vector,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_ticket_id() {
        let index = InMemoryIndex::new();
        index.upsert(entry("OPS-1", "OPS", vec![1.0, 0.0])).await.unwrap();
        index.upsert(entry("OPS-1", "OPS", vec![0.0, 1.0])).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        assert_eq!(index.get("OPS-1").unwrap().vector, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_query_respects_scope_and_k() {
        let index = InMemoryIndex::new();
        index.upsert(entry("OPS-1", "OPS", vec![1.0, 0.0])).await.unwrap();
        index.upsert(entry("OPS-2", "OPS", vec![0.9, 0.1])).await.unwrap();
        index.upsert(entry("PAY-1", "PAY", vec![1.0, 0.0])).await.unwrap();

        let hits = index
            .query(&[1.0, 0.0], 1, &ScopeFilter::project("OPS"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].ticket_id, "OPS-1");

        let all = index.query(&[1.0, 0.0], 10, &ScopeFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_query_cut_keeps_newest_of_tied_hits() {
        let index = InMemoryIndex::new();
        let start = Utc::now() - chrono::Duration::days(30);
        for i in 1..=25 {
            let mut e = entry(&format!("OPS-{i}"), "OPS", vec![1.0, 0.0]);
            e.last_modified = start + chrono::Duration::hours(i);
            index.upsert(e).await.unwrap();
        }
        let hits = index
            .query(&[1.0, 0.0], 20, &ScopeFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 20);
        assert_eq!(hits[0].ticket_id, "OPS-25");
        assert!(hits.iter().all(|h| h.ticket_id != "OPS-1"));
    }

    #[tokio::test]
    async fn test_delete() {
        let index = InMemoryIndex::new();
        index.upsert(entry("OPS-1", "OPS", vec![1.0])).await.unwrap();
        assert!(index.delete("OPS-1").await.unwrap());
        assert!(!index.delete("OPS-1").await.unwrap());
        assert_eq!(index.content_hash("OPS-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_is_scoped() {
        let index = InMemoryIndex::new();
        index.upsert(entry("OPS-2", "OPS", vec![1.0])).await.unwrap();
        index.upsert(entry("OPS-1", "OPS", vec![1.0])).await.unwrap();
        index.upsert(entry("PAY-1", "PAY", vec![1.0])).await.unwrap();
        let listed = index.list(&ScopeFilter::project("OPS")).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|t| t.ticket_id.as_str()).collect();
        assert_eq!(ids, vec!["OPS-1", "OPS-2"]);
        assert_eq!(listed[0].content_hash, "hash-OPS-1");
    }
}
