//! In-process fakes shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use ticket_flow::traits::{
    CreateFields, CreatedTicket, IssueTracker, TrackerError, TrackerQuery,
};
use ticket_flow_core::embedding::EmbeddingProvider;
use ticket_flow_core::error::EmbeddingError;
use ticket_flow_core::models::TicketRecord;

// ─── Issue tracker ─────────────────────────────────────────────────

/// Tracker backed by a vector of tickets; counts `create` calls.
#[derive(Default)]
pub struct FakeTracker {
    pub tickets: Mutex<Vec<TicketRecord>>,
    pub created: Mutex<Vec<CreateFields>>,
    pub create_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
    pub fail_create: AtomicBool,
    /// When set, `create` waits for a notification before answering.
    pub gate: Mutex<Option<Arc<Notify>>>,
    /// `(n, ticket)`: upsert `ticket` right after the n-th search answers,
    /// as if someone edited it while a sweep was paging.
    pub edit_after_search: Mutex<Option<(usize, TicketRecord)>>,
    /// `(email or display name, account id)` pairs known to `find_user`.
    pub users: Mutex<Vec<(String, String)>>,
    /// Every query passed to `search`, in order.
    pub queries: Mutex<Vec<TrackerQuery>>,
}

impl FakeTracker {
    pub fn new(tickets: Vec<TicketRecord>) -> Arc<Self> {
        Arc::new(Self {
            tickets: Mutex::new(tickets),
            ..Default::default()
        })
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn upsert(&self, ticket: TicketRecord) {
        let mut tickets = self.tickets.lock().unwrap();
        tickets.retain(|t| t.id != ticket.id);
        tickets.push(ticket);
    }

    pub fn add_user(&self, email_or_name: &str, account: &str) {
        self.users
            .lock()
            .unwrap()
            .push((email_or_name.to_string(), account.to_string()));
    }

    pub fn remove(&self, id: &str) {
        self.tickets.lock().unwrap().retain(|t| t.id != id);
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn search(
        &self,
        project: &str,
        query: &TrackerQuery,
    ) -> Result<Vec<TicketRecord>, TrackerError> {
        let call = self.search_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.queries.lock().unwrap().push(query.clone());
        let mut matching: Vec<TicketRecord> = self
            .tickets
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.project == project)
            .filter(|t| query.modified_after.map_or(true, |after| t.last_modified >= after))
            .filter(|t| {
                query
                    .assignee
                    .as_ref()
                    .map_or(true, |a| t.assignee.as_ref() == Some(a))
            })
            .filter(|t| !query.exclude_statuses.contains(&t.status))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.id.cmp(&b.id))
        });
        let page: Vec<TicketRecord> = matching
            .into_iter()
            .skip(query.start_at)
            .take(query.max_results.max(1))
            .collect();

        let edit = {
            let mut pending = self.edit_after_search.lock().unwrap();
            match pending.as_ref() {
                Some((n, _)) if *n == call => pending.take().map(|(_, t)| t),
                _ => None,
            }
        };
        if let Some(ticket) = edit {
            self.upsert(ticket);
        }
        Ok(page)
    }

    async fn create(&self, fields: &CreateFields) -> Result<CreatedTicket, TrackerError> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TrackerError::Transient("tracker returned 503".to_string()));
        }
        self.created.lock().unwrap().push(fields.clone());
        let id = format!("{}-{}", fields.project, 100 + n);
        Ok(CreatedTicket {
            url: Some(format!("https://tracker.example/browse/{}", id)),
            id,
        })
    }

    async fn get(&self, ticket_id: &str) -> Result<TicketRecord, TrackerError> {
        self.tickets
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == ticket_id)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(ticket_id.to_string()))
    }

    async fn find_user(
        &self,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<Option<String>, TrackerError> {
        let users = self.users.lock().unwrap();
        let lookup = |key: Option<&str>| {
            key.and_then(|k| users.iter().find(|(known, _)| known == k))
                .map(|(_, account)| account.clone())
        };
        Ok(lookup(email).or_else(|| lookup(name)))
    }
}

// ─── Embedding providers ───────────────────────────────────────────

/// Returns the same vector for every text, optionally slowly or not at all.
pub struct FixedProvider {
    pub vector: Vec<f32>,
    pub delay: Option<Duration>,
    pub unavailable: bool,
    pub calls: AtomicUsize,
}

impl FixedProvider {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector,
            delay: None,
            unavailable: false,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for FixedProvider {
    fn model_name(&self) -> &str {
        "fixed"
    }
    fn dims(&self) -> usize {
        self.vector.len()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable {
            return Err(EmbeddingError::Unavailable("connection refused".to_string()));
        }
        Ok(texts.iter().map(|_| self.vector.clone()).collect())
    }
}

/// Deterministic bag-of-letters vectors. Rejects any batch containing
/// "poison"; can be switched to unavailable.
#[derive(Default)]
pub struct LetterProvider {
    pub texts_embedded: AtomicUsize,
    pub calls: AtomicUsize,
    pub unavailable: AtomicBool,
}

impl LetterProvider {
    pub fn embedded(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 26];
        for c in text.chars().filter(|c| c.is_ascii_lowercase()) {
            v[(c as u8 - b'a') as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for LetterProvider {
    fn model_name(&self) -> &str {
        "letters"
    }
    fn dims(&self) -> usize {
        26
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Unavailable("rate limited".to_string()));
        }
        if texts.iter().any(|t| t.contains("poison")) {
            return Err(EmbeddingError::Rejected("input rejected".to_string()));
        }
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

// ─── Records ───────────────────────────────────────────────────────

pub fn ticket(id: &str, title: &str, status: &str, last_modified: DateTime<Utc>) -> TicketRecord {
    let project = id.split('-').next().unwrap_or("OPS").to_string();
    TicketRecord {
        id: id.to_string(),
        project,
        title: title.to_string(),
        description: format!("details for {}", title.to_lowercase()),
        issue_type: "Bug".to_string(),
        status: status.to_string(),
        assignee: None,
        url: Some(format!("https://tracker.example/browse/{}", id)),
        last_modified,
    }
}

pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::days(days)
}
