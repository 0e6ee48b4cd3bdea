//! Flow orchestrator.
//!
//! Consumes [`InboundEvent`]s, drives the [`ConversationStore`], and
//! carries out the effects of each committed transition:
//!
//! - **Run duplicate check**: detection runs on a spawned task under the
//!   configured timeout. Its candidate set (or a degraded set on timeout
//!   or failure) is recorded at the version the check was started for.
//!   If the conversation moved on meanwhile, the result is dropped.
//! - **Create ticket**: the tracker is called once for the version that
//!   entered `CREATING`, then `RecordCreated` or `RecordCreateFailed` is
//!   applied. Failures are never retried automatically.
//!
//! Events rendered against a version (buttons, modals) that find a newer
//! version are dropped with a notice; version-less events (mentions,
//! messages) re-read and retry a bounded number of times.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use ticket_flow_core::conversation::store::{Applied, ConversationStore};
use ticket_flow_core::detect::DuplicateDetector;
use ticket_flow_core::error::{DetectionError, TransitionError};
use ticket_flow_core::index::ScopeFilter;
use ticket_flow_core::machine::{Effect, Transition};
use ticket_flow_core::models::{
    CandidateSet, ConversationState, DegradedReason, DraftFields, Phase, TicketRecord,
};
use ticket_flow_core::text::extract_ticket_key;
use ticket_flow_core::ui::{self, UiInstruction};

use crate::config::Config;
use crate::events::{self, EventKind, InboundEvent, Route, TicketPeriod};
use crate::traits::{CreateFields, IssueTracker, SuggestionProvider, TrackerError, TrackerQuery};

/// Orchestrator tuning, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub detection_timeout: Duration,
    pub max_stale_retries: u32,
    pub default_project: Option<String>,
    pub default_issue_type: String,
    pub closed_statuses: Vec<String>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            detection_timeout: config.detection.timeout(),
            max_stale_retries: config.conversation.max_stale_retries,
            default_project: config.tracker.default_project.clone(),
            default_issue_type: config.tracker.default_issue_type.clone(),
            closed_statuses: config.ingestion.closed_statuses.clone(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            detection_timeout: Duration::from_millis(3000),
            max_stale_retries: 3,
            default_project: None,
            default_issue_type: "Task".to_string(),
            closed_statuses: vec!["Done".into(), "Closed".into(), "Resolved".into()],
        }
    }
}

fn degraded_reason(err: &DetectionError) -> DegradedReason {
    match err {
        DetectionError::Timeout(_) => DegradedReason::Timeout,
        DetectionError::Unavailable(_) => DegradedReason::Unavailable,
    }
}

/// Run detection on its own task, bounded by `timeout`.
///
/// Never fails: timeouts and errors come back as a degraded set. A task
/// that outlives the timeout keeps running and its result is discarded.
pub async fn check_duplicates(
    detector: &Arc<DuplicateDetector>,
    text: &str,
    scope: ScopeFilter,
    timeout: Duration,
) -> CandidateSet {
    let detector = Arc::clone(detector);
    let text = text.to_string();
    let task = tokio::spawn(async move { detector.detect(&text, &scope).await });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(candidates))) => CandidateSet::found(candidates),
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Duplicate detection degraded");
            CandidateSet::degraded(degraded_reason(&e))
        }
        Ok(Err(join_err)) => {
            warn!(error = %join_err, "Duplicate detection task failed");
            CandidateSet::degraded(DegradedReason::Unavailable)
        }
        Err(_) => {
            let e = DetectionError::Timeout(timeout.as_millis() as u64);
            warn!(error = %e, "Duplicate detection degraded");
            CandidateSet::degraded(DegradedReason::Timeout)
        }
    }
}

pub struct Orchestrator {
    store: ConversationStore,
    detector: Arc<DuplicateDetector>,
    tracker: Arc<dyn IssueTracker>,
    suggestions: Arc<dyn SuggestionProvider>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: ConversationStore,
        detector: Arc<DuplicateDetector>,
        tracker: Arc<dyn IssueTracker>,
        suggestions: Arc<dyn SuggestionProvider>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            detector,
            tracker,
            suggestions,
            settings,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn detector(&self) -> &Arc<DuplicateDetector> {
        &self.detector
    }

    pub fn detection_timeout(&self) -> Duration {
        self.settings.detection_timeout
    }

    fn scope_for(&self, draft: &DraftFields) -> ScopeFilter {
        ScopeFilter {
            project: draft
                .project
                .clone()
                .or_else(|| self.settings.default_project.clone()),
        }
    }

    /// Handle one inbound event and return the UI instructions to render,
    /// in order.
    pub async fn handle(&self, event: &InboundEvent) -> Result<Vec<UiInstruction>> {
        let route = events::route(event)?;
        debug!(event_id = %event.event_id, route = ?route, "Routing event");

        match route {
            Route::Ignore => Ok(Vec::new()),
            Route::Summarize { text } => self.summarize(event, &text).await,
            Route::MyTickets { period } => self.my_tickets(event, period).await,
            Route::Describe { text } => self.describe(event, &text).await,
            Route::Apply {
                transition,
                expected_version,
            } => {
                let key = event.conversation_key();
                if self.store.has_seen(&key, &event.event_id).await? {
                    debug!(conversation = %key, event_id = %event.event_id, "Re-delivered event ignored");
                    return Ok(Vec::new());
                }
                let mut out = self.apply_event(event, transition, expected_version).await?;
                if let EventKind::Button {
                    action_id,
                    message_ts: Some(ts),
                    ..
                } = &event.kind
                {
                    if !out.is_empty() {
                        out.insert(
                            0,
                            UiInstruction::UpdateMessage {
                                channel: event.channel.clone(),
                                message_ts: ts.clone(),
                                text: format!("<@{}> chose *{}*.", event.user, action_id),
                            },
                        );
                    }
                }
                Ok(out)
            }
        }
    }

    /// A message in a conversation. Only a drafting conversation takes
    /// it; any other thread chatter is ignored.
    async fn describe(&self, event: &InboundEvent, text: &str) -> Result<Vec<UiInstruction>> {
        let key = event.conversation_key();
        let Some(state) = self.store.get(&key).await? else {
            return Ok(Vec::new());
        };
        if state.has_seen(&event.event_id) {
            return Ok(Vec::new());
        }
        if state.phase != Phase::Drafting && !state.is_expired(Utc::now()) {
            debug!(conversation = %key, phase = %state.phase, "Message outside drafting ignored");
            return Ok(Vec::new());
        }

        let draft = match self.suggestions.suggest(text).await {
            Ok(suggestion) => suggestion.into_draft(text),
            Err(e) => {
                warn!(conversation = %key, error = %e, "Suggestions unavailable, using raw text");
                DraftFields {
                    raw_text: Some(text.to_string()),
                    ..Default::default()
                }
            }
        };
        self.apply_event(event, Transition::SubmitDescription { draft }, None)
            .await
    }

    async fn apply_event(
        &self,
        event: &InboundEvent,
        transition: Transition,
        expected_version: Option<u64>,
    ) -> Result<Vec<UiInstruction>> {
        let key = event.conversation_key();
        let reply_to = event.reply_target();
        let mut attempt = 0;

        let applied = loop {
            let now = Utc::now();
            let state = self.store.get_or_create(&key, reply_to.clone(), now).await?;
            let version = expected_version.unwrap_or(state.version);

            match self
                .store
                .apply(&key, version, Some(&event.event_id), transition.clone(), now)
                .await
            {
                Ok(applied) => break applied,
                Err(TransitionError::StaleVersion { actual, .. }) => {
                    if expected_version.is_some() {
                        info!(conversation = %key, expected = version, actual, "Dropping out-of-date action");
                        return Ok(vec![ui::soft_error(
                            &state.reply_to,
                            &event.user,
                            "That button is out of date; please use the latest message in this thread.",
                        )]);
                    }
                    if attempt >= self.settings.max_stale_retries {
                        return Err(anyhow!(
                            "conversation {} kept changing; gave up after {} attempts",
                            key,
                            attempt + 1
                        ));
                    }
                    attempt += 1;
                    debug!(conversation = %key, attempt, "Stale version, retrying");
                }
                Err(TransitionError::InvalidTransition { phase, transition }) => {
                    debug!(conversation = %key, %phase, transition, "Invalid transition");
                    let mut out = Vec::new();
                    if state.is_expired(now) && !state.phase.is_terminal() && state.phase != Phase::Idle {
                        out.push(ui::expired(&state));
                    }
                    out.push(ui::soft_error(
                        &state.reply_to,
                        &event.user,
                        &invalid_message(phase),
                    ));
                    return Ok(out);
                }
                Err(TransitionError::NotFound(_)) if attempt < self.settings.max_stale_retries => {
                    // Swept between read and apply.
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        if applied.replayed {
            return Ok(Vec::new());
        }
        self.run_effects(applied).await
    }

    /// Execute effects in order, following up with the transitions they
    /// produce, and collect every UI instruction.
    async fn run_effects(&self, applied: Applied) -> Result<Vec<UiInstruction>> {
        let mut out = Vec::new();
        let mut state = applied.state;
        let mut queue: VecDeque<Effect> = applied.effects.into();

        while let Some(effect) = queue.pop_front() {
            let follow_up = match effect {
                Effect::Ui(instruction) => {
                    out.push(instruction);
                    None
                }
                Effect::RunDuplicateCheck => {
                    let candidates = check_duplicates(
                        &self.detector,
                        &state.draft.detection_text(),
                        self.scope_for(&state.draft),
                        self.settings.detection_timeout,
                    )
                    .await;
                    Some(Transition::RecordCandidates { candidates })
                }
                Effect::CreateTicket { version } => self.create_ticket(&state, version).await,
            };

            let Some(transition) = follow_up else {
                continue;
            };
            let name = transition.name();
            match self
                .store
                .apply(&state.key, state.version, None, transition.clone(), Utc::now())
                .await
            {
                Ok(next) => {
                    state = next.state;
                    queue.extend(next.effects);
                }
                Err(e @ (TransitionError::StaleVersion { .. } | TransitionError::InvalidTransition { .. })) => {
                    // The conversation moved on while we were waiting.
                    info!(conversation = %state.key, transition = name, error = %e, "Dropping stale result");
                    if let Transition::RecordCreated { ticket_id, url } = transition {
                        out.push(ui::created(&state, &ticket_id, url.as_deref()));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    /// Call the tracker once for `version` and return the outcome as a
    /// transition.
    async fn create_ticket(&self, state: &ConversationState, version: u64) -> Option<Transition> {
        if state.phase != Phase::Creating || state.creation_version != Some(version) {
            warn!(conversation = %state.key, version, "Create effect does not match state; skipped");
            return None;
        }

        let default_project = self.settings.default_project.as_deref().unwrap_or("");
        let fields = CreateFields::from_draft(
            &state.draft,
            default_project,
            &self.settings.default_issue_type,
        )
        .filter(|f| !f.project.is_empty())
        .map(|f| CreateFields {
            reporter: Some(state.key.user.clone()),
            ..f
        });
        let Some(fields) = fields else {
            return Some(Transition::RecordCreateFailed {
                reason: "the ticket has no title or no project".to_string(),
            });
        };

        match self.tracker.create(&fields).await {
            Ok(created) => {
                info!(conversation = %state.key, version, ticket_id = %created.id, "Ticket created");
                Some(Transition::RecordCreated {
                    ticket_id: created.id,
                    url: created.url,
                })
            }
            Err(e) => {
                warn!(conversation = %state.key, version, error = %e, "Ticket creation failed");
                Some(Transition::RecordCreateFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Evict expired conversations.
    pub async fn sweep(&self, limit: usize) -> Result<usize> {
        Ok(self.store.sweep(Utc::now(), limit).await?)
    }

    // ============ Query flows ============

    async fn summarize(&self, event: &InboundEvent, text: &str) -> Result<Vec<UiInstruction>> {
        let target = event.reply_target();
        let Some(ticket_key) = extract_ticket_key(text) else {
            return Ok(vec![ui::soft_error(
                &target,
                &event.user,
                "Please include a ticket key such as PROJ-123 to summarize.",
            )]);
        };

        let ticket = match self.tracker.get(&ticket_key).await {
            Ok(ticket) => ticket,
            Err(TrackerError::NotFound(_)) => {
                return Ok(vec![ui::plain(
                    &target,
                    format!("I couldn't find ticket {}.", ticket_key),
                )])
            }
            Err(e) => {
                warn!(ticket_id = %ticket_key, error = %e, "Ticket lookup failed");
                return Ok(vec![ui::plain(
                    &target,
                    format!("I couldn't reach the tracker to look up {}.", ticket_key),
                )]);
            }
        };

        let body = match self.suggestions.summarize(&ticket).await {
            Ok(summary) => summary,
            Err(e) => {
                debug!(ticket_id = %ticket.id, error = %e, "Summary unavailable, showing ticket fields");
                render_ticket(&ticket)
            }
        };
        Ok(vec![ui::plain(
            &target,
            format!("{}\n{}", ticket_heading(&ticket), body),
        )])
    }

    /// Open tickets assigned to the sender, optionally limited to those
    /// updated within `period`.
    async fn my_tickets(
        &self,
        event: &InboundEvent,
        period: Option<TicketPeriod>,
    ) -> Result<Vec<UiInstruction>> {
        let target = event.reply_target();
        let Some(project) = self.settings.default_project.as_deref() else {
            return Ok(vec![ui::soft_error(
                &target,
                &event.user,
                "No default project is configured.",
            )]);
        };

        let account = match self
            .tracker
            .find_user(event.user_email.as_deref(), event.user_name.as_deref())
            .await
        {
            Ok(Some(account)) => account,
            Ok(None) => {
                info!(user = %event.user, "No tracker account matches chat user");
                return Ok(vec![ui::soft_error(
                    &target,
                    &event.user,
                    "I couldn't match your chat profile to a tracker account. \
                     Check that your email or display name matches the tracker.",
                )]);
            }
            Err(e) => {
                warn!(user = %event.user, error = %e, "Tracker user lookup failed");
                return Ok(vec![ui::soft_error(
                    &target,
                    &event.user,
                    "I couldn't reach the tracker right now.",
                )]);
            }
        };

        let query = TrackerQuery {
            max_results: 20,
            assignee: Some(account),
            modified_after: period.map(|p| p.since(Utc::now())),
            exclude_statuses: self.settings.closed_statuses.clone(),
            ..Default::default()
        };
        let window = period
            .map(|p| format!(" updated in {}", p.label()))
            .unwrap_or_default();
        let text = match self.tracker.search(project, &query).await {
            Ok(tickets) if tickets.is_empty() => format!("You have no open tickets{}.", window),
            Ok(tickets) => {
                let mut text = format!("Your open tickets in {}{}:\n", project, window);
                for t in &tickets {
                    text.push_str(&format!("• {} ({})\n", ticket_heading(t), t.status));
                }
                text
            }
            Err(e) => {
                warn!(project, error = %e, "Ticket search failed");
                "I couldn't reach the tracker right now.".to_string()
            }
        };
        Ok(vec![ui::soft_error(&target, &event.user, &text)])
    }
}

fn invalid_message(phase: Phase) -> String {
    match phase {
        Phase::Idle => "No ticket is being drafted here; mention me to start one.".into(),
        Phase::Drafting => "A ticket is already being drafted here; describe the issue or cancel first.".into(),
        Phase::DuplicateCheck => "I'm still checking for similar tickets.".into(),
        Phase::AwaitingConfirmation => "A ticket draft is waiting for your decision above.".into(),
        Phase::Creating => "The ticket is already being created.".into(),
        other => format!("That action isn't available right now ({}).", other),
    }
}

fn ticket_heading(ticket: &TicketRecord) -> String {
    match &ticket.url {
        Some(url) => format!("<{}|{}> {}", url, ticket.id, ticket.title),
        None => format!("*{}* {}", ticket.id, ticket.title),
    }
}

/// Plain rendering used when no summary could be generated.
fn render_ticket(ticket: &TicketRecord) -> String {
    let mut out = format!("Status: {}", ticket.status);
    if let Some(assignee) = &ticket.assignee {
        out.push_str(&format!(", assigned to {}", assignee));
    }
    let description = ticket.description.trim();
    if !description.is_empty() {
        let snippet: String = description.chars().take(280).collect();
        out.push('\n');
        out.push_str(&snippet);
        if snippet.len() < description.len() {
            out.push('…');
        }
    }
    out
}
