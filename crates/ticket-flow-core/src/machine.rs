//! Conversation state machine.
//!
//! Transitions are named operations with a declared set of phases they
//! may be applied in. [`apply_transition`] is pure: it validates the
//! current phase, produces the next state with the version bumped by
//! one, and returns the side effects the caller must carry out.
//!
//! ```text
//! IDLE ─Start─▶ DRAFTING ─SubmitDescription─▶ DUPLICATE_CHECK
//!                  ▲                               │ RecordCandidates
//!                  └──────────Revise───────── AWAITING_CONFIRMATION
//!                                                  │ Confirm
//!                          COMPLETED ◀─RecordCreated─ CREATING ─RecordCreateFailed─▶ FAILED
//! ```
//!
//! `FAILED` and `EXPIRED` are reachable from every non-terminal phase.

use chrono::{DateTime, Utc};

use crate::error::TransitionError;
use crate::models::{CandidateSet, ConversationState, DraftFields, Phase};
use crate::ui::{self, UiInstruction};

const NON_TERMINAL: &[Phase] = &[
    Phase::Idle,
    Phase::Drafting,
    Phase::DuplicateCheck,
    Phase::AwaitingConfirmation,
    Phase::Creating,
];
const STARTABLE: &[Phase] = &[Phase::Idle, Phase::Completed, Phase::Failed];
const DRAFTING: &[Phase] = &[Phase::Drafting];
const CHECKING: &[Phase] = &[Phase::DuplicateCheck];
const AWAITING: &[Phase] = &[Phase::AwaitingConfirmation];
const CREATING: &[Phase] = &[Phase::Creating];
const FAILED: &[Phase] = &[Phase::Failed];
const CANCELLABLE: &[Phase] = &[
    Phase::Drafting,
    Phase::DuplicateCheck,
    Phase::AwaitingConfirmation,
    Phase::Failed,
];
const TERMINAL: &[Phase] = &[Phase::Completed, Phase::Failed, Phase::Expired];

/// A named transition and its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Begin a new ticket flow.
    Start,
    /// The user described the issue; fields may include advisory
    /// suggestions merged in by the caller.
    SubmitDescription { draft: DraftFields },
    /// Detection finished (or degraded); stored atomically with the phase change.
    RecordCandidates { candidates: CandidateSet },
    /// Open the ticket form for review.
    ProceedToForm { trigger_id: Option<String> },
    /// Go back and rewrite the description.
    Revise,
    /// The ticket form was submitted.
    Confirm { fields: DraftFields },
    RecordCreated { ticket_id: String, url: Option<String> },
    RecordCreateFailed { reason: String },
    /// User-initiated retry after a failed creation.
    Retry,
    Cancel,
    Fail { reason: String },
    Expire,
    Reset,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::SubmitDescription { .. } => "submit_description",
            Transition::RecordCandidates { .. } => "record_candidates",
            Transition::ProceedToForm { .. } => "proceed_to_form",
            Transition::Revise => "revise",
            Transition::Confirm { .. } => "confirm",
            Transition::RecordCreated { .. } => "record_created",
            Transition::RecordCreateFailed { .. } => "record_create_failed",
            Transition::Retry => "retry",
            Transition::Cancel => "cancel",
            Transition::Fail { .. } => "fail",
            Transition::Expire => "expire",
            Transition::Reset => "reset",
        }
    }

    /// Phases in which this transition may be applied.
    pub fn valid_phases(&self) -> &'static [Phase] {
        match self {
            Transition::Start => STARTABLE,
            Transition::SubmitDescription { .. } => DRAFTING,
            Transition::RecordCandidates { .. } => CHECKING,
            Transition::ProceedToForm { .. } | Transition::Revise | Transition::Confirm { .. } => {
                AWAITING
            }
            Transition::RecordCreated { .. } | Transition::RecordCreateFailed { .. } => CREATING,
            Transition::Retry => FAILED,
            Transition::Cancel => CANCELLABLE,
            Transition::Fail { .. } | Transition::Expire => NON_TERMINAL,
            Transition::Reset => TERMINAL,
        }
    }
}

/// Work the caller must perform after committing a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Ui(UiInstruction),
    /// Run duplicate detection for the draft, then apply `RecordCandidates`.
    RunDuplicateCheck,
    /// Call the tracker exactly once for this version.
    CreateTicket { version: u64 },
}

/// Validate and apply `transition` to `state`.
///
/// The returned state has `version = state.version + 1` and
/// `updated_at = now`; expiry and event bookkeeping are left to the store.
pub fn apply_transition(
    state: &ConversationState,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<(ConversationState, Vec<Effect>), TransitionError> {
    let name = transition.name();
    if !transition.valid_phases().contains(&state.phase) {
        return Err(TransitionError::InvalidTransition {
            phase: state.phase,
            transition: name,
        });
    }

    let mut next = state.clone();
    next.version = state.version + 1;
    next.updated_at = now;
    let mut effects = Vec::new();

    match transition {
        Transition::Start => {
            next.phase = Phase::Drafting;
            next.draft = DraftFields::default();
            next.candidates = None;
            next.creation_version = None;
            next.created_ticket = None;
            next.last_error = None;
            effects.push(Effect::Ui(ui::prompt_for_description(&next)));
        }
        Transition::SubmitDescription { draft } => {
            next.draft.merge(draft);
            if next.draft.has_content() {
                next.phase = Phase::DuplicateCheck;
                next.candidates = None;
                effects.push(Effect::Ui(ui::status(&next, "Checking for similar tickets...")));
                effects.push(Effect::RunDuplicateCheck);
            } else {
                effects.push(Effect::Ui(ui::need_more_detail(&next)));
            }
        }
        Transition::RecordCandidates { candidates } => {
            next.phase = Phase::AwaitingConfirmation;
            next.candidates = Some(candidates);
            effects.push(Effect::Ui(ui::status(&next, "")));
            effects.push(Effect::Ui(ui::duplicate_report(&next)));
        }
        Transition::ProceedToForm { trigger_id } => {
            effects.push(Effect::Ui(ui::ticket_form(&next, trigger_id)));
            effects.push(Effect::Ui(ui::form_opened(&next)));
        }
        Transition::Revise => {
            next.phase = Phase::Drafting;
            next.candidates = None;
            effects.push(Effect::Ui(ui::prompt_for_description(&next)));
        }
        Transition::Confirm { fields } => {
            next.draft.merge(fields);
            if next.draft.effective_title().is_none() {
                return Err(TransitionError::InvalidTransition {
                    phase: state.phase,
                    transition: name,
                });
            }
            next.phase = Phase::Creating;
            next.creation_version = Some(next.version);
            next.last_error = None;
            effects.push(Effect::Ui(ui::status(&next, "Creating the ticket...")));
            effects.push(Effect::CreateTicket {
                version: next.version,
            });
        }
        Transition::RecordCreated { ticket_id, url } => {
            next.phase = Phase::Completed;
            effects.push(Effect::Ui(ui::status(&next, "")));
            effects.push(Effect::Ui(ui::created(&next, &ticket_id, url.as_deref())));
            next.created_ticket = Some(ticket_id);
        }
        Transition::RecordCreateFailed { reason } => {
            next.phase = Phase::Failed;
            effects.push(Effect::Ui(ui::status(&next, "")));
            effects.push(Effect::Ui(ui::creation_failed(&next, &reason)));
            next.last_error = Some(reason);
        }
        Transition::Retry => {
            next.creation_version = None;
            next.last_error = None;
            if next.candidates.is_some() {
                next.phase = Phase::AwaitingConfirmation;
                effects.push(Effect::Ui(ui::duplicate_report(&next)));
            } else {
                next.phase = Phase::Drafting;
                effects.push(Effect::Ui(ui::prompt_for_description(&next)));
            }
        }
        Transition::Cancel => {
            next.phase = Phase::Idle;
            next.draft = DraftFields::default();
            next.candidates = None;
            next.creation_version = None;
            effects.push(Effect::Ui(ui::cancelled(&next)));
        }
        Transition::Fail { reason } => {
            next.phase = Phase::Failed;
            next.last_error = Some(reason);
        }
        Transition::Expire => {
            next.phase = Phase::Expired;
        }
        Transition::Reset => {
            next.phase = Phase::Idle;
            next.draft = DraftFields::default();
            next.candidates = None;
            next.creation_version = None;
            next.created_ticket = None;
            next.last_error = None;
        }
    }

    Ok((next, effects))
}
