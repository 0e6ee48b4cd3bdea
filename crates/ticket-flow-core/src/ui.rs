//! Chat UI instructions returned to the chat-platform collaborator.
//!
//! The core never talks to the chat transport; it returns an ordered list
//! of [`UiInstruction`]s which the collaborator renders (Block Kit
//! messages, modals, status lines). Button values embed the conversation
//! version that was current when the button was rendered, so a click
//! carries the version it was meant for.

use serde::{Deserialize, Serialize};

use crate::models::{CandidateSet, ConversationState, DegradedReason, DraftFields};

pub const ACTION_START: &str = "start";
pub const ACTION_PROCEED: &str = "proceed";
pub const ACTION_EDIT: &str = "edit";
pub const ACTION_CANCEL: &str = "cancel";
pub const ACTION_RETRY: &str = "retry";
pub const TICKET_FORM_CALLBACK: &str = "ticket_form";

/// Where replies for a conversation are posted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub channel: String,
    #[serde(default)]
    pub thread: Option<String>,
}

impl ReplyTarget {
    pub fn new(channel: impl Into<String>, thread: Option<&str>) -> Self {
        Self {
            channel: channel.into(),
            thread: thread.map(str::to_string),
        }
    }
}

/// Value carried by every action button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionValue {
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    pub action_id: String,
    pub label: String,
    /// JSON-encoded [`ActionValue`].
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

impl ActionButton {
    fn new(action_id: &str, label: &str, version: u64, style: Option<&str>) -> Self {
        let value = serde_json::to_string(&ActionValue { version })
            .unwrap_or_else(|_| format!("{{\"version\":{version}}}"));
        Self {
            action_id: action_id.to_string(),
            label: label.to_string(),
            value,
            style: style.map(str::to_string),
        }
    }
}

/// The ticket form, pre-filled from the draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketModal {
    pub callback_id: String,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub criticality: Option<String>,
    /// JSON-encoded [`ActionValue`]; echoed back on submission.
    pub private_metadata: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiInstruction {
    PostMessage {
        target: ReplyTarget,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        actions: Vec<ActionButton>,
        /// Post visible only to this user.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ephemeral_user: Option<String>,
    },
    OpenModal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger_id: Option<String>,
        modal: TicketModal,
    },
    UpdateMessage {
        channel: String,
        message_ts: String,
        text: String,
    },
    SetStatus {
        target: ReplyTarget,
        status: String,
    },
}

fn post(target: &ReplyTarget, text: String, actions: Vec<ActionButton>) -> UiInstruction {
    UiInstruction::PostMessage {
        target: target.clone(),
        text,
        actions,
        ephemeral_user: None,
    }
}

pub fn prompt_for_description(state: &ConversationState) -> UiInstruction {
    post(
        &state.reply_to,
        format!(
            "<@{}>, let's create a ticket. Please describe the issue or request in this thread.",
            state.key.user
        ),
        vec![ActionButton::new(ACTION_CANCEL, "Cancel", state.version, None)],
    )
}

pub fn need_more_detail(state: &ConversationState) -> UiInstruction {
    post(
        &state.reply_to,
        "I need a short description of the problem before I can check for similar tickets."
            .to_string(),
        Vec::new(),
    )
}

pub fn status(state: &ConversationState, text: &str) -> UiInstruction {
    UiInstruction::SetStatus {
        target: state.reply_to.clone(),
        status: text.to_string(),
    }
}

fn draft_summary(draft: &DraftFields) -> String {
    let mut out = String::new();
    if let Some(title) = draft.effective_title() {
        out.push_str(&format!("*Suggested title:* {}\n", title));
    }
    if let Some(desc) = draft.description.as_deref().or(draft.raw_text.as_deref()) {
        out.push_str(&format!("*Description:*\n```{}```\n", desc.trim()));
    }
    if let Some(kind) = draft.issue_type.as_deref() {
        out.push_str(&format!("*Type:* {}", kind));
        if let Some(crit) = draft.criticality.as_deref() {
            out.push_str(&format!("  *Criticality:* {}", crit));
        }
        out.push('\n');
    }
    out
}

fn candidate_lines(set: &CandidateSet) -> String {
    match set.degraded {
        Some(DegradedReason::Timeout) => {
            return "⚠️ The duplicate check timed out, so similar tickets could not be verified. \
                    Please search the tracker before creating a new ticket."
                .to_string()
        }
        Some(DegradedReason::Unavailable) => {
            return "⚠️ The duplicate check is currently unavailable, so similar tickets could not \
                    be verified. Please search the tracker before creating a new ticket."
                .to_string()
        }
        None => {}
    }
    if set.candidates.is_empty() {
        return "No similar tickets found.".to_string();
    }
    let mut out = String::from("I found tickets that look similar:\n");
    for c in &set.candidates {
        out.push_str(&format!(
            "{}. *{}* {} (similarity {:.2})\n",
            c.rank,
            c.ticket_id,
            c.title.as_deref().unwrap_or(""),
            c.score
        ));
    }
    out
}

/// The duplicate report with proceed / edit / cancel actions.
pub fn duplicate_report(state: &ConversationState) -> UiInstruction {
    let mut text = draft_summary(&state.draft);
    if let Some(set) = &state.candidates {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&candidate_lines(set));
    }
    post(
        &state.reply_to,
        text,
        vec![
            ActionButton::new(ACTION_PROCEED, "Create ticket", state.version, Some("primary")),
            ActionButton::new(ACTION_EDIT, "Edit description", state.version, None),
            ActionButton::new(ACTION_CANCEL, "Cancel", state.version, Some("danger")),
        ],
    )
}

pub fn ticket_form(state: &ConversationState, trigger_id: Option<String>) -> UiInstruction {
    let draft = &state.draft;
    let metadata = serde_json::to_string(&ActionValue {
        version: state.version,
    })
    .unwrap_or_default();
    UiInstruction::OpenModal {
        trigger_id,
        modal: TicketModal {
            callback_id: TICKET_FORM_CALLBACK.to_string(),
            title: draft.effective_title().unwrap_or_default(),
            description: draft
                .description
                .clone()
                .or_else(|| draft.raw_text.clone())
                .unwrap_or_default(),
            issue_type: draft.issue_type.clone(),
            criticality: draft.criticality.clone(),
            private_metadata: metadata,
        },
    }
}

/// Posted alongside the form so a dismissed form can be reopened or
/// abandoned at the current version.
pub fn form_opened(state: &ConversationState) -> UiInstruction {
    post(
        &state.reply_to,
        "The ticket form is open. Closed it by mistake? You can reopen it here.".to_string(),
        vec![
            ActionButton::new(ACTION_PROCEED, "Reopen form", state.version, Some("primary")),
            ActionButton::new(ACTION_EDIT, "Edit description", state.version, None),
            ActionButton::new(ACTION_CANCEL, "Cancel", state.version, Some("danger")),
        ],
    )
}

pub fn created(state: &ConversationState, ticket_id: &str, url: Option<&str>) -> UiInstruction {
    let link = match url {
        Some(u) => format!("<{}|{}>", u, ticket_id),
        None => ticket_id.to_string(),
    };
    post(
        &state.reply_to,
        format!("<@{}>, ticket {} has been created.", state.key.user, link),
        Vec::new(),
    )
}

pub fn creation_failed(state: &ConversationState, reason: &str) -> UiInstruction {
    post(
        &state.reply_to,
        format!(
            "Sorry <@{}>, the ticket could not be created: {}. Your draft has been kept.",
            state.key.user, reason
        ),
        vec![ActionButton::new(ACTION_RETRY, "Retry", state.version, Some("primary"))],
    )
}

pub fn cancelled(state: &ConversationState) -> UiInstruction {
    post(
        &state.reply_to,
        format!("<@{}>, the ticket creation has been cancelled.", state.key.user),
        Vec::new(),
    )
}

pub fn expired(state: &ConversationState) -> UiInstruction {
    post(
        &state.reply_to,
        "The previous ticket draft in this thread expired and was discarded.".to_string(),
        Vec::new(),
    )
}

/// A message only the acting user sees.
pub fn soft_error(target: &ReplyTarget, user: &str, text: &str) -> UiInstruction {
    UiInstruction::PostMessage {
        target: target.clone(),
        text: text.to_string(),
        actions: Vec::new(),
        ephemeral_user: Some(user.to_string()),
    }
}

pub fn plain(target: &ReplyTarget, text: String) -> UiInstruction {
    post(target, text, Vec::new())
}
