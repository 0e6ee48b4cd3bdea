//! Inbound chat events and their routing.
//!
//! The chat-platform collaborator posts each event as JSON:
//!
//! ```json
//! {
//!   "event_id": "Ev01", "workspace": "T1", "channel": "C1",
//!   "thread": "1700000000.0001", "user": "U1",
//!   "kind": "button",
//!   "payload": { "action_id": "proceed", "value": "{\"version\":3}" }
//! }
//! ```
//!
//! [`route`] maps every event to exactly one [`Route`]: a named
//! transition, a draft description (which needs suggestions before it
//! becomes a transition), a stateless query flow, or nothing.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ticket_flow_core::machine::Transition;
use ticket_flow_core::models::{ConversationKey, DraftFields};
use ticket_flow_core::text::extract_ticket_key;
use ticket_flow_core::ui::{self, ActionValue, ReplyTarget};

pub const SHORTCUT_CREATE: &str = "create_ticket";
pub const SHORTCUT_SUMMARIZE: &str = "summarize_ticket";
pub const SHORTCUT_MY_TICKETS: &str = "my_tickets";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event_id: String,
    pub workspace: String,
    pub channel: String,
    /// Thread the event belongs to, if any.
    #[serde(default)]
    pub thread: Option<String>,
    /// Timestamp of the message itself; a top-level mention starts a
    /// thread rooted here.
    #[serde(default)]
    pub ts: Option<String>,
    pub user: String,
    /// Sender's profile as the chat platform knows it. Used to find the
    /// matching tracker account; `user` is a chat-only id.
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub trigger_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    Mention {
        text: String,
    },
    Message {
        text: String,
    },
    Shortcut {
        callback_id: String,
        #[serde(default)]
        text: Option<String>,
    },
    Button {
        action_id: String,
        value: String,
        /// The message carrying the button, so it can be updated.
        #[serde(default)]
        message_ts: Option<String>,
    },
    ModalSubmit {
        callback_id: String,
        private_metadata: String,
        #[serde(default)]
        fields: DraftFields,
    },
}

impl InboundEvent {
    fn thread_root(&self) -> Option<&str> {
        match self.kind {
            EventKind::Mention { .. } => self.thread.as_deref().or(self.ts.as_deref()),
            _ => self.thread.as_deref(),
        }
    }

    /// Threads scope a conversation; outside a thread the channel does.
    pub fn conversation_key(&self) -> ConversationKey {
        let conversation = self.thread_root().unwrap_or(&self.channel);
        ConversationKey::new(&self.workspace, conversation, &self.user)
    }

    pub fn reply_target(&self) -> ReplyTarget {
        ReplyTarget::new(&self.channel, self.thread_root())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("malformed action value: {0}")]
    BadActionValue(String),
    #[error("unknown modal callback: {0}")]
    UnknownCallback(String),
}

/// What an event asks the orchestrator to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Apply a transition. `expected_version` is set when the event was
    /// rendered against a specific version (buttons, modals).
    Apply {
        transition: Transition,
        expected_version: Option<u64>,
    },
    /// The user described the problem.
    Describe { text: String },
    Summarize { text: String },
    MyTickets { period: Option<TicketPeriod> },
    Ignore,
}

/// Look-back window for the my-tickets listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketPeriod {
    OneWeek,
    TwoWeeks,
    OneMonth,
}

impl TicketPeriod {
    /// `1w`, `2w`, or `1m`, as sent by the period buttons.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "1w" => Some(TicketPeriod::OneWeek),
            "2w" => Some(TicketPeriod::TwoWeeks),
            "1m" => Some(TicketPeriod::OneMonth),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TicketPeriod::OneWeek => "the past week",
            TicketPeriod::TwoWeeks => "the past two weeks",
            TicketPeriod::OneMonth => "the past month",
        }
    }

    /// Start of the window ending at `now`.
    pub fn since(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let days = match self {
            TicketPeriod::OneWeek => 7,
            TicketPeriod::TwoWeeks => 14,
            TicketPeriod::OneMonth => 30,
        };
        now - Duration::days(days)
    }
}

fn parse_version(value: &str) -> Result<u64, EventError> {
    serde_json::from_str::<ActionValue>(value)
        .map(|v| v.version)
        .map_err(|_| EventError::BadActionValue(value.to_string()))
}

fn wants_summary(text: &str) -> bool {
    text.to_lowercase().contains("summar") && extract_ticket_key(text).is_some()
}

pub fn route(event: &InboundEvent) -> Result<Route, EventError> {
    let start = Route::Apply {
        transition: Transition::Start,
        expected_version: None,
    };
    Ok(match &event.kind {
        EventKind::Mention { text } if wants_summary(text) => Route::Summarize { text: text.clone() },
        EventKind::Mention { .. } => start,
        EventKind::Message { text } if text.trim().is_empty() => Route::Ignore,
        EventKind::Message { text } => Route::Describe { text: text.clone() },
        EventKind::Shortcut { callback_id, text } => match callback_id.as_str() {
            SHORTCUT_CREATE => start,
            SHORTCUT_SUMMARIZE => Route::Summarize {
                text: text.clone().unwrap_or_default(),
            },
            SHORTCUT_MY_TICKETS => Route::MyTickets {
                period: text.as_deref().and_then(TicketPeriod::parse),
            },
            _ => Route::Ignore,
        },
        EventKind::Button {
            action_id, value, ..
        } => {
            let version = parse_version(value)?;
            let transition = match action_id.as_str() {
                ui::ACTION_START => Transition::Start,
                ui::ACTION_PROCEED => Transition::ProceedToForm {
                    trigger_id: event.trigger_id.clone(),
                },
                ui::ACTION_EDIT => Transition::Revise,
                ui::ACTION_CANCEL => Transition::Cancel,
                ui::ACTION_RETRY => Transition::Retry,
                _ => return Ok(Route::Ignore),
            };
            Route::Apply {
                transition,
                expected_version: Some(version),
            }
        }
        EventKind::ModalSubmit {
            callback_id,
            private_metadata,
            fields,
        } => {
            if callback_id != ui::TICKET_FORM_CALLBACK {
                return Err(EventError::UnknownCallback(callback_id.clone()));
            }
            Route::Apply {
                transition: Transition::Confirm {
                    fields: fields.clone(),
                },
                expected_version: Some(parse_version(private_metadata)?),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind) -> InboundEvent {
        InboundEvent {
            event_id: "Ev1".into(),
            workspace: "T1".into(),
            channel: "C1".into(),
            thread: None,
            ts: Some("171.5".into()),
            user: "U1".into(),
            user_email: None,
            user_name: None,
            trigger_id: Some("trig".into()),
            kind,
        }
    }

    #[test]
    fn test_parse_button_event_json() {
        let json = r#"{
            "event_id": "Ev9", "workspace": "T1", "channel": "C1", "thread": "171.5",
            "user": "U1", "kind": "button",
            "payload": {"action_id": "proceed", "value": "{\"version\":3}"}
        }"#;
        let ev: InboundEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            route(&ev).unwrap(),
            Route::Apply {
                transition: Transition::ProceedToForm { trigger_id: None },
                expected_version: Some(3),
            }
        );
        assert_eq!(ev.conversation_key(), ConversationKey::new("T1", "171.5", "U1"));
    }

    #[test]
    fn test_top_level_mention_starts_thread_on_itself() {
        let ev = event(EventKind::Mention {
            text: "<@B1> new ticket".into(),
        });
        assert_eq!(ev.conversation_key().conversation, "171.5");
        assert_eq!(ev.reply_target().thread.as_deref(), Some("171.5"));
        assert!(matches!(
            route(&ev).unwrap(),
            Route::Apply {
                transition: Transition::Start,
                expected_version: None
            }
        ));
    }

    #[test]
    fn test_shortcut_outside_thread_is_keyed_by_channel() {
        let ev = event(EventKind::Shortcut {
            callback_id: SHORTCUT_CREATE.into(),
            text: None,
        });
        assert_eq!(ev.conversation_key().conversation, "C1");
    }

    #[test]
    fn test_mention_asking_for_summary_is_a_query() {
        let ev = event(EventKind::Mention {
            text: "<@B1> can you summarize ops-42?".into(),
        });
        assert!(matches!(route(&ev).unwrap(), Route::Summarize { .. }));
    }

    #[test]
    fn test_modal_submit_carries_version() {
        let ev = event(EventKind::ModalSubmit {
            callback_id: ui::TICKET_FORM_CALLBACK.into(),
            private_metadata: r#"{"version":7}"#.into(),
            fields: DraftFields {
                title: Some("Checkout blank".into()),
                ..Default::default()
            },
        });
        match route(&ev).unwrap() {
            Route::Apply {
                transition: Transition::Confirm { fields },
                expected_version,
            } => {
                assert_eq!(expected_version, Some(7));
                assert_eq!(fields.title.as_deref(), Some("Checkout blank"));
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn test_bad_button_value_is_an_error() {
        let ev = event(EventKind::Button {
            action_id: ui::ACTION_CANCEL.into(),
            value: "nope".into(),
            message_ts: None,
        });
        assert!(matches!(route(&ev), Err(EventError::BadActionValue(_))));
    }

    #[test]
    fn test_my_tickets_shortcut_reads_period() {
        let ev = event(EventKind::Shortcut {
            callback_id: SHORTCUT_MY_TICKETS.into(),
            text: Some(" 2W ".into()),
        });
        assert_eq!(
            route(&ev).unwrap(),
            Route::MyTickets {
                period: Some(TicketPeriod::TwoWeeks)
            }
        );

        let ev = event(EventKind::Shortcut {
            callback_id: SHORTCUT_MY_TICKETS.into(),
            text: Some("someday".into()),
        });
        assert_eq!(route(&ev).unwrap(), Route::MyTickets { period: None });
    }

    #[test]
    fn test_period_window() {
        let now = Utc::now();
        assert_eq!(TicketPeriod::OneWeek.since(now), now - Duration::days(7));
        assert_eq!(TicketPeriod::OneMonth.since(now), now - Duration::days(30));
        assert_eq!(TicketPeriod::parse("1m"), Some(TicketPeriod::OneMonth));
    }

    #[test]
    fn test_sender_profile_is_optional() {
        let json = r#"{
            "event_id": "Ev9", "workspace": "T1", "channel": "C1",
            "user": "U1", "user_email": "ana@example.com",
            "kind": "shortcut", "payload": {"callback_id": "my_tickets"}
        }"#;
        let ev: InboundEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.user_email.as_deref(), Some("ana@example.com"));
        assert!(ev.user_name.is_none());
    }

    #[test]
    fn test_blank_message_ignored() {
        let ev = event(EventKind::Message { text: "  ".into() });
        assert_eq!(route(&ev).unwrap(), Route::Ignore);
    }
}
