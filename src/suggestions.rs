//! OpenAI-backed [`SuggestionProvider`].
//!
//! Asks a chat-completions model for a JSON object with suggested ticket
//! fields, and for a short plain-text ticket summary. Requires the
//! `OPENAI_API_KEY` environment variable. One attempt per call: the
//! orchestrator treats any failure as "no suggestion".

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use ticket_flow_core::models::TicketRecord;

use crate::config::SuggestionsConfig;
use crate::traits::{NoSuggestions, Suggestion, SuggestionProvider};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

const SUGGEST_PROMPT: &str = "You turn a user's problem report into an issue-tracker ticket. \
Reply with a JSON object with the keys \"title\" (at most 80 characters), \"description\" \
(a clear restatement of the problem with any steps or impact mentioned), \"issue_type\" \
(one of Bug, Task, Story) and \"criticality\" (one of P0, P1, P2, P3, P4, where P0 is an \
outage). Do not invent details that are not in the report.";

const SUMMARY_PROMPT: &str = "Summarize the following issue-tracker ticket in one or two \
sentences: what the problem is and where it stands.";

pub struct OpenAISuggestions {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAISuggestions {
    pub fn new(config: &SuggestionsConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key,
            client,
        })
    }

    async fn complete(&self, system: &str, user: &str, json_output: bool) -> Result<String> {
        let mut body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });
        if json_output {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let response = self
            .client
            .post(COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("OpenAI request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, text);
        }

        let json: Value = response.json().await?;
        completion_content(&json)
    }
}

/// The first choice's message content.
fn completion_content(json: &Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow!("Invalid chat completion response: missing content"))
}

/// Parse the model's JSON answer, tolerating a fenced code block.
fn parse_suggestion(content: &str) -> Result<Suggestion> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let suggestion: Suggestion =
        serde_json::from_str(trimmed).context("Suggestion was not a JSON object")?;
    Ok(suggestion)
}

#[async_trait]
impl SuggestionProvider for OpenAISuggestions {
    async fn suggest(&self, raw_text: &str) -> Result<Suggestion> {
        let content = self.complete(SUGGEST_PROMPT, raw_text, true).await?;
        parse_suggestion(&content)
    }

    async fn summarize(&self, ticket: &TicketRecord) -> Result<String> {
        let text = format!(
            "Ticket {}\nTitle: {}\nStatus: {}\nType: {}\n\n{}",
            ticket.id, ticket.title, ticket.status, ticket.issue_type, ticket.description
        );
        let summary = self.complete(SUMMARY_PROMPT, &text, false).await?;
        if summary.is_empty() {
            bail!("empty summary");
        }
        Ok(summary)
    }
}

pub fn create_suggestions(config: &SuggestionsConfig) -> Result<Arc<dyn SuggestionProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(NoSuggestions)),
        "openai" => Ok(Arc::new(OpenAISuggestions::new(config)?)),
        other => bail!("Unknown suggestions provider: '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suggestion_plain_json() {
        let s = parse_suggestion(
            r#"{"title":"Checkout page blank","description":"Blank after login","issue_type":"Bug","criticality":"P1"}"#,
        )
        .unwrap();
        assert_eq!(s.title.as_deref(), Some("Checkout page blank"));
        assert_eq!(s.criticality.as_deref(), Some("P1"));
    }

    #[test]
    fn test_parse_suggestion_fenced_and_partial() {
        let s = parse_suggestion("```json\n{\"title\": \"Login loop\"}\n```").unwrap();
        assert_eq!(s.title.as_deref(), Some("Login loop"));
        assert_eq!(s.issue_type, None);
    }

    #[test]
    fn test_parse_suggestion_rejects_prose() {
        assert!(parse_suggestion("Sure! Here is a ticket.").is_err());
    }

    #[test]
    fn test_completion_content() {
        let json = json!({"choices": [{"message": {"content": "  hello \n"}}]});
        assert_eq!(completion_content(&json).unwrap(), "hello");
        assert!(completion_content(&json!({"choices": []})).is_err());
    }

    #[test]
    fn test_disabled_provider_selected() {
        let config = SuggestionsConfig::default();
        assert!(create_suggestions(&config).is_ok());
    }
}
