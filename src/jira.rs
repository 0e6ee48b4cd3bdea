//! Jira Cloud adapter for [`IssueTracker`].
//!
//! Uses the REST v3 API with basic auth (`JIRA_EMAIL` + `JIRA_API_TOKEN`).
//!
//! - `search` runs JQL ordered by `updated ASC`. The `updated` bound is
//!   sent relative to now, since absolute JQL dates are read in the
//!   account's timezone.
//! - `find_user` maps a chat profile onto an account id through the user
//!   search, by email and then by display name.
//! - `create` sends the description as Atlassian Document Format and
//!   maps criticality `P0..P4` onto Jira priorities. It is never retried.
//! - Network errors, 429 and 5xx map to [`TrackerError::Transient`];
//!   404 maps to [`TrackerError::NotFound`]; other 4xx responses map to
//!   [`TrackerError::CreateFailed`].

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use ticket_flow_core::models::TicketRecord;

use crate::config::TrackerConfig;
use crate::traits::{
    CreateFields, CreatedTicket, DisabledTracker, IssueTracker, TrackerError, TrackerQuery,
};

const SEARCH_FIELDS: &str = "summary,description,issuetype,status,assignee,updated,project";

pub struct JiraTracker {
    base_url: String,
    email: String,
    token: String,
    client: reqwest::Client,
}

impl JiraTracker {
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| anyhow!("tracker.base_url required for Jira"))?
            .trim_end_matches('/')
            .to_string();
        let email =
            std::env::var("JIRA_EMAIL").map_err(|_| anyhow!("JIRA_EMAIL environment variable not set"))?;
        let token = std::env::var("JIRA_API_TOKEN")
            .map_err(|_| anyhow!("JIRA_API_TOKEN environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url,
            email,
            token,
            client,
        })
    }

    fn browse_url(&self, key: &str) -> String {
        format!("{}/browse/{}", self.base_url, key)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, TrackerError> {
        let response = request
            .basic_auth(&self.email, Some(&self.token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| TrackerError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| TrackerError::Transient(format!("unreadable Jira response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("Jira API error {status}: {}", jira_error_message(&body));
        Err(match status.as_u16() {
            404 => TrackerError::NotFound(message),
            429 => TrackerError::Transient(message),
            s if s >= 500 => TrackerError::Transient(message),
            _ => TrackerError::CreateFailed(message),
        })
    }
}

#[async_trait]
impl IssueTracker for JiraTracker {
    async fn search(
        &self,
        project: &str,
        query: &TrackerQuery,
    ) -> Result<Vec<TicketRecord>, TrackerError> {
        let jql = build_jql(project, query, Utc::now());
        let start_at = query.start_at.to_string();
        let max_results = query.max_results.to_string();
        let request = self
            .client
            .get(format!("{}/rest/api/3/search", self.base_url))
            .query(&[
                ("jql", jql.as_str()),
                ("startAt", start_at.as_str()),
                ("maxResults", max_results.as_str()),
                ("fields", SEARCH_FIELDS),
            ]);
        let json = self.send(request).await?;

        let issues = json
            .get("issues")
            .and_then(Value::as_array)
            .ok_or_else(|| TrackerError::Transient("Jira search response missing issues".into()))?;

        let mut records = Vec::with_capacity(issues.len());
        for issue in issues {
            match parse_issue(issue, &self.base_url) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(project, error = %e, "Skipping unparseable Jira issue"),
            }
        }
        Ok(records)
    }

    async fn create(&self, fields: &CreateFields) -> Result<CreatedTicket, TrackerError> {
        let body = build_create_body(fields);
        let request = self
            .client
            .post(format!("{}/rest/api/3/issue", self.base_url))
            .json(&body);
        let json = self.send(request).await.map_err(|e| match e {
            // A missing project or issue type is a rejected create, not a lookup miss.
            TrackerError::NotFound(m) => TrackerError::CreateFailed(m),
            other => other,
        })?;

        let key = json
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| TrackerError::Transient("Jira create response missing key".into()))?;
        Ok(CreatedTicket {
            id: key.to_string(),
            url: Some(self.browse_url(key)),
        })
    }

    async fn get(&self, ticket_id: &str) -> Result<TicketRecord, TrackerError> {
        let request = self
            .client
            .get(format!("{}/rest/api/3/issue/{}", self.base_url, ticket_id))
            .query(&[("fields", SEARCH_FIELDS)]);
        let json = self.send(request).await.map_err(|e| match e {
            TrackerError::NotFound(_) => TrackerError::NotFound(ticket_id.to_string()),
            other => other,
        })?;
        parse_issue(&json, &self.base_url).map_err(|e| TrackerError::Transient(e.to_string()))
    }

    async fn find_user(
        &self,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<Option<String>, TrackerError> {
        let lookups = [(email, None), (name, name)];
        for (query, exact_name) in lookups {
            let Some(query) = query.map(str::trim).filter(|q| !q.is_empty()) else {
                continue;
            };
            let request = self
                .client
                .get(format!("{}/rest/api/3/user/search", self.base_url))
                .query(&[("query", query), ("maxResults", "10")]);
            let json = self.send(request).await?;
            let users = json.as_array().map(Vec::as_slice).unwrap_or_default();
            if let Some(account) = pick_account(users, exact_name) {
                return Ok(Some(account));
            }
        }
        Ok(None)
    }
}

/// Choose an active account from a user search.
///
/// An email lookup (`exact_name = None`) takes the first hit. A name
/// lookup needs an exact display-name match, or a single hit.
pub fn pick_account(users: &[Value], exact_name: Option<&str>) -> Option<String> {
    let active: Vec<&Value> = users
        .iter()
        .filter(|u| u.get("active").and_then(Value::as_bool).unwrap_or(true))
        .filter(|u| u.get("accountId").and_then(Value::as_str).is_some())
        .collect();
    let chosen = match exact_name {
        None => active.first().copied(),
        Some(name) => active
            .iter()
            .find(|u| {
                u.get("displayName")
                    .and_then(Value::as_str)
                    .is_some_and(|d| d.trim().eq_ignore_ascii_case(name.trim()))
            })
            .copied()
            .or_else(|| (active.len() == 1).then(|| active[0])),
    };
    chosen
        .and_then(|u| u.get("accountId"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Select the tracker named by `tracker.provider`.
pub fn create_tracker(config: &TrackerConfig) -> Result<Arc<dyn IssueTracker>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledTracker)),
        "jira" => Ok(Arc::new(JiraTracker::new(config)?)),
        other => Err(anyhow!("Unknown tracker provider: '{}'", other)),
    }
}

/// Extra minutes added to a relative `updated` bound for clock skew
/// between this host and Jira.
const UPDATED_SLACK_MINUTES: i64 = 2;

/// `-Nm` covering everything modified at or after `after`.
///
/// Jira reads absolute JQL dates in the searching account's timezone, so
/// the bound is sent relative to now instead. It is rounded out to whole
/// minutes; tickets returned from before `after` are skipped downstream.
fn updated_bound(after: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = (now - after).num_seconds().max(0);
    let minutes = (elapsed + 59) / 60 + UPDATED_SLACK_MINUTES;
    format!("-{}m", minutes)
}

/// JQL for one page of a project scan.
pub fn build_jql(project: &str, query: &TrackerQuery, now: DateTime<Utc>) -> String {
    let mut clauses = vec![format!("project = \"{}\"", escape_jql(project))];
    if let Some(after) = query.modified_after {
        clauses.push(format!("updated >= \"{}\"", updated_bound(after, now)));
    }
    if let Some(assignee) = &query.assignee {
        clauses.push(format!("assignee = \"{}\"", escape_jql(assignee)));
    }
    if !query.exclude_statuses.is_empty() {
        let statuses: Vec<String> = query
            .exclude_statuses
            .iter()
            .map(|s| format!("\"{}\"", escape_jql(s)))
            .collect();
        clauses.push(format!("status NOT IN ({})", statuses.join(", ")));
    }
    format!("{} ORDER BY updated ASC, key ASC", clauses.join(" AND "))
}

fn escape_jql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Map `P0..P4` to Jira priority names.
pub fn priority_name(criticality: &str) -> Option<&'static str> {
    match criticality {
        "P0" => Some("Highest"),
        "P1" => Some("High"),
        "P2" => Some("Medium"),
        "P3" => Some("Low"),
        "P4" => Some("Lowest"),
        _ => None,
    }
}

pub fn build_create_body(fields: &CreateFields) -> Value {
    let mut payload = json!({
        "project": { "key": fields.project },
        "summary": fields.title,
        "issuetype": { "name": fields.issue_type },
    });

    if !fields.description.trim().is_empty() {
        payload["description"] = text_to_adf(&fields.description);
    }
    if let Some(priority) = fields.criticality.as_deref().and_then(priority_name) {
        payload["priority"] = json!({ "name": priority });
    }
    let labels: Vec<String> = fields
        .labels
        .iter()
        // Jira labels cannot contain spaces.
        .map(|l| l.trim().replace(' ', "-"))
        .filter(|l| !l.is_empty())
        .collect();
    if !labels.is_empty() {
        payload["labels"] = json!(labels);
    }

    json!({ "fields": payload })
}

/// Plain text as an ADF document, one paragraph per blank-line-separated block.
pub fn text_to_adf(text: &str) -> Value {
    let paragraphs: Vec<Value> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            json!({
                "type": "paragraph",
                "content": [{ "type": "text", "text": p }],
            })
        })
        .collect();
    json!({ "type": "doc", "version": 1, "content": paragraphs })
}

/// Flatten an ADF document (or a plain string) to text.
pub fn adf_to_text(value: &Value) -> String {
    fn walk(node: &Value, out: &mut String) {
        if let Some(text) = node.get("text").and_then(Value::as_str) {
            out.push_str(text);
        }
        if node.get("type").and_then(Value::as_str) == Some("hardBreak") {
            out.push('\n');
        }
        if let Some(children) = node.get("content").and_then(Value::as_array) {
            for child in children {
                walk(child, out);
            }
        }
        if matches!(
            node.get("type").and_then(Value::as_str),
            Some("paragraph" | "heading" | "codeBlock" | "listItem")
        ) {
            out.push_str("\n\n");
        }
    }

    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => {
            let mut out = String::new();
            walk(other, &mut out);
            out.trim().to_string()
        }
    }
}

/// Build a [`TicketRecord`] from a Jira issue JSON object.
pub fn parse_issue(issue: &Value, base_url: &str) -> Result<TicketRecord> {
    let key = issue
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("issue missing key"))?;
    let fields = issue
        .get("fields")
        .ok_or_else(|| anyhow!("issue {key} missing fields"))?;

    let str_at = |path: &[&str]| -> Option<String> {
        let mut node = fields;
        for segment in path {
            node = node.get(*segment)?;
        }
        node.as_str().map(str::to_string)
    };

    let updated = str_at(&["updated"]).ok_or_else(|| anyhow!("issue {key} missing updated"))?;
    let last_modified = parse_jira_timestamp(&updated)?;

    let project = str_at(&["project", "key"])
        .or_else(|| key.rsplit_once('-').map(|(p, _)| p.to_string()))
        .unwrap_or_default();

    Ok(TicketRecord {
        id: key.to_string(),
        project,
        title: str_at(&["summary"]).unwrap_or_default(),
        description: fields
            .get("description")
            .map(adf_to_text)
            .unwrap_or_default(),
        issue_type: str_at(&["issuetype", "name"]).unwrap_or_default(),
        status: str_at(&["status", "name"]).unwrap_or_default(),
        assignee: str_at(&["assignee", "displayName"]),
        url: Some(format!("{}/browse/{}", base_url.trim_end_matches('/'), key)),
        last_modified,
    })
}

/// Jira timestamps look like `2024-01-15T10:30:00.000+0000`.
pub fn parse_jira_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| anyhow!("invalid Jira timestamp '{}': {}", value, e))
}

/// Jira reports errors as `{"errorMessages": [...], "errors": {field: msg}}`.
fn jira_error_message(body: &str) -> String {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return body.chars().take(300).collect();
    };
    let mut parts: Vec<String> = json
        .get("errorMessages")
        .and_then(Value::as_array)
        .map(|msgs| msgs.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    if let Some(errors) = json.get("errors").and_then(Value::as_object) {
        for (field, msg) in errors {
            parts.push(format!("{}: {}", field, msg.as_str().unwrap_or_default()));
        }
    }
    if parts.is_empty() {
        body.chars().take(300).collect()
    } else {
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_build_jql() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let query = TrackerQuery {
            modified_after: Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 5, 30).unwrap()),
            assignee: Some("ana".into()),
            exclude_statuses: vec!["Done".into()],
            ..Default::default()
        };
        assert_eq!(
            build_jql("OPS", &query, now),
            "project = \"OPS\" AND updated >= \"-57m\" AND assignee = \"ana\" \
             AND status NOT IN (\"Done\") ORDER BY updated ASC, key ASC"
        );
        assert_eq!(
            build_jql("O\"PS", &TrackerQuery::default(), now),
            "project = \"O\\\"PS\" ORDER BY updated ASC, key ASC"
        );
    }

    #[test]
    fn test_updated_bound_ignores_timezones() {
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 23, 30, 0).unwrap();
        // The same instant seen from another offset gives the same bound.
        let now_utc = Utc.with_ymd_and_hms(2024, 3, 2, 0, 30, 0).unwrap();
        let now_local = chrono::FixedOffset::west_opt(5 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, 19, 30, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(updated_bound(after, now_utc), "-62m");
        assert_eq!(updated_bound(after, now_local), "-62m");
        // Clock skew never produces a future bound.
        assert_eq!(updated_bound(now_utc, after), "-2m");
    }

    #[test]
    fn test_pick_account() {
        let users = vec![
            json!({"accountId": "a-1", "displayName": "Ana Lima", "active": false}),
            json!({"accountId": "a-2", "displayName": "Ana Lima"}),
            json!({"accountId": "a-3", "displayName": "Anabel Souza"}),
        ];
        assert_eq!(pick_account(&users, None).as_deref(), Some("a-2"));
        assert_eq!(pick_account(&users, Some("ana lima")).as_deref(), Some("a-2"));
        // Two partial matches and no exact one: ambiguous.
        assert_eq!(pick_account(&users, Some("Ana")), None);
        assert_eq!(pick_account(&users[2..], Some("Ana")).as_deref(), Some("a-3"));
        assert_eq!(pick_account(&[], None), None);
    }

    #[test]
    fn test_create_body_maps_priority_and_labels() {
        let fields = CreateFields {
            project: "OPS".into(),
            title: "Checkout blank".into(),
            description: "First para.\n\nSecond para.".into(),
            issue_type: "Bug".into(),
            criticality: Some("P1".into()),
            labels: vec!["checkout flow".into(), " ".into()],
            reporter: None,
        };
        let body = build_create_body(&fields);
        assert_eq!(body["fields"]["priority"]["name"], "High");
        assert_eq!(body["fields"]["labels"], json!(["checkout-flow"]));
        assert_eq!(body["fields"]["description"]["content"].as_array().unwrap().len(), 2);
        assert_eq!(body["fields"]["issuetype"]["name"], "Bug");
    }

    #[test]
    fn test_unknown_criticality_omits_priority() {
        let fields = CreateFields {
            project: "OPS".into(),
            title: "t".into(),
            description: String::new(),
            issue_type: "Task".into(),
            criticality: Some("urgent".into()),
            labels: vec![],
            reporter: None,
        };
        let body = build_create_body(&fields);
        assert!(body["fields"].get("priority").is_none());
        assert!(body["fields"].get("description").is_none());
    }

    #[test]
    fn test_parse_issue() {
        let issue = json!({
            "key": "OPS-42",
            "fields": {
                "summary": "Login fails",
                "description": text_to_adf("After SSO redirect.\n\nOnly on Safari."),
                "issuetype": {"name": "Bug"},
                "status": {"name": "In Progress"},
                "assignee": {"displayName": "Ana"},
                "project": {"key": "OPS"},
                "updated": "2024-01-15T10:30:00.000+0000"
            }
        });
        let record = parse_issue(&issue, "https://acme.atlassian.net/").unwrap();
        assert_eq!(record.id, "OPS-42");
        assert_eq!(record.description, "After SSO redirect.\n\nOnly on Safari.");
        assert_eq!(record.status, "In Progress");
        assert_eq!(record.url.as_deref(), Some("https://acme.atlassian.net/browse/OPS-42"));
        assert_eq!(
            record.last_modified,
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"errorMessages":["Issue type is required"],"errors":{"summary":"too long"}}"#;
        assert_eq!(
            jira_error_message(body),
            "Issue type is required; summary: too long"
        );
        assert_eq!(jira_error_message("<html>"), "<html>");
    }
}
