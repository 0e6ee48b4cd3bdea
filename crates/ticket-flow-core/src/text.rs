//! Text normalization for duplicate detection.
//!
//! Draft text and ticket text go through the same policy before they are
//! embedded, so their vectors are comparable:
//!
//! 1. Strip tracker and chat markup (mentions, `{code}` blocks, links,
//!    headings, emphasis markers). Underscores are only removed when
//!    they wrap a word, never inside identifiers.
//! 2. Lower-case.
//! 3. Collapse every whitespace run to a single space and trim.
//!
//! The SHA-256 of the normalized text is the content hash used by the
//! ingestion pipeline to skip re-embedding unchanged tickets.
//!
//! # Example
//!
//! ```rust
//! use ticket_flow_core::text::normalize_text;
//!
//! let text = "Login *FAILS*\n\n  after {code}SSO{code} redirect";
//! assert_eq!(normalize_text(text), "login fails after sso redirect");
//! ```

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

struct MarkupPatterns {
    tracker_mention: Regex,
    code_block: Regex,
    noformat_block: Regex,
    tracker_link: Regex,
    heading: Regex,
    chat_mention: Regex,
    chat_link: Regex,
    chat_url: Regex,
    ticket_key: Regex,
    underscore_emphasis: Regex,
}

fn patterns() -> &'static MarkupPatterns {
    static PATTERNS: OnceLock<MarkupPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| MarkupPatterns {
        tracker_mention: Regex::new(r"\[~(?:\w+:)?[A-Za-z0-9_\-.:]+\]").expect("static regex"),
        code_block: Regex::new(r"(?s)\{code(?::[^}]*)?\}(.*?)\{code\}").expect("static regex"),
        noformat_block: Regex::new(r"(?s)\{noformat\}(.*?)\{noformat\}").expect("static regex"),
        tracker_link: Regex::new(r"\[([^\]|]+)\|[^\]]+\]").expect("static regex"),
        heading: Regex::new(r"(?m)^\s*h[1-6]\.\s*").expect("static regex"),
        chat_mention: Regex::new(r"<[@#!][^>]*>").expect("static regex"),
        chat_link: Regex::new(r"<[^|>\s]+\|([^>]+)>").expect("static regex"),
        chat_url: Regex::new(r"<(https?://[^>]+)>").expect("static regex"),
        ticket_key: Regex::new(r"(?i)\b([A-Z][A-Z0-9]{0,9}-\d+)\b").expect("static regex"),
        // `_` is a word character, so `\b` here means the marker is not
        // inside an identifier such as `order_service`.
        underscore_emphasis: Regex::new(r"\b_+([^_\s](?:[^_\n]*?[^_\s])?)_+\b")
            .expect("static regex"),
    })
}

/// Remove tracker and chat markup, keeping the readable text.
pub fn strip_markup(text: &str) -> String {
    let p = patterns();
    let text = p.tracker_mention.replace_all(text, "");
    let text = p.code_block.replace_all(&text, "$1");
    let text = p.noformat_block.replace_all(&text, "$1");
    let text = p.tracker_link.replace_all(&text, "$1");
    let text = p.heading.replace_all(&text, "");
    let text = p.chat_link.replace_all(&text, "$1");
    let text = p.chat_url.replace_all(&text, "$1");
    let text = p.chat_mention.replace_all(&text, "");
    let text = p.underscore_emphasis.replace_all(&text, "$1");
    text.chars()
        .filter(|c| !matches!(c, '*' | '`'))
        .collect()
}

/// Apply the full normalization policy.
pub fn normalize_text(text: &str) -> String {
    strip_markup(text)
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 (hex) of already-normalized text.
pub fn content_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extract a tracker key such as `PROJ-123` from free text or a URL.
///
/// Matching is case-insensitive; the key is returned upper-cased.
pub fn extract_ticket_key(input: &str) -> Option<String> {
    patterns()
        .ticket_key
        .captures(input.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_uppercase())
}
