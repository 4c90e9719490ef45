//! Maps raw backend failures onto the closed set of error kinds the
//! orchestrator plans recovery with. Classification is message-based so the
//! same fault reported by CDP and by WebDriver lands on the same kind.

use regex::Regex;
use serde::Serialize;

use super::error::BrowserError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    PageClosed,
    BrowserDead,
    NotConnected,
    Transient,
    Permanent,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::PageClosed => "page_closed",
            ErrorKind::BrowserDead => "browser_dead",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds worth another attempt. Timeouts are retryable by classification;
/// whether a timed-out query is actually retried is the orchestrator's call.
pub fn is_retryable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Timeout | ErrorKind::PageClosed | ErrorKind::BrowserDead | ErrorKind::Transient
    )
}

pub fn classify(error: &BrowserError) -> ErrorKind {
    match error {
        BrowserError::Timeout(_) => ErrorKind::Timeout,
        BrowserError::NotConnected => ErrorKind::NotConnected,
        BrowserError::Challenge(_) => ErrorKind::Transient,
        BrowserError::CloudSession(_) => ErrorKind::Transient,
        BrowserError::Navigation(message) => classify_text(message).unwrap_or(ErrorKind::Transient),
        BrowserError::Cdp(err) => classify_text(&err.to_string()).unwrap_or(ErrorKind::Permanent),
        BrowserError::WebDriver(err) => {
            classify_text(&err.to_string()).unwrap_or(ErrorKind::Permanent)
        }
        BrowserError::Evaluate(message) => classify_text(message).unwrap_or(ErrorKind::Permanent),
        BrowserError::Unexpected(message) => classify_text(message).unwrap_or(ErrorKind::Permanent),
        BrowserError::Launch(_)
        | BrowserError::StealthUnavailable(_)
        | BrowserError::Configuration(_)
        | BrowserError::Io(_) => ErrorKind::Permanent,
    }
}

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out"];

const BROWSER_DEAD_PATTERNS: &[&str] = &[
    r"browser (has been )?closed",
    r"browser process",
    r"browser context .*(closed|destroyed)",
    r"target .*(closed|crashed|detached)",
    r"chrome not reachable",
    r"channel (closed|send)",
    r"websocket .*closed",
];

const PAGE_CLOSED_PATTERNS: &[&str] = &[
    r"page (has been )?closed",
    r"page crashed",
    r"session (deleted|invalid)",
    r"invalid session",
    r"no such window",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    r"net::err",
    r"connection (reset|refused|aborted|closed)",
    r"dns",
    r"name not resolved",
    r"navigation failed",
    r"frame .*detached",
    r"execution context was destroyed",
    r"cannot find context",
    r"socket hang up",
    r"service unavailable",
    r"too many requests",
];

fn classify_text(message: &str) -> Option<ErrorKind> {
    let text = message.to_lowercase();
    if matches_any(&text, TIMEOUT_PATTERNS) {
        Some(ErrorKind::Timeout)
    } else if matches_any(&text, BROWSER_DEAD_PATTERNS) {
        Some(ErrorKind::BrowserDead)
    } else if matches_any(&text, PAGE_CLOSED_PATTERNS) {
        Some(ErrorKind::PageClosed)
    } else if matches_any(&text, TRANSIENT_PATTERNS) {
        Some(ErrorKind::Transient)
    } else {
        None
    }
}

fn matches_any(text: &str, patterns: &[&str]) -> bool {
    patterns
        .iter()
        .any(|pattern| Regex::new(pattern).map_or(false, |re| re.is_match(text)))
}
