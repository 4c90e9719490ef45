//! Detects anti-bot interstitials (CAPTCHA walls, vendor challenge pages,
//! access-denied shells) before extraction runs against a page that holds
//! no results. Heuristics are ordered and the first hit wins.

use serde::Deserialize;

use crate::browser::{BrowserClient, BrowserError, BrowserResult};
use crate::config::ChallengeSection;

/// Pages shorter than this are candidates for the blocked-text heuristic.
/// Real result pages carry far more text than a block shell.
const SHORT_BODY_LIMIT: usize = 500;

/// How much body text the snapshot carries back for keyword scanning.
const BODY_SAMPLE_CHARS: usize = 4000;

const DEFAULT_TITLE_PHRASES: &[&str] = &[
    "just a moment",
    "attention required",
    "access denied",
    "are you a robot",
    "verify you are human",
    "security check",
    "one more step",
    "pardon our interruption",
];

const DEFAULT_VENDOR_SELECTORS: &[&str] = &[
    "#challenge-form",
    "#challenge-running",
    ".cf-browser-verification",
    "#px-captcha",
    "#distil_ident_block",
    "#sec-cpt-if",
];

const DEFAULT_IFRAME_MARKERS: &[&str] = &[
    "recaptcha",
    "hcaptcha",
    "turnstile",
    "captcha",
    "challenge",
    "perimeterx",
];

const DEFAULT_BLOCK_KEYWORDS: &[&str] = &[
    "access denied",
    "captcha",
    "unusual traffic",
    "automated requests",
    "checking your browser",
    "verify you are human",
    "rate limited",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    TitlePhrase,
    VendorSelector,
    CaptchaIframe,
    BlockedText,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::TitlePhrase => "title_phrase",
            ChallengeKind::VendorSelector => "vendor_selector",
            ChallengeKind::CaptchaIframe => "captcha_iframe",
            ChallengeKind::BlockedText => "blocked_text",
        }
    }
}

impl std::fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeVerdict {
    pub detected: bool,
    pub kind: Option<ChallengeKind>,
    pub message: Option<String>,
}

impl ChallengeVerdict {
    fn clear() -> Self {
        Self {
            detected: false,
            kind: None,
            message: None,
        }
    }

    fn flagged(kind: ChallengeKind, message: String) -> Self {
        Self {
            detected: true,
            kind: Some(kind),
            message: Some(message),
        }
    }
}

/// Everything the heuristics look at, lifted off the page in one evaluate
/// round trip. Scanning a snapshot is pure and never touches the browser.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PageSnapshot {
    pub title: String,
    pub body_text: String,
    pub body_length: usize,
    pub iframe_srcs: Vec<String>,
    pub vendor_hit: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChallengeDetector {
    title_phrases: Vec<String>,
    vendor_selectors: Vec<String>,
    iframe_markers: Vec<String>,
    block_keywords: Vec<String>,
}

impl ChallengeDetector {
    pub fn new(section: &ChallengeSection) -> Self {
        Self {
            title_phrases: configured_or(&section.title_phrases, DEFAULT_TITLE_PHRASES),
            vendor_selectors: configured_or(&section.vendor_selectors, DEFAULT_VENDOR_SELECTORS),
            iframe_markers: configured_or(&section.iframe_markers, DEFAULT_IFRAME_MARKERS),
            block_keywords: configured_or(&section.block_keywords, DEFAULT_BLOCK_KEYWORDS),
        }
    }

    pub async fn snapshot(&self, client: &mut dyn BrowserClient) -> BrowserResult<PageSnapshot> {
        let selectors = serde_json::to_string(&self.vendor_selectors)
            .map_err(|err| BrowserError::Unexpected(err.to_string()))?;
        let script = format!(
            r#"((selectors) => {{
    const title = document.title || '';
    const body = document.body ? (document.body.innerText || '') : '';
    const iframes = Array.from(document.querySelectorAll('iframe'))
        .map((frame) => frame.getAttribute('src') || '');
    let vendorHit = null;
    for (const sel of selectors) {{
        try {{
            if (document.querySelector(sel)) {{ vendorHit = sel; break; }}
        }} catch (_) {{}}
    }}
    return {{
        title,
        body_text: body.slice(0, {BODY_SAMPLE_CHARS}),
        body_length: body.length,
        iframe_srcs: iframes,
        vendor_hit: vendorHit,
    }};
}})({selectors})"#
        );
        let value = client.evaluate(&script).await?;
        serde_json::from_value(value)
            .map_err(|err| BrowserError::Evaluate(format!("challenge snapshot: {err}")))
    }

    pub fn scan(&self, snapshot: &PageSnapshot) -> ChallengeVerdict {
        let title = snapshot.title.to_lowercase();
        if let Some(phrase) = self
            .title_phrases
            .iter()
            .find(|phrase| title.contains(phrase.as_str()))
        {
            return ChallengeVerdict::flagged(
                ChallengeKind::TitlePhrase,
                format!("title matched '{phrase}'"),
            );
        }

        if let Some(selector) = &snapshot.vendor_hit {
            return ChallengeVerdict::flagged(
                ChallengeKind::VendorSelector,
                format!("vendor selector '{selector}' present"),
            );
        }

        for src in &snapshot.iframe_srcs {
            let src_lower = src.to_lowercase();
            if let Some(marker) = self
                .iframe_markers
                .iter()
                .find(|marker| src_lower.contains(marker.as_str()))
            {
                return ChallengeVerdict::flagged(
                    ChallengeKind::CaptchaIframe,
                    format!("iframe src contains '{marker}'"),
                );
            }
        }

        if snapshot.body_length < SHORT_BODY_LIMIT {
            let body = snapshot.body_text.to_lowercase();
            if let Some(keyword) = self
                .block_keywords
                .iter()
                .find(|keyword| body.contains(keyword.as_str()))
            {
                return ChallengeVerdict::flagged(
                    ChallengeKind::BlockedText,
                    format!("short page body mentions '{keyword}'"),
                );
            }
        }

        ChallengeVerdict::clear()
    }
}

fn configured_or(configured: &[String], defaults: &[&str]) -> Vec<String> {
    if configured.is_empty() {
        defaults.iter().map(|entry| entry.to_lowercase()).collect()
    } else {
        configured.iter().map(|entry| entry.to_lowercase()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ChallengeDetector {
        ChallengeDetector::new(&ChallengeSection {
            title_phrases: vec![],
            vendor_selectors: vec![],
            iframe_markers: vec![],
            block_keywords: vec![],
        })
    }

    fn snapshot() -> PageSnapshot {
        PageSnapshot {
            title: "Results for wireless headphones".into(),
            body_text: "Sony WH-1000XM5 ... 48 results".into(),
            body_length: 5400,
            iframe_srcs: vec![],
            vendor_hit: None,
        }
    }

    #[test]
    fn empty_section_falls_back_to_defaults() {
        let detector = detector();
        assert!(detector.title_phrases.contains(&"just a moment".to_string()));
        assert!(detector.vendor_selectors.len() >= 3);
    }

    #[test]
    fn title_phrase_flags_regardless_of_case() {
        let mut page = snapshot();
        page.title = "Just a Moment...".into();
        let verdict = detector().scan(&page);
        assert!(verdict.detected);
        assert_eq!(verdict.kind, Some(ChallengeKind::TitlePhrase));
    }

    #[test]
    fn vendor_selector_hit_flags() {
        let mut page = snapshot();
        page.vendor_hit = Some("#px-captcha".into());
        let verdict = detector().scan(&page);
        assert_eq!(verdict.kind, Some(ChallengeKind::VendorSelector));
    }

    #[test]
    fn captcha_iframe_flags() {
        let mut page = snapshot();
        page.iframe_srcs = vec![
            "https://cdn.example.com/widget".into(),
            "https://www.google.com/recaptcha/api2/anchor".into(),
        ];
        let verdict = detector().scan(&page);
        assert_eq!(verdict.kind, Some(ChallengeKind::CaptchaIframe));
        assert!(verdict.message.unwrap().contains("recaptcha"));
    }

    #[test]
    fn short_blocked_body_flags() {
        let mut page = snapshot();
        page.body_text = "Access denied. Unusual traffic from your network.".into();
        page.body_length = page.body_text.len();
        let verdict = detector().scan(&page);
        assert_eq!(verdict.kind, Some(ChallengeKind::BlockedText));
    }

    #[test]
    fn long_body_mentioning_captcha_is_clean() {
        // A review that merely talks about captchas must not trip the scan.
        let mut page = snapshot();
        page.body_text = "great product, no captcha nonsense at checkout".into();
        page.body_length = 5000;
        let verdict = detector().scan(&page);
        assert!(!verdict.detected);
    }

    #[test]
    fn title_heuristic_wins_over_later_ones() {
        let mut page = snapshot();
        page.title = "Attention Required! | Cloudflare".into();
        page.iframe_srcs = vec!["https://challenges.cloudflare.com/turnstile".into()];
        let verdict = detector().scan(&page);
        assert_eq!(verdict.kind, Some(ChallengeKind::TitlePhrase));
    }

    #[test]
    fn clean_page_yields_clear_verdict() {
        let verdict = detector().scan(&snapshot());
        assert_eq!(verdict, ChallengeVerdict::clear());
    }
}
