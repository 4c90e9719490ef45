//! Per-query pipeline: submit the search, let the page settle, scan for a
//! challenge wall, load enough results, extract and judge them. The
//! collaborators are traits so sites with bespoke search flows can swap in
//! their own submit or extraction logic.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::browser::{js_string, BrowserClient, BrowserError, BrowserResult};
use crate::challenge::ChallengeDetector;
use crate::checkpoint::RunPaths;
use crate::config::{RunConfig, SelectorSection, TimingSection};
use crate::model::{AuditRecord, JudgeScore, PageArtifacts, Query, ResultItem};
use crate::scroll::{CountVisible, ScrollController};

use super::error::AuditResult;

/// Types a query into the site's search box and submits it. Returns whether
/// the results container showed up afterwards.
#[async_trait(?Send)]
pub trait SearchSubmitter {
    async fn submit_search(&self, client: &mut dyn BrowserClient, text: &str)
        -> BrowserResult<bool>;
}

/// Pulls ranked result cards out of the page. Counting and extraction share
/// one notion of what a visible card is.
#[async_trait(?Send)]
pub trait ResultExtractor: CountVisible {
    async fn extract_results(
        &self,
        client: &mut dyn BrowserClient,
        top_k: usize,
    ) -> BrowserResult<Vec<ResultItem>>;
}

/// Scores how well the extracted results answer the query. A judge failure
/// fails that query permanently; retrying the browser would not change it.
#[async_trait(?Send)]
pub trait ResultJudge {
    async fn evaluate(
        &self,
        query: &Query,
        results: &[ResultItem],
        page_url: &str,
        html: &str,
        site: &str,
    ) -> AuditResult<JudgeScore>;
}

/// Default submitter driven by the configured search-box selectors. Falls
/// back to pressing Enter when no submit button is configured or visible.
#[derive(Debug, Clone)]
pub struct SelectorSubmitter {
    selectors: SelectorSection,
    timing: TimingSection,
}

impl SelectorSubmitter {
    pub fn new(selectors: &SelectorSection, timing: &TimingSection) -> Self {
        Self {
            selectors: selectors.clone(),
            timing: timing.clone(),
        }
    }
}

#[async_trait(?Send)]
impl SearchSubmitter for SelectorSubmitter {
    async fn submit_search(
        &self,
        client: &mut dyn BrowserClient,
        text: &str,
    ) -> BrowserResult<bool> {
        let input = self.selectors.search_input.as_str();
        let ready = client
            .wait_for_selector(input, self.timing.click_timeout(), true)
            .await?;
        if !ready {
            return Ok(false);
        }
        client.click(input).await?;
        let clear = format!(
            "(() => {{ const el = document.querySelector({}); if (el) {{ el.value = ''; \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); }} }})()",
            js_string(input)
        );
        client.evaluate(&clear).await?;
        client.type_text(input, text).await?;

        let mut clicked = false;
        if let Some(button) = &self.selectors.search_button {
            let probe = client.query_selector(button).await?;
            if probe.map_or(false, |probe| probe.visible) {
                client.click(button).await?;
                clicked = true;
            }
        }
        if !clicked {
            client.press_key(input, "Enter").await?;
        }

        client
            .wait_for_selector(
                &self.selectors.results_container,
                self.timing.navigation_timeout(),
                false,
            )
            .await
    }
}

/// Default extractor: one injected script walks the configured card selector
/// and picks out title, link, snippet, price and image per card.
#[derive(Debug, Clone)]
pub struct DomExtractor {
    selectors: SelectorSection,
}

impl DomExtractor {
    pub fn new(selectors: &SelectorSection) -> Self {
        Self {
            selectors: selectors.clone(),
        }
    }
}

#[async_trait(?Send)]
impl CountVisible for DomExtractor {
    async fn count_visible(&self, client: &mut dyn BrowserClient) -> BrowserResult<usize> {
        let script = format!(
            "(() => Array.from(document.querySelectorAll({card}))\
             .filter((node) => node.getClientRects().length > 0).length)()",
            card = js_string(&self.selectors.result_card)
        );
        let value = client.evaluate(&script).await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }
}

#[async_trait(?Send)]
impl ResultExtractor for DomExtractor {
    async fn extract_results(
        &self,
        client: &mut dyn BrowserClient,
        top_k: usize,
    ) -> BrowserResult<Vec<ResultItem>> {
        let config = serde_json::json!({
            "card": self.selectors.result_card,
            "title": self.selectors.title,
            "snippet": self.selectors.snippet,
            "price": self.selectors.price,
            "link": self.selectors.link,
            "image": self.selectors.image,
            "limit": top_k,
        });
        let script = format!(
            r#"((config) => {{
    const visible = Array.from(document.querySelectorAll(config.card))
        .filter((node) => node.getClientRects().length > 0)
        .slice(0, config.limit);
    const text = (root, selector) => {{
        if (!selector) return null;
        const el = root.querySelector(selector);
        if (!el) return null;
        const value = (el.innerText || '').trim();
        return value || null;
    }};
    const attr = (root, selector, name) => {{
        if (!selector) return null;
        const el = root.querySelector(selector);
        if (!el) return null;
        return el.getAttribute(name);
    }};
    const link = (root, selector) => {{
        const href = attr(root, selector, 'href');
        if (!href) return null;
        try {{ return new URL(href, document.baseURI).toString(); }} catch (_) {{ return href; }}
    }};
    return visible.map((card) => ({{
        title: text(card, config.title),
        url: link(card, config.link),
        snippet: text(card, config.snippet),
        price: text(card, config.price),
        image: attr(card, config.image, 'src'),
    }}));
}})({config})"#
        );
        let value = client.evaluate(&script).await?;
        cards_from_value(value)
    }
}

#[derive(Debug, Deserialize)]
struct RawCard {
    title: Option<String>,
    url: Option<String>,
    snippet: Option<String>,
    price: Option<String>,
    image: Option<String>,
}

fn cards_from_value(value: Value) -> BrowserResult<Vec<ResultItem>> {
    let raw: Vec<RawCard> = serde_json::from_value(value)
        .map_err(|err| BrowserError::Evaluate(format!("result cards: {err}")))?;
    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(index, card)| {
            let mut item = ResultItem::new(index + 1, normalize(card.title));
            item.url = normalize(card.url);
            item.snippet = normalize(card.snippet);
            item.price = normalize(card.price);
            item.image = normalize(card.image);
            item
        })
        .collect())
}

fn normalize(field: Option<String>) -> Option<String> {
    field
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Fallback judge scoring lexical overlap between query terms and each
/// result's title and snippet. Stands in until an external judge is wired up.
#[derive(Debug, Default)]
pub struct TermOverlapJudge;

#[async_trait(?Send)]
impl ResultJudge for TermOverlapJudge {
    async fn evaluate(
        &self,
        query: &Query,
        results: &[ResultItem],
        _page_url: &str,
        _html: &str,
        _site: &str,
    ) -> AuditResult<JudgeScore> {
        let terms: Vec<String> = query
            .text
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if terms.is_empty() || results.is_empty() {
            return Ok(JudgeScore {
                score: 0.0,
                rationale: Some("no results to score".to_string()),
                model: None,
            });
        }
        let mut total = 0.0;
        for item in results {
            let haystack = format!(
                "{} {}",
                item.title.as_deref().unwrap_or(""),
                item.snippet.as_deref().unwrap_or("")
            )
            .to_lowercase();
            let matched = terms
                .iter()
                .filter(|term| haystack.contains(term.as_str()))
                .count();
            total += matched as f64 / terms.len() as f64;
        }
        Ok(JudgeScore {
            score: total / results.len() as f64,
            rationale: Some(format!("mean term overlap across {} results", results.len())),
            model: None,
        })
    }
}

/// Everything needed to audit one query on an already-open site page.
pub struct QueryPipeline {
    submitter: Box<dyn SearchSubmitter>,
    extractor: Box<dyn ResultExtractor>,
    judge: Box<dyn ResultJudge>,
    challenge: ChallengeDetector,
    scroll: ScrollController,
    network_idle: Duration,
    top_k: usize,
}

impl QueryPipeline {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            submitter: Box::new(SelectorSubmitter::new(&config.selectors, &config.timing)),
            extractor: Box::new(DomExtractor::new(&config.selectors)),
            judge: Box::new(TermOverlapJudge),
            challenge: ChallengeDetector::new(&config.challenge),
            scroll: ScrollController::new(&config.scroll),
            network_idle: config.timing.network_idle(),
            top_k: config.audit.top_k,
        }
    }

    pub fn with_submitter(mut self, submitter: Box<dyn SearchSubmitter>) -> Self {
        self.submitter = submitter;
        self
    }

    pub fn with_extractor(mut self, extractor: Box<dyn ResultExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_judge(mut self, judge: Box<dyn ResultJudge>) -> Self {
        self.judge = judge;
        self
    }

    /// Runs the full pipeline for one query. The client is expected to sit
    /// on the site already; faults bubble out for the orchestrator to
    /// classify and retry.
    pub async fn run_query(
        &self,
        client: &mut dyn BrowserClient,
        site: &str,
        query: &Query,
        paths: &RunPaths,
    ) -> AuditResult<AuditRecord> {
        let submitted = self.submitter.submit_search(client, &query.text).await?;
        if !submitted {
            return Err(BrowserError::Navigation(format!(
                "results container never appeared for '{}'",
                query.text
            ))
            .into());
        }
        if let Err(err) = client.wait_for_network_idle(self.network_idle).await {
            debug!(error = %err, "Page kept loading past the idle window, continuing");
        }

        let snapshot = self.challenge.snapshot(client).await?;
        let verdict = self.challenge.scan(&snapshot);
        if verdict.detected {
            let kind = verdict.kind.map_or("challenge", |kind| kind.as_str());
            let message = verdict
                .message
                .unwrap_or_else(|| "challenge page detected".to_string());
            return Err(BrowserError::Challenge(format!("{kind}: {message}")).into());
        }

        let counter: &dyn CountVisible = self.extractor.as_ref();
        let outcome = self.scroll.ensure_results(client, counter, self.top_k).await?;
        if !outcome.satisfied {
            warn!(
                query = %query.id,
                loaded = outcome.loaded,
                wanted = self.top_k,
                "Page stopped growing before the requested result count"
            );
        }
        let items = self.extractor.extract_results(client, self.top_k).await?;

        let mut page = PageArtifacts::new(site);
        match client.page_url().await {
            Ok(url) => page.final_url = url,
            Err(err) => debug!(error = %err, "Could not read final URL"),
        }

        let shot_path = paths.screenshots_dir.join(format!("{}.png", query.id));
        match client.screenshot(&shot_path, true).await {
            Ok(path) => page.screenshot_path = Some(path),
            Err(err) => warn!(query = %query.id, error = %err, "Screenshot capture failed"),
        }

        let mut html = String::new();
        match client.html().await {
            Ok(body) => {
                let html_file = paths.html_dir.join(format!("{}.html", query.id));
                match tokio::fs::write(&html_file, &body).await {
                    Ok(()) => page.html_path = Some(html_file),
                    Err(err) => {
                        warn!(query = %query.id, error = %err, "HTML snapshot write failed");
                    }
                }
                html = body;
            }
            Err(err) => warn!(query = %query.id, error = %err, "HTML capture failed"),
        }

        let judge = self
            .judge
            .evaluate(query, &items, &page.final_url, &html, site)
            .await?;

        Ok(AuditRecord {
            site: site.to_string(),
            query: query.clone(),
            items,
            page,
            judge,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cards_gain_ranks_and_lose_blank_fields() {
        let value = json!([
            { "title": "  Sony WH-1000XM5  ", "url": "https://shop.example.com/p/1",
              "snippet": "", "price": "$348", "image": null },
            { "title": null, "url": null, "snippet": "budget pick", "price": null,
              "image": "https://img.example.com/2.jpg" },
        ]);
        let items = cards_from_value(value).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].rank, 1);
        assert_eq!(items[0].title.as_deref(), Some("Sony WH-1000XM5"));
        assert_eq!(items[0].snippet, None);
        assert_eq!(items[1].rank, 2);
        assert_eq!(items[1].title, None);
        assert_eq!(items[1].image.as_deref(), Some("https://img.example.com/2.jpg"));
    }

    #[test]
    fn non_array_payload_is_an_evaluate_fault() {
        let err = cards_from_value(json!({"oops": true})).unwrap_err();
        assert!(err.to_string().contains("result cards"));
    }

    #[tokio::test]
    async fn overlap_judge_scores_matching_titles_higher() {
        let judge = TermOverlapJudge;
        let query = Query::predefined("q1", "wireless headphones");
        let strong = vec![
            ResultItem::new(1, Some("Wireless Headphones Pro".to_string())),
            ResultItem::new(2, Some("Sony wireless headphones".to_string())),
        ];
        let weak = vec![ResultItem::new(1, Some("Garden hose reel".to_string()))];

        let high = judge
            .evaluate(&query, &strong, "", "", "")
            .await
            .unwrap();
        let low = judge.evaluate(&query, &weak, "", "", "").await.unwrap();
        assert!(high.score > low.score);
        assert!((high.score - 1.0).abs() < f64::EPSILON);
        assert_eq!(low.score, 0.0);
    }

    #[tokio::test]
    async fn overlap_judge_handles_empty_results() {
        let judge = TermOverlapJudge;
        let query = Query::predefined("q1", "usb-c hub");
        let score = judge.evaluate(&query, &[], "", "", "").await.unwrap();
        assert_eq!(score.score, 0.0);
        assert!(score.rationale.unwrap().contains("no results"));
    }
}
