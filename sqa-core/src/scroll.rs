//! Drives lazy-loaded result pages until enough result cards exist. The
//! controller prefers an explicit load-more control when one is present and
//! falls back to viewport scrolling, measuring between actions so a page
//! that stops growing ends the loop early.

use async_trait::async_trait;
use tracing::debug;

use crate::browser::{BrowserClient, BrowserResult};
use crate::config::ScrollSection;

/// Small scroll issued before the main loop so sites that only hydrate on
/// scroll events start loading at all.
const NUDGE_PX: u32 = 300;

/// Attribute the phrase scan plants on a matched load-more control so the
/// follow-up click has a stable selector to aim at.
const LOAD_MORE_TAG: &str = "data-sqa-load-more";

/// Counts result cards currently in the DOM. The extractor implements this
/// so the scroll loop and the final extraction agree on what a card is.
#[async_trait(?Send)]
pub trait CountVisible {
    async fn count_visible(&self, client: &mut dyn BrowserClient) -> BrowserResult<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollOutcome {
    /// Result cards present when the loop ended.
    pub loaded: usize,
    /// Scroll and click actions issued, including the initial nudge.
    pub actions: u32,
    pub load_more_clicks: u32,
    /// Whether the page reached the requested card count.
    pub satisfied: bool,
}

#[derive(Debug, Clone)]
pub struct ScrollController {
    section: ScrollSection,
}

impl ScrollController {
    pub fn new(section: &ScrollSection) -> Self {
        Self {
            section: section.clone(),
        }
    }

    /// Loads result cards until `top_k` are present, the page stops growing,
    /// or the attempt budget runs out. Leaves the viewport at the top of the
    /// page whenever any action was issued.
    pub async fn ensure_results(
        &self,
        client: &mut dyn BrowserClient,
        counter: &dyn CountVisible,
        top_k: usize,
    ) -> BrowserResult<ScrollOutcome> {
        let mut count = counter.count_visible(client).await?;
        if count >= top_k {
            return Ok(ScrollOutcome {
                loaded: count,
                actions: 0,
                load_more_clicks: 0,
                satisfied: true,
            });
        }

        let mut actions = 0u32;
        let mut load_more_clicks = 0u32;
        client
            .evaluate(&format!("window.scrollBy(0, {NUDGE_PX})"))
            .await?;
        actions += 1;

        let mut satisfied = false;
        for _ in 0..self.section.max_attempts {
            if self.try_load_more(client).await? {
                load_more_clicks += 1;
            } else {
                client
                    .evaluate(&format!("window.scrollBy(0, {})", self.section.step_px))
                    .await?;
            }
            actions += 1;
            tokio::time::sleep(self.section.pause()).await;

            let next = counter.count_visible(client).await?;
            if next >= top_k {
                count = next;
                satisfied = true;
                break;
            }
            if next <= count {
                debug!(loaded = next, "Result count stopped growing");
                count = next;
                break;
            }
            count = next;
        }

        if actions > 0 {
            client.evaluate("window.scrollTo(0, 0)").await?;
        }
        Ok(ScrollOutcome {
            loaded: count,
            actions,
            load_more_clicks,
            satisfied,
        })
    }

    /// Clicks a load-more control if one can be found, first by configured
    /// selector, then by button text. Returns whether a click landed. A
    /// click that fails mid-flight is logged and treated as not clicked so
    /// the caller falls back to scrolling.
    async fn try_load_more(&self, client: &mut dyn BrowserClient) -> BrowserResult<bool> {
        for selector in &self.section.load_more_selectors {
            let probe = client.query_selector(selector).await?;
            if probe.map_or(false, |probe| probe.visible) {
                match client.click(selector).await {
                    Ok(()) => return Ok(true),
                    Err(err) => {
                        debug!(
                            selector = %selector,
                            error = %err,
                            "Load-more click failed, falling back to scroll"
                        );
                        return Ok(false);
                    }
                }
            }
        }

        if self.section.load_more_phrases.is_empty() {
            return Ok(false);
        }
        let phrases = serde_json::to_string(
            &self
                .section
                .load_more_phrases
                .iter()
                .map(|phrase| phrase.to_lowercase())
                .collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".to_string());
        let script = format!(
            r#"((phrases) => {{
    document.querySelectorAll('[{LOAD_MORE_TAG}]')
        .forEach((node) => node.removeAttribute('{LOAD_MORE_TAG}'));
    const nodes = Array.from(document.querySelectorAll('button, a, [role="button"]'));
    for (const node of nodes) {{
        const text = (node.innerText || '').trim().toLowerCase();
        if (!text) continue;
        if (phrases.some((phrase) => text.includes(phrase))) {{
            node.setAttribute('{LOAD_MORE_TAG}', '1');
            return true;
        }}
    }}
    return false;
}})({phrases})"#
        );
        let tagged = client
            .evaluate(&script)
            .await?
            .as_bool()
            .unwrap_or(false);
        if !tagged {
            return Ok(false);
        }
        match client.click(&format!("[{LOAD_MORE_TAG}]")).await {
            Ok(()) => Ok(true),
            Err(err) => {
                debug!(error = %err, "Tagged load-more click failed, falling back to scroll");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BackendKind, WaitCondition};
    use serde_json::{json, Value};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};

    struct ScriptedCounter {
        counts: RefCell<VecDeque<usize>>,
        last: RefCell<usize>,
    }

    impl ScriptedCounter {
        fn new(counts: &[usize]) -> Self {
            Self {
                counts: RefCell::new(counts.iter().copied().collect()),
                last: RefCell::new(0),
            }
        }

        fn measurements_left(&self) -> usize {
            self.counts.borrow().len()
        }
    }

    #[async_trait(?Send)]
    impl CountVisible for ScriptedCounter {
        async fn count_visible(&self, _client: &mut dyn BrowserClient) -> BrowserResult<usize> {
            if let Some(next) = self.counts.borrow_mut().pop_front() {
                *self.last.borrow_mut() = next;
            }
            Ok(*self.last.borrow())
        }
    }

    #[derive(Default)]
    struct FeedPage {
        scripts: RefCell<Vec<String>>,
        clicks: RefCell<Vec<String>>,
        visible_selector: Option<String>,
        phrase_hit: bool,
    }

    #[async_trait(?Send)]
    impl BrowserClient for FeedPage {
        fn backend(&self) -> BackendKind {
            BackendKind::Chromium
        }

        fn set_proxy(&mut self, _proxy: Option<String>) {}

        async fn connect(&mut self) -> BrowserResult<()> {
            Ok(())
        }

        async fn disconnect(&mut self) -> BrowserResult<()> {
            Ok(())
        }

        async fn recover_page(&mut self) -> BrowserResult<()> {
            Ok(())
        }

        async fn reconnect(&mut self) -> BrowserResult<()> {
            Ok(())
        }

        async fn is_page_alive(&mut self) -> bool {
            true
        }

        async fn is_browser_alive(&mut self) -> bool {
            true
        }

        async fn navigate(&mut self, url: &str, _wait: WaitCondition) -> BrowserResult<String> {
            Ok(url.to_string())
        }

        async fn evaluate(&mut self, script: &str) -> BrowserResult<Value> {
            self.scripts.borrow_mut().push(script.to_string());
            if script.contains("getComputedStyle") {
                let hit = self
                    .visible_selector
                    .as_ref()
                    .map_or(false, |selector| script.contains(selector.as_str()));
                if hit {
                    return Ok(json!({ "tag": "button", "visible": true }));
                }
                return Ok(Value::Null);
            }
            if script.contains(LOAD_MORE_TAG) {
                return Ok(Value::Bool(self.phrase_hit));
            }
            Ok(Value::Null)
        }

        async fn click(&mut self, selector: &str) -> BrowserResult<()> {
            self.clicks.borrow_mut().push(selector.to_string());
            Ok(())
        }

        async fn type_text(&mut self, _selector: &str, _text: &str) -> BrowserResult<()> {
            Ok(())
        }

        async fn press_key(&mut self, _selector: &str, _key: &str) -> BrowserResult<()> {
            Ok(())
        }

        async fn screenshot(&mut self, path: &Path, _full_page: bool) -> BrowserResult<PathBuf> {
            Ok(path.to_path_buf())
        }

        async fn html(&mut self) -> BrowserResult<String> {
            Ok(String::new())
        }
    }

    fn section(max_attempts: u32) -> ScrollSection {
        ScrollSection {
            max_attempts,
            step_px: 800,
            pause_ms: 0,
            load_more_selectors: vec![],
            load_more_phrases: vec![],
        }
    }

    #[tokio::test]
    async fn enough_results_skip_scrolling() {
        let mut page = FeedPage::default();
        let counter = ScriptedCounter::new(&[12]);
        let controller = ScrollController::new(&section(5));
        let outcome = controller
            .ensure_results(&mut page, &counter, 10)
            .await
            .unwrap();
        assert!(outcome.satisfied);
        assert_eq!(outcome.loaded, 12);
        assert_eq!(outcome.actions, 0);
        assert!(page.scripts.borrow().is_empty());
    }

    #[tokio::test]
    async fn scrolls_until_top_k_then_returns_to_top() {
        let mut page = FeedPage::default();
        let counter = ScriptedCounter::new(&[3, 6, 10]);
        let controller = ScrollController::new(&section(5));
        let outcome = controller
            .ensure_results(&mut page, &counter, 10)
            .await
            .unwrap();
        assert!(outcome.satisfied);
        assert_eq!(outcome.loaded, 10);
        assert_eq!(outcome.actions, 3);
        let scripts = page.scripts.borrow();
        assert!(scripts.iter().any(|script| script.contains("scrollTo(0, 0)")));
        assert!(scripts.iter().any(|script| script.contains("scrollBy(0, 800)")));
    }

    #[tokio::test]
    async fn plateau_ends_the_loop_early() {
        let mut page = FeedPage::default();
        let counter = ScriptedCounter::new(&[3, 5, 5]);
        let controller = ScrollController::new(&section(6));
        let outcome = controller
            .ensure_results(&mut page, &counter, 10)
            .await
            .unwrap();
        assert!(!outcome.satisfied);
        assert_eq!(outcome.loaded, 5);
        assert_eq!(outcome.actions, 3);
        assert_eq!(counter.measurements_left(), 0);
    }

    #[tokio::test]
    async fn attempt_budget_bounds_measurements() {
        let mut page = FeedPage::default();
        let counter = ScriptedCounter::new(&[1, 2, 3, 4, 5, 6]);
        let controller = ScrollController::new(&section(3));
        let outcome = controller
            .ensure_results(&mut page, &counter, 99)
            .await
            .unwrap();
        assert!(!outcome.satisfied);
        assert_eq!(outcome.loaded, 4);
        assert_eq!(counter.measurements_left(), 2);
    }

    #[tokio::test]
    async fn visible_load_more_control_is_clicked() {
        let mut page = FeedPage {
            visible_selector: Some(".load-more".to_string()),
            ..FeedPage::default()
        };
        let counter = ScriptedCounter::new(&[3, 10]);
        let mut section = section(5);
        section.load_more_selectors = vec![".load-more".to_string()];
        let controller = ScrollController::new(&section);
        let outcome = controller
            .ensure_results(&mut page, &counter, 10)
            .await
            .unwrap();
        assert!(outcome.satisfied);
        assert_eq!(outcome.load_more_clicks, 1);
        assert_eq!(page.clicks.borrow().as_slice(), [".load-more"]);
        let scripts = page.scripts.borrow();
        assert!(!scripts.iter().any(|script| script.contains("scrollBy(0, 800)")));
    }

    #[tokio::test]
    async fn phrase_scan_tags_and_clicks_fallback_control() {
        let mut page = FeedPage {
            phrase_hit: true,
            ..FeedPage::default()
        };
        let counter = ScriptedCounter::new(&[3, 10]);
        let mut section = section(5);
        section.load_more_phrases = vec!["show more".to_string()];
        let controller = ScrollController::new(&section);
        let outcome = controller
            .ensure_results(&mut page, &counter, 10)
            .await
            .unwrap();
        assert!(outcome.satisfied);
        assert_eq!(outcome.load_more_clicks, 1);
        assert_eq!(
            page.clicks.borrow().as_slice(),
            [format!("[{LOAD_MORE_TAG}]")]
        );
    }
}
