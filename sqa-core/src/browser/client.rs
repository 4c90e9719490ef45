use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{sleep, Instant};

use super::chromium::ChromiumClient;
use super::error::{BrowserError, BrowserResult};
use super::remote::RemoteClient;
use super::stealth::StealthClient;
use crate::config::RunConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Chromium,
    Remote,
    Stealth,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendKind::Chromium => "chromium",
            BackendKind::Remote => "remote",
            BackendKind::Stealth => "stealth",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for BackendKind {
    type Err = BrowserError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "chromium" => Ok(BackendKind::Chromium),
            "remote" | "cdp" => Ok(BackendKind::Remote),
            "stealth" => Ok(BackendKind::Stealth),
            other => Err(BrowserError::Configuration(format!(
                "invalid backend kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    None,
    Load,
    NetworkIdle,
}

/// What `query_selector` reports back. Plain data, never a live DOM handle,
/// so the same probe works over CDP and WebDriver alike.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ElementProbe {
    pub tag: String,
    pub visible: bool,
}

/// One attached browser page, whichever backend drives it. Methods take
/// `&mut self`: a client is single-flight and two operations never race on
/// the same page.
///
/// The provided methods are implemented on top of `evaluate` so every
/// backend answers selector probes and readiness polls identically.
#[async_trait(?Send)]
pub trait BrowserClient {
    fn backend(&self) -> BackendKind;

    /// Takes effect at the next connect or reconnect.
    fn set_proxy(&mut self, proxy: Option<String>);

    async fn connect(&mut self) -> BrowserResult<()>;

    /// Idempotent; only tears down what this client created itself.
    async fn disconnect(&mut self) -> BrowserResult<()>;

    /// Replace a dead page while keeping the browser. Cheaper than a full
    /// reconnect and the first resort when only the page is gone.
    async fn recover_page(&mut self) -> BrowserResult<()>;

    /// Full teardown and fresh connect.
    async fn reconnect(&mut self) -> BrowserResult<()>;

    async fn is_page_alive(&mut self) -> bool;

    async fn is_browser_alive(&mut self) -> bool;

    /// Navigates and returns the final URL after redirects.
    async fn navigate(&mut self, url: &str, wait: WaitCondition) -> BrowserResult<String>;

    /// Evaluates a script expression. Results cross the boundary as plain
    /// JSON; scripts returning DOM nodes come back as `Value::Null`.
    async fn evaluate(&mut self, script: &str) -> BrowserResult<Value>;

    async fn click(&mut self, selector: &str) -> BrowserResult<()>;

    async fn type_text(&mut self, selector: &str, text: &str) -> BrowserResult<()>;

    async fn press_key(&mut self, selector: &str, key: &str) -> BrowserResult<()>;

    async fn screenshot(&mut self, path: &Path, full_page: bool) -> BrowserResult<PathBuf>;

    async fn html(&mut self) -> BrowserResult<String>;

    async fn query_selector(&mut self, selector: &str) -> BrowserResult<Option<ElementProbe>> {
        let value = self.evaluate(&probe_script(selector)).await?;
        if value.is_null() {
            return Ok(None);
        }
        let probe = serde_json::from_value(value)
            .map_err(|err| BrowserError::Evaluate(format!("selector probe: {err}")))?;
        Ok(Some(probe))
    }

    async fn query_selector_all(&mut self, selector: &str) -> BrowserResult<usize> {
        let script = format!(
            "document.querySelectorAll({}).length",
            js_string(selector)
        );
        let value = self.evaluate(&script).await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    /// Polls until the selector matches (and is visible, when asked).
    /// Returns false on deadline instead of erroring.
    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
        visible: bool,
    ) -> BrowserResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(probe) = self.query_selector(selector).await? {
                if !visible || probe.visible {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Waits for the document to finish loading. Network-idle in the strict
    /// sense is not observable through the evaluate protocol, so readiness
    /// is approximated by `document.readyState`.
    async fn wait_for_network_idle(&mut self, timeout: Duration) -> BrowserResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.evaluate("document.readyState").await?;
            if state.as_str() == Some("complete") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout(format!(
                    "document ready after {}ms",
                    timeout.as_millis()
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn page_url(&mut self) -> BrowserResult<String> {
        let value = self.evaluate("window.location.href").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}

/// Builds the client the configuration asks for. The client starts
/// disconnected; callers decide when to `connect`.
pub fn build_client(config: &RunConfig) -> BrowserResult<Box<dyn BrowserClient>> {
    match config.backend.kind {
        BackendKind::Chromium => Ok(Box::new(ChromiumClient::new(config))),
        BackendKind::Remote => Ok(Box::new(RemoteClient::new(config)?)),
        BackendKind::Stealth => Ok(Box::new(StealthClient::new(config))),
    }
}

/// Quotes a string for safe embedding inside an injected script.
pub(crate) fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| String::from("\"\""))
}

fn probe_script(selector: &str) -> String {
    format!(
        r#"((sel) => {{
    const el = document.querySelector(sel);
    if (!el) return null;
    const style = window.getComputedStyle(el);
    const visible = style.display !== 'none'
        && style.visibility !== 'hidden'
        && el.getClientRects().length > 0;
    return {{ tag: el.tagName.toLowerCase(), visible }};
}})({sel})"#,
        sel = js_string(selector)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn backend_kind_parses_aliases() {
        assert_eq!(BackendKind::from_str("chromium").unwrap(), BackendKind::Chromium);
        assert_eq!(BackendKind::from_str("CDP").unwrap(), BackendKind::Remote);
        assert_eq!(BackendKind::from_str("stealth").unwrap(), BackendKind::Stealth);
        assert!(BackendKind::from_str("firefox").is_err());
    }

    #[test]
    fn js_string_escapes_quotes() {
        assert_eq!(js_string("a'b\"c"), "\"a'b\\\"c\"");
        assert!(probe_script("input[name=\"q\"]").contains("\\\"q\\\""));
    }
}
