use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thirtyfour::{By, ChromiumLikeCapabilities, DesiredCapabilities, WebDriver};
use tracing::{debug, info, warn};

use crate::config::{BackendSection, RunConfig, StealthSection};

use super::client::{BackendKind, BrowserClient, WaitCondition};
use super::error::{BrowserError, BrowserResult};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Drives a patched chromedriver over WebDriver for sites that fingerprint
/// CDP automation. The driver service is an external runtime dependency;
/// connecting probes it first so a missing service surfaces as
/// `StealthUnavailable` instead of an opaque transport error.
#[derive(Debug)]
pub struct StealthClient {
    stealth: StealthSection,
    backend: BackendSection,
    network_idle: Duration,
    http: reqwest::Client,
    proxy: Option<String>,
    driver: Option<WebDriver>,
}

impl StealthClient {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            stealth: config.stealth.clone(),
            backend: config.backend.clone(),
            network_idle: config.timing.network_idle(),
            http: reqwest::Client::new(),
            proxy: None,
            driver: None,
        }
    }

    fn driver(&self) -> BrowserResult<&WebDriver> {
        self.driver.as_ref().ok_or(BrowserError::NotConnected)
    }

    async fn probe_service(&self) -> BrowserResult<()> {
        let status_url = format!("{}/status", self.stealth.webdriver_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&status_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|_| BrowserError::StealthUnavailable(self.stealth.webdriver_url.clone()))?;
        if !response.status().is_success() {
            return Err(BrowserError::StealthUnavailable(
                self.stealth.webdriver_url.clone(),
            ));
        }
        Ok(())
    }
}

/// WebDriver key code table for the keys the pipeline presses.
fn key_code(key: &str) -> String {
    match key.to_lowercase().as_str() {
        "enter" | "return" => '\u{e007}'.to_string(),
        "tab" => '\u{e004}'.to_string(),
        "escape" | "esc" => '\u{e00c}'.to_string(),
        other => other.to_string(),
    }
}

/// WebDriver executes scripts as a function body, the CDP backends as an
/// expression. Wrapping keeps the evaluate contract identical.
fn as_function_body(script: &str) -> String {
    format!("return ({script});")
}

#[async_trait(?Send)]
impl BrowserClient for StealthClient {
    fn backend(&self) -> BackendKind {
        BackendKind::Stealth
    }

    fn set_proxy(&mut self, proxy: Option<String>) {
        self.proxy = proxy;
    }

    async fn connect(&mut self) -> BrowserResult<()> {
        if self.driver.is_some() {
            return Ok(());
        }
        self.probe_service().await?;

        let mut caps = DesiredCapabilities::chrome();
        if let Some(binary) = &self.stealth.binary_path {
            caps.set_binary(binary)?;
        }
        if self.stealth.headless {
            caps.add_arg("--headless=new")?;
        }
        caps.add_arg("--no-first-run")?;
        if let Some(user_agent) = &self.backend.user_agent {
            caps.add_arg(&format!("--user-agent={user_agent}"))?;
        }
        if let Some(locale) = &self.backend.locale {
            caps.add_arg(&format!("--lang={locale}"))?;
        }
        if let Some(proxy) = &self.proxy {
            caps.add_arg(&format!("--proxy-server={proxy}"))?;
        }

        info!(
            endpoint = %self.stealth.webdriver_url,
            headless = self.stealth.headless,
            "Starting stealth WebDriver session"
        );
        let driver = WebDriver::new(&self.stealth.webdriver_url, caps).await?;
        self.driver = Some(driver);
        Ok(())
    }

    async fn disconnect(&mut self) -> BrowserResult<()> {
        if let Some(driver) = self.driver.take() {
            info!("Quitting stealth WebDriver session");
            if let Err(err) = driver.quit().await {
                warn!(error = %err, "WebDriver quit failed");
            }
        }
        Ok(())
    }

    async fn recover_page(&mut self) -> BrowserResult<()> {
        match &self.driver {
            Some(driver) => match driver.goto("about:blank").await {
                Ok(()) => Ok(()),
                Err(err) => {
                    debug!(error = %err, "Blank navigation failed, recycling session");
                    self.reconnect().await
                }
            },
            None => Err(BrowserError::NotConnected),
        }
    }

    async fn reconnect(&mut self) -> BrowserResult<()> {
        if let Err(err) = self.disconnect().await {
            warn!(error = %err, "Teardown before reconnect failed");
        }
        self.connect().await
    }

    async fn is_page_alive(&mut self) -> bool {
        match &self.driver {
            Some(driver) => driver.execute("return 1 + 1;", Vec::new()).await.is_ok(),
            None => false,
        }
    }

    async fn is_browser_alive(&mut self) -> bool {
        match &self.driver {
            Some(driver) => driver.current_url().await.is_ok(),
            None => false,
        }
    }

    async fn navigate(&mut self, url: &str, wait: WaitCondition) -> BrowserResult<String> {
        let network_idle = self.network_idle;
        self.driver()?.goto(url).await?;
        if wait == WaitCondition::NetworkIdle {
            self.wait_for_network_idle(network_idle).await?;
        }
        let final_url = self.driver()?.current_url().await?;
        Ok(final_url.to_string())
    }

    async fn evaluate(&mut self, script: &str) -> BrowserResult<Value> {
        let ret = self
            .driver()?
            .execute(&as_function_body(script), Vec::new())
            .await?;
        Ok(ret.json().clone())
    }

    async fn click(&mut self, selector: &str) -> BrowserResult<()> {
        let element = self.driver()?.find(By::Css(selector)).await?;
        element.click().await?;
        Ok(())
    }

    async fn type_text(&mut self, selector: &str, text: &str) -> BrowserResult<()> {
        let element = self.driver()?.find(By::Css(selector)).await?;
        element.click().await?;
        element.send_keys(text).await?;
        Ok(())
    }

    async fn press_key(&mut self, selector: &str, key: &str) -> BrowserResult<()> {
        let element = self.driver()?.find(By::Css(selector)).await?;
        element.send_keys(key_code(key)).await?;
        Ok(())
    }

    async fn screenshot(&mut self, path: &Path, full_page: bool) -> BrowserResult<PathBuf> {
        if full_page {
            debug!("WebDriver screenshots cover the viewport only");
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.driver()?.screenshot(path).await?;
        Ok(path.to_path_buf())
    }

    async fn html(&mut self) -> BrowserResult<String> {
        Ok(self.driver()?.source().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_codes_cover_pipeline_keys() {
        assert_eq!(key_code("Enter"), "\u{e007}");
        assert_eq!(key_code("tab"), "\u{e004}");
        assert_eq!(key_code("x"), "x");
    }

    #[test]
    fn scripts_become_function_bodies() {
        assert_eq!(
            as_function_body("document.readyState"),
            "return (document.readyState);"
        );
    }
}
