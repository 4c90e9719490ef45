use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BackendSection, ChromiumSection, RunConfig};

use super::cdp;
use super::client::{BackendKind, BrowserClient, WaitCondition};
use super::error::{BrowserError, BrowserResult};

/// Owns a locally launched Chromium process end to end. Everything it
/// creates it also tears down.
#[derive(Debug)]
pub struct ChromiumClient {
    chromium: ChromiumSection,
    backend: BackendSection,
    navigation_timeout: Duration,
    network_idle: Duration,
    proxy: Option<String>,
    browser: Option<Browser>,
    page: Option<Page>,
    handler_task: Option<JoinHandle<()>>,
}

impl ChromiumClient {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            chromium: config.chromium.clone(),
            backend: config.backend.clone(),
            navigation_timeout: config.timing.navigation_timeout(),
            network_idle: config.timing.network_idle(),
            proxy: None,
            browser: None,
            page: None,
            handler_task: None,
        }
    }

    fn page(&self) -> BrowserResult<&Page> {
        self.page.as_ref().ok_or(BrowserError::NotConnected)
    }

    fn build_launch_config(&self) -> BrowserResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder()
            .viewport(ChromiumViewport {
                width: self.chromium.window_width,
                height: self.chromium.window_height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: self.chromium.window_width >= self.chromium.window_height,
                has_touch: false,
            })
            .request_timeout(self.navigation_timeout);

        if let Some(path) = &self.chromium.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !self.chromium.headless {
            builder = builder.with_head();
        }
        if !self.chromium.sandbox {
            builder = builder.no_sandbox();
        }

        let mut args = vec![
            format!(
                "--window-size={},{}",
                self.chromium.window_width, self.chromium.window_height
            ),
            "--no-first-run".to_string(),
            "--disable-features=AutomationControlled".to_string(),
        ];
        if let Some(user_agent) = &self.backend.user_agent {
            args.push(format!("--user-agent={user_agent}"));
        }
        if let Some(locale) = &self.backend.locale {
            args.push(format!("--lang={locale}"));
        }
        if self.chromium.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if let Some(proxy) = &self.proxy {
            args.push(format!("--proxy-server={proxy}"));
        }
        builder = builder.args(args);

        builder.build().map_err(BrowserError::Configuration)
    }
}

#[async_trait(?Send)]
impl BrowserClient for ChromiumClient {
    fn backend(&self) -> BackendKind {
        BackendKind::Chromium
    }

    fn set_proxy(&mut self, proxy: Option<String>) {
        self.proxy = proxy;
    }

    async fn connect(&mut self) -> BrowserResult<()> {
        if self.browser.is_some() {
            return Ok(());
        }
        let launch_config = self.build_launch_config()?;
        info!(
            headless = self.chromium.headless,
            proxy = self.proxy.as_deref().unwrap_or("none"),
            "Launching Chromium instance"
        );
        let (browser, mut handler) = Browser::launch(launch_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await?;

        self.browser = Some(browser);
        self.page = Some(page);
        self.handler_task = Some(handler_task);
        Ok(())
    }

    async fn disconnect(&mut self) -> BrowserResult<()> {
        self.page = None;
        if let Some(mut browser) = self.browser.take() {
            info!("Shutting down Chromium instance");
            if let Err(err) = browser.close().await {
                warn!(error = %err, "Failed to close browser gracefully");
            }
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Browser handler join error");
            }
        }
        Ok(())
    }

    async fn recover_page(&mut self) -> BrowserResult<()> {
        let browser = self.browser.as_ref().ok_or(BrowserError::NotConnected)?;
        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await?;
        if let Some(old) = self.page.replace(page) {
            if let Err(err) = old.close().await {
                debug!(error = %err, "Stale page close failed");
            }
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> BrowserResult<()> {
        if let Err(err) = self.disconnect().await {
            warn!(error = %err, "Teardown before reconnect failed");
        }
        self.connect().await
    }

    async fn is_page_alive(&mut self) -> bool {
        match &self.page {
            Some(page) => cdp::page_alive(page).await,
            None => false,
        }
    }

    async fn is_browser_alive(&mut self) -> bool {
        match &self.browser {
            Some(browser) => browser.version().await.is_ok(),
            None => false,
        }
    }

    async fn navigate(&mut self, url: &str, wait: WaitCondition) -> BrowserResult<String> {
        let network_idle = self.network_idle;
        let final_url = cdp::goto(self.page()?, url, wait != WaitCondition::None).await?;
        if wait == WaitCondition::NetworkIdle {
            self.wait_for_network_idle(network_idle).await?;
        }
        Ok(final_url)
    }

    async fn evaluate(&mut self, script: &str) -> BrowserResult<Value> {
        cdp::evaluate(self.page()?, script).await
    }

    async fn click(&mut self, selector: &str) -> BrowserResult<()> {
        cdp::click(self.page()?, selector).await
    }

    async fn type_text(&mut self, selector: &str, text: &str) -> BrowserResult<()> {
        cdp::type_text(self.page()?, selector, text).await
    }

    async fn press_key(&mut self, selector: &str, key: &str) -> BrowserResult<()> {
        cdp::press_key(self.page()?, selector, key).await
    }

    async fn screenshot(&mut self, path: &Path, full_page: bool) -> BrowserResult<PathBuf> {
        cdp::screenshot(self.page()?, path, full_page).await
    }

    async fn html(&mut self) -> BrowserResult<String> {
        cdp::html(self.page()?).await
    }
}
