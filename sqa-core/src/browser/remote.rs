use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CloudSection, RemoteSection, RunConfig};

use super::cdp;
use super::client::{BackendKind, BrowserClient, WaitCondition};
use super::error::{BrowserError, BrowserResult};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct CloudSession {
    id: Option<String>,
    ws_url: String,
}

/// Attaches to a browser somebody else runs: a fixed CDP endpoint or a
/// session provisioned from a cloud browser API. The client tracks what it
/// created itself and closes only that; the remote browser always outlives
/// a disconnect.
#[derive(Debug)]
pub struct RemoteClient {
    remote: RemoteSection,
    cloud: CloudSection,
    network_idle: Duration,
    http: reqwest::Client,
    proxy: Option<String>,
    browser: Option<Browser>,
    page: Option<Page>,
    handler_task: Option<JoinHandle<()>>,
    owns_page: bool,
    session: Option<CloudSession>,
}

impl RemoteClient {
    pub fn new(config: &RunConfig) -> BrowserResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| BrowserError::Unexpected(format!("http client: {err}")))?;
        Ok(Self {
            remote: config.remote.clone(),
            cloud: config.cloud.clone(),
            network_idle: config.timing.network_idle(),
            http,
            proxy: None,
            browser: None,
            page: None,
            handler_task: None,
            owns_page: false,
            session: None,
        })
    }

    fn page(&self) -> BrowserResult<&Page> {
        self.page.as_ref().ok_or(BrowserError::NotConnected)
    }

    /// Resolves an http(s) endpoint to its websocket debugger URL via the
    /// standard `/json/version` discovery page.
    async fn discover_ws_url(&self, endpoint: &str) -> BrowserResult<String> {
        if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            return Ok(endpoint.to_string());
        }
        let version_url = format!("{}/json/version", endpoint.trim_end_matches('/'));
        let response = self
            .http
            .get(&version_url)
            .send()
            .await
            .map_err(|err| BrowserError::Navigation(format!("cdp discovery {version_url}: {err}")))?;
        if !response.status().is_success() {
            return Err(BrowserError::Navigation(format!(
                "cdp discovery {version_url} returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| BrowserError::Navigation(format!("cdp discovery body: {err}")))?;
        body.get("webSocketDebuggerUrl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                BrowserError::Navigation(format!(
                    "cdp discovery {version_url} missing webSocketDebuggerUrl"
                ))
            })
    }

    async fn provision_session(&self) -> BrowserResult<CloudSession> {
        let api_url = self.cloud.api_url.as_deref().ok_or_else(|| {
            BrowserError::Configuration(
                "remote backend needs either remote.endpoint or cloud.api_url".into(),
            )
        })?;
        let mut request = self
            .http
            .post(format!("{}/sessions", api_url.trim_end_matches('/')))
            .json(&serde_json::json!({
                "ttl_seconds": self.cloud.session_ttl_seconds,
                "proxy": self.proxy,
            }));
        if let Some(key) = &self.cloud.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| BrowserError::CloudSession(format!("provisioning request: {err}")))?;
        if !response.status().is_success() {
            return Err(BrowserError::CloudSession(format!(
                "provisioning returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| BrowserError::CloudSession(format!("provisioning body: {err}")))?;
        let ws_url = body
            .get("connect_url")
            .or_else(|| body.get("webSocketDebuggerUrl"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                BrowserError::CloudSession("provisioning response missing connect_url".into())
            })?;
        let id = body.get("id").and_then(Value::as_str).map(str::to_string);
        Ok(CloudSession { id, ws_url })
    }

    async fn release_session(&self, session: &CloudSession) {
        let (Some(api_url), Some(id)) = (self.cloud.api_url.as_deref(), session.id.as_deref())
        else {
            return;
        };
        let mut request = self
            .http
            .delete(format!("{}/sessions/{id}", api_url.trim_end_matches('/')));
        if let Some(key) = &self.cloud.api_key {
            request = request.bearer_auth(key);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(session = %id, "Released cloud browser session");
            }
            Ok(response) => {
                warn!(session = %id, status = %response.status(), "Cloud session release refused");
            }
            Err(err) => {
                warn!(session = %id, error = %err, "Cloud session release failed");
            }
        }
    }
}

#[async_trait(?Send)]
impl BrowserClient for RemoteClient {
    fn backend(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn set_proxy(&mut self, proxy: Option<String>) {
        self.proxy = proxy;
    }

    async fn connect(&mut self) -> BrowserResult<()> {
        if self.browser.is_some() {
            return Ok(());
        }
        let ws_url = match &self.remote.endpoint {
            Some(endpoint) => self.discover_ws_url(endpoint).await?,
            None => {
                let session = self.provision_session().await?;
                let ws_url = session.ws_url.clone();
                info!(
                    session = session.id.as_deref().unwrap_or("anonymous"),
                    "Provisioned cloud browser session"
                );
                self.session = Some(session);
                ws_url
            }
        };

        let (browser, mut handler) = Browser::connect(ws_url).await?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Remote handler reported error");
                }
            }
        });

        let (page, owns_page) = if self.remote.reuse_existing_page {
            match browser.pages().await?.into_iter().next() {
                Some(existing) => (existing, false),
                None => (
                    browser
                        .new_page(CreateTargetParams::new("about:blank"))
                        .await?,
                    true,
                ),
            }
        } else {
            (
                browser
                    .new_page(CreateTargetParams::new("about:blank"))
                    .await?,
                true,
            )
        };

        info!(owns_page, "Attached to remote browser");
        self.browser = Some(browser);
        self.page = Some(page);
        self.handler_task = Some(handler_task);
        self.owns_page = owns_page;
        Ok(())
    }

    async fn disconnect(&mut self) -> BrowserResult<()> {
        if let Some(page) = self.page.take() {
            // Never close a page this client merely adopted.
            if self.owns_page {
                if let Err(err) = page.close().await {
                    debug!(error = %err, "Remote page close failed");
                }
            }
        }
        self.browser = None;
        if let Some(handle) = self.handler_task.take() {
            handle.abort();
        }
        if let Some(session) = self.session.take() {
            self.release_session(&session).await;
        }
        self.owns_page = false;
        Ok(())
    }

    async fn recover_page(&mut self) -> BrowserResult<()> {
        let browser = self.browser.as_ref().ok_or(BrowserError::NotConnected)?;
        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await?;
        let old = self.page.replace(page);
        if self.owns_page {
            if let Some(old) = old {
                if let Err(err) = old.close().await {
                    debug!(error = %err, "Stale page close failed");
                }
            }
        }
        self.owns_page = true;
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
