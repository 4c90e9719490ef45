//! Page operations shared by the CDP-driven backends. Both the in-process
//! and the remote client hold a `chromiumoxide::Page`; only connection
//! ownership differs between them.

use std::path::{Path, PathBuf};

use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::page::{Page, ScreenshotParams};
use serde_json::Value;

use super::error::{BrowserError, BrowserResult};

pub(crate) async fn goto(page: &Page, url: &str, wait_for_load: bool) -> BrowserResult<String> {
    let params = NavigateParams::builder()
        .url(url)
        .build()
        .map_err(BrowserError::Configuration)?;
    page.goto(params).await?;
    if wait_for_load {
        page.wait_for_navigation().await?;
    }
    let final_url = page.url().await?;
    Ok(final_url.unwrap_or_else(|| url.to_string()))
}

pub(crate) async fn evaluate(page: &Page, script: &str) -> BrowserResult<Value> {
    let result = page.evaluate(script).await?;
    Ok(result.value().cloned().unwrap_or(Value::Null))
}

pub(crate) async fn click(page: &Page, selector: &str) -> BrowserResult<()> {
    let element = page.find_element(selector).await?;
    element.click().await?;
    Ok(())
}

pub(crate) async fn type_text(page: &Page, selector: &str, text: &str) -> BrowserResult<()> {
    let element = page.find_element(selector).await?;
    element.click().await?;
    element.type_str(text).await?;
    Ok(())
}

pub(crate) async fn press_key(page: &Page, selector: &str, key: &str) -> BrowserResult<()> {
    let element = page.find_element(selector).await?;
    element.press_key(key).await?;
    Ok(())
}

pub(crate) async fn screenshot(
    page: &Page,
    path: &Path,
    full_page: bool,
) -> BrowserResult<PathBuf> {
    let params = ScreenshotParams::builder().full_page(full_page).build();
    let bytes = page.screenshot(params).await?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(path.to_path_buf())
}

pub(crate) async fn html(page: &Page) -> BrowserResult<String> {
    Ok(page.content().await?)
}

pub(crate) async fn page_alive(page: &Page) -> bool {
    page.evaluate("1 + 1").await.is_ok()
}
