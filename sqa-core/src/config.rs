use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::browser::BackendKind;
use crate::error::{ConfigError, Result};
use crate::proxy::ProxyStrategy;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunConfig {
    pub backend: BackendSection,
    pub chromium: ChromiumSection,
    pub remote: RemoteSection,
    pub cloud: CloudSection,
    pub stealth: StealthSection,
    pub retry: RetrySection,
    pub timing: TimingSection,
    pub scroll: ScrollSection,
    pub proxy: ProxySection,
    pub selectors: SelectorSection,
    pub challenge: ChallengeSection,
    pub compliance: ComplianceSection,
    pub audit: AuditSection,
    pub paths: PathsSection,
}

impl RunConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.out_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    pub kind: BackendKind,
    pub user_agent: Option<String>,
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub window_width: u32,
    pub window_height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSection {
    pub endpoint: Option<String>,
    pub reuse_existing_page: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudSection {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub session_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StealthSection {
    pub webdriver_url: String,
    pub binary_path: Option<String>,
    pub headless: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl RetrySection {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingSection {
    pub throttle_rps: f64,
    pub navigation_timeout_ms: u64,
    pub click_timeout_ms: u64,
    pub network_idle_ms: u64,
}

impl TimingSection {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn click_timeout(&self) -> Duration {
        Duration::from_millis(self.click_timeout_ms)
    }

    pub fn network_idle(&self) -> Duration {
        Duration::from_millis(self.network_idle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScrollSection {
    pub max_attempts: u32,
    pub step_px: u32,
    pub pause_ms: u64,
    pub load_more_selectors: Vec<String>,
    pub load_more_phrases: Vec<String>,
}

impl ScrollSection {
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    pub strategy: ProxyStrategy,
    pub servers: Vec<String>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorSection {
    pub search_input: String,
    pub search_button: Option<String>,
    pub results_container: String,
    pub result_card: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub price: Option<String>,
    pub link: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeSection {
    pub title_phrases: Vec<String>,
    pub vendor_selectors: Vec<String>,
    pub iframe_markers: Vec<String>,
    pub block_keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComplianceSection {
    pub respect_robots: bool,
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditSection {
    pub top_k: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub out_dir: String,
}

pub fn load_run_config<P: AsRef<Path>>(path: P) -> Result<RunConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/audit.toml");
        let config = load_run_config(path).expect("config should parse");
        assert_eq!(config.backend.kind, BackendKind::Chromium);
        assert!(config.audit.top_k >= 1);
        assert!(config.retry.max_retries >= 1);
        assert!(!config.selectors.search_input.is_empty());
        assert!(!config.challenge.title_phrases.is_empty());
    }

    #[test]
    fn missing_config_reports_path() {
        let err = load_run_config("/nonexistent/audit.toml").unwrap_err();
        match err {
            ConfigError::Io { path, .. } => {
                assert_eq!(path, PathBuf::from("/nonexistent/audit.toml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn relative_paths_resolve_under_out_dir() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/audit.toml");
        let mut config = load_run_config(path).expect("config should parse");
        config.paths.out_dir = "/var/audit/runs".to_string();
        assert_eq!(
            config.resolve_path("shop.example.com/20260101-000000"),
            PathBuf::from("/var/audit/runs/shop.example.com/20260101-000000")
        );
        assert_eq!(
            config.resolve_path("/tmp/elsewhere"),
            PathBuf::from("/tmp/elsewhere")
        );
    }
}
