//! Robots.txt pre-flight. A site whose robots policy disallows the audit
//! entry page fails the run before any browser work starts; a robots file
//! that cannot be fetched is treated as permissive.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::ComplianceSection;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub type ComplianceResult<T> = Result<T, ComplianceError>;

#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error("Failed to build compliance HTTP client: {0}")]
    Http(String),
    #[error("Invalid site URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("Robots policy for {host} disallows {url} (rule: {rule})")]
    Disallowed {
        host: String,
        url: String,
        rule: String,
    },
}

/// Decides whether the audit may open a URL at all.
#[async_trait(?Send)]
pub trait CompliancePolicy {
    async fn ensure_allowed(&self, url: &str) -> ComplianceResult<()>;
}

/// Policy used when robots checking is switched off.
#[derive(Debug, Default)]
pub struct AllowAllPolicy;

#[async_trait(?Send)]
impl CompliancePolicy for AllowAllPolicy {
    async fn ensure_allowed(&self, _url: &str) -> ComplianceResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Rule {
    allow: bool,
    pattern: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct RuleGroup {
    agents: Vec<String>,
    rules: Vec<Rule>,
}

/// Parsed robots.txt rules. Matching follows the common interpretation:
/// the most specific matching user-agent group applies, the longest
/// matching pattern wins, and an allow rule wins a length tie.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RobotsPolicy {
    groups: Vec<RuleGroup>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RobotsVerdict {
    pub allowed: bool,
    pub rule: Option<String>,
}

impl RobotsPolicy {
    pub fn parse(body: &str) -> Self {
        let mut groups: Vec<RuleGroup> = Vec::new();
        let mut in_agent_header = false;
        for raw in body.lines() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_ascii_lowercase();
            let value = value.trim();
            match directive.as_str() {
                "user-agent" => {
                    if !in_agent_header {
                        groups.push(RuleGroup::default());
                    }
                    if let Some(group) = groups.last_mut() {
                        group.agents.push(value.to_ascii_lowercase());
                    }
                    in_agent_header = true;
                }
                "allow" | "disallow" => {
                    in_agent_header = false;
                    // An empty pattern matches nothing; rules outside any
                    // user-agent group are ignored.
                    if value.is_empty() {
                        continue;
                    }
                    if let Some(group) = groups.last_mut() {
                        group.rules.push(Rule {
                            allow: directive == "allow",
                            pattern: value.to_string(),
                        });
                    }
                }
                _ => {
                    in_agent_header = false;
                }
            }
        }
        Self { groups }
    }

    pub fn check(&self, user_agent: &str, path: &str) -> RobotsVerdict {
        let token = user_agent
            .split('/')
            .next()
            .unwrap_or(user_agent)
            .to_ascii_lowercase();
        let Some(group) = self.select_group(&token) else {
            return RobotsVerdict {
                allowed: true,
                rule: None,
            };
        };

        let mut best: Option<&Rule> = None;
        for rule in &group.rules {
            if !pattern_matches(&rule.pattern, path) {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => {
                    rule.pattern.len() > current.pattern.len()
                        || (rule.pattern.len() == current.pattern.len()
                            && rule.allow
                            && !current.allow)
                }
            };
            if better {
                best = Some(rule);
            }
        }
        match best {
            None => RobotsVerdict {
                allowed: true,
                rule: None,
            },
            Some(rule) => RobotsVerdict {
                allowed: rule.allow,
                rule: Some(rule.pattern.clone()),
            },
        }
    }

    fn select_group(&self, token: &str) -> Option<&RuleGroup> {
        let mut specific: Option<(&RuleGroup, usize)> = None;
        let mut wildcard: Option<&RuleGroup> = None;
        for group in &self.groups {
            for agent in &group.agents {
                if agent == "*" {
                    if wildcard.is_none() {
                        wildcard = Some(group);
                    }
                } else if token.contains(agent.as_str()) {
                    let longer = specific.map_or(true, |(_, len)| agent.len() > len);
                    if longer {
                        specific = Some((group, agent.len()));
                    }
                }
            }
        }
        specific.map(|(group, _)| group).or(wildcard)
    }
}

/// Matches a robots pattern against a URL path. `*` spans any run of
/// characters and a trailing `$` anchors the pattern to the end.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(stripped) => (stripped, true),
        None => (pattern, false),
    };
    let mut segments = pattern.split('*');
    let first = segments.next().unwrap_or("");
    if !path.starts_with(first) {
        return false;
    }
    let mut idx = first.len();
    let mut rest: Vec<&str> = segments.collect();

    if anchored {
        let Some(last) = rest.pop() else {
            return path.len() == idx;
        };
        if !path.ends_with(last) || path.len() - last.len() < idx {
            return false;
        }
        let bounded = &path[..path.len() - last.len()];
        for segment in rest {
            if segment.is_empty() {
                continue;
            }
            match bounded[idx..].find(segment) {
                Some(found) => idx += found + segment.len(),
                None => return false,
            }
        }
        return true;
    }

    for segment in rest {
        if segment.is_empty() {
            continue;
        }
        match path[idx..].find(segment) {
            Some(found) => idx += found + segment.len(),
            None => return false,
        }
    }
    true
}

/// Fetches and applies a site's robots.txt before the browser ever opens
/// the site. Transport failures and missing files allow the run to proceed.
#[derive(Debug)]
pub struct RobotsChecker {
    http: reqwest::Client,
    user_agent: String,
    enabled: bool,
}

impl RobotsChecker {
    pub fn new(section: &ComplianceSection) -> ComplianceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(section.user_agent.clone())
            .build()
            .map_err(|err| ComplianceError::Http(err.to_string()))?;
        Ok(Self {
            http,
            user_agent: section.user_agent.clone(),
            enabled: section.respect_robots,
        })
    }

    /// Fetches the site's robots.txt and reports the verdict for `url`,
    /// regardless of whether enforcement is switched on.
    pub async fn check_url(&self, url: &str) -> ComplianceResult<RobotsVerdict> {
        let parsed = parse_url(url)?;
        let robots_url = parsed
            .join("/robots.txt")
            .map_err(|err| ComplianceError::InvalidUrl {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        let body = match self.http.get(robots_url.clone()).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => Some(body),
                Err(err) => {
                    warn!(url = %robots_url, error = %err, "Robots body unreadable, proceeding");
                    None
                }
            },
            Ok(response) => {
                debug!(
                    url = %robots_url,
                    status = %response.status(),
                    "No usable robots.txt, proceeding"
                );
                None
            }
            Err(err) => {
                warn!(url = %robots_url, error = %err, "Robots fetch failed, proceeding");
                None
            }
        };
        let Some(body) = body else {
            return Ok(RobotsVerdict {
                allowed: true,
                rule: None,
            });
        };
        let policy = RobotsPolicy::parse(&body);
        Ok(policy.check(&self.user_agent, &request_path(&parsed)))
    }
}

#[async_trait(?Send)]
impl CompliancePolicy for RobotsChecker {
    async fn ensure_allowed(&self, url: &str) -> ComplianceResult<()> {
        if !self.enabled {
            debug!("Robots checking disabled");
            return Ok(());
        }
        let verdict = self.check_url(url).await?;
        if verdict.allowed {
            return Ok(());
        }
        let parsed = parse_url(url)?;
        Err(ComplianceError::Disallowed {
            host: parsed.host_str().unwrap_or_default().to_string(),
            url: url.to_string(),
            rule: verdict.rule.unwrap_or_default(),
        })
    }
}

fn parse_url(url: &str) -> ComplianceResult<Url> {
    Url::parse(url).map_err(|err| ComplianceError::InvalidUrl {
        url: url.to_string(),
        message: err.to_string(),
    })
}

/// Robots rules match against the path plus any query string.
fn request_path(url: &Url) -> String {
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    path
}

fn apply_policy(policy: &RobotsPolicy, user_agent: &str, url: &Url) -> ComplianceResult<()> {
    let verdict = policy.check(user_agent, &request_path(url));
    if verdict.allowed {
        return Ok(());
    }
    Err(ComplianceError::Disallowed {
        host: url.host_str().unwrap_or_default().to_string(),
        url: url.to_string(),
        rule: verdict.rule.unwrap_or_default(),
    })
}
