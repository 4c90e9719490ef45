//! Run-level orchestration: compliance pre-flight, browser lifecycle,
//! bounded retries with recovery, checkpointing, and the final stats.
//! One orchestrator drives one site's query list end to end.

use rand::Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{
    classify, is_retryable, BrowserClient, BrowserError, ErrorKind, WaitCondition,
};
use crate::checkpoint::{
    completed_ids, latest_run_dir, CheckpointLog, FailureContext, FailureLog, RemediationAction,
    RunPaths,
};
use crate::compliance::{AllowAllPolicy, CompliancePolicy, RobotsChecker};
use crate::config::RunConfig;
use crate::model::Query;
use crate::proxy::{ProxyRotator, ProxyStrategy};

use super::error::{AuditError, AuditResult};
use super::pipeline::QueryPipeline;

const BACKOFF_CAP: Duration = Duration::from_secs(300);
const BACKOFF_MAX_SHIFT: u32 = 16;
const JITTER_LOW: f64 = 0.7;
const JITTER_HIGH: f64 = 1.3;

/// Exponential backoff with jitter. `failures` is how many attempts have
/// already failed, so the first retry waits around one base interval.
fn backoff_delay<R: Rng>(base: Duration, failures: u32, rng: &mut R) -> Duration {
    let shift = failures.min(BACKOFF_MAX_SHIFT);
    let scaled = base.saturating_mul(1u32 << shift).min(BACKOFF_CAP);
    scaled
        .mul_f64(rng.gen_range(JITTER_LOW..=JITTER_HIGH))
        .min(BACKOFF_CAP)
}

/// Cooperative rate limit between attempts. The very first attempt of a run
/// goes through immediately; every later one pays a jittered interval.
#[derive(Debug)]
struct ThrottleGate {
    interval: Duration,
    fired: bool,
}

impl ThrottleGate {
    fn new(throttle_rps: f64) -> Self {
        let interval = if throttle_rps > 0.0 {
            Duration::from_secs_f64(1.0 / throttle_rps)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            fired: false,
        }
    }

    fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Duration {
        if !self.fired {
            self.fired = true;
            return Duration::ZERO;
        }
        if self.interval.is_zero() {
            return Duration::ZERO;
        }
        self.interval
            .mul_f64(rng.gen_range(JITTER_LOW..=JITTER_HIGH))
    }
}

/// Cloneable stop signal. Cancellation is honored between queries, never in
/// the middle of one, so the checkpoint stays consistent.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How the orchestrator picks its run directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResumeMode {
    /// Always start a new run directory.
    #[default]
    Fresh,
    /// Continue the latest prior run for the site when one exists.
    Latest,
    /// Continue a specific run directory.
    Dir(PathBuf),
}

/// Summary counters for one run, serialized by the CLI in json mode.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub total_queries: usize,
    pub skipped_checkpoint: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped_timeout: usize,
    pub failed_permanent: usize,
    pub retries: u64,
    pub page_recoveries: u64,
    pub reconnects: u64,
    pub challenges_detected: u64,
    pub proxies_used: u64,
    pub checkpoint_lines_skipped: usize,
    pub resumed: bool,
    pub total_wait_ms: u64,
    pub duration_secs: f64,
    pub run_dir: PathBuf,
    pub errors: Vec<String>,
}

/// Host component of a site URL, the key under which its runs are stored.
pub fn site_host(site: &str) -> AuditResult<String> {
    let parsed = Url::parse(site).map_err(|err| AuditError::Site(format!("{site}: {err}")))?;
    Ok(parsed
        .host_str()
        .ok_or_else(|| AuditError::Site(format!("{site}: missing host")))?
        .to_string())
}

enum QueryOutcome {
    Recorded(Box<crate::model::AuditRecord>),
    SkippedTimeout { message: String },
    Failed { kind: ErrorKind, message: String },
}

struct RunState {
    rotator: ProxyRotator,
    throttle: ThrottleGate,
    failures: FailureLog,
    stats: RunStats,
}

/// Drives a full audit run against one site.
pub struct AuditOrchestrator {
    config: RunConfig,
    site: String,
    site_host: String,
    client: Box<dyn BrowserClient>,
    policy: Box<dyn CompliancePolicy>,
    pipeline: QueryPipeline,
    resume: ResumeMode,
    cancel: CancelFlag,
}

impl AuditOrchestrator {
    pub fn new(
        config: RunConfig,
        site: &str,
        client: Box<dyn BrowserClient>,
    ) -> AuditResult<Self> {
        let site_host = site_host(site)?;
        let policy: Box<dyn CompliancePolicy> = if config.compliance.respect_robots {
            Box::new(RobotsChecker::new(&config.compliance)?)
        } else {
            Box::new(AllowAllPolicy)
        };
        let pipeline = QueryPipeline::from_config(&config);
        Ok(Self {
            config,
            site: site.to_string(),
            site_host,
            client,
            policy,
            pipeline,
            resume: ResumeMode::default(),
            cancel: CancelFlag::default(),
        })
    }

    pub fn with_resume(mut self, resume: ResumeMode) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_policy(mut self, policy: Box<dyn CompliancePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_pipeline(mut self, pipeline: QueryPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Handle for cancelling the run from another task or a signal handler.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn run(&mut self, queries: &[Query]) -> AuditResult<RunStats> {
        let started = Instant::now();
        self.policy.ensure_allowed(&self.site).await?;

        let out_dir = Path::new(&self.config.paths.out_dir);
        let (paths, resumed) = match &self.resume {
            ResumeMode::Dir(dir) => {
                let paths = RunPaths::open(dir);
                paths.prepare()?;
                (paths, true)
            }
            ResumeMode::Latest => match latest_run_dir(out_dir, &self.site_host)? {
                Some(dir) => {
                    let paths = RunPaths::open(&dir);
                    paths.prepare()?;
                    (paths, true)
                }
                None => (RunPaths::create(out_dir, &self.site_host)?, false),
            },
            ResumeMode::Fresh => (RunPaths::create(out_dir, &self.site_host)?, false),
        };

        let (done, lines_skipped) = completed_ids(&paths.audit_log)?;
        let mut checkpoint = CheckpointLog::append_to(&paths.audit_log)?;
        let mut state = RunState {
            rotator: ProxyRotator::new(&self.config.proxy),
            throttle: ThrottleGate::new(self.config.timing.throttle_rps),
            failures: FailureLog::append_to(&paths.failures_log)?,
            stats: RunStats {
                total_queries: queries.len(),
                checkpoint_lines_skipped: lines_skipped,
                resumed,
                run_dir: paths.root.clone(),
                ..RunStats::default()
            },
        };
        if resumed {
            info!(
                completed = done.len(),
                run_dir = %paths.root.display(),
                "Resuming prior run"
            );
        } else {
            info!(run_dir = %paths.root.display(), site = %self.site, "Starting audit run");
        }

        if let Some(proxy) = state.rotator.next() {
            state.stats.proxies_used += 1;
            self.client.set_proxy(Some(proxy));
        }
        self.client.connect().await?;
        let landing = self.client.navigate(&self.site, WaitCondition::Load).await?;
        debug!(url = %landing, "Landed on site root");

        for query in queries {
            if done.contains(&query.id) {
                state.stats.skipped_checkpoint += 1;
                debug!(query = %query.id, "Already checkpointed, skipping");
                continue;
            }
            if self.cancel.is_cancelled() {
                warn!("Cancellation requested, stopping before next query");
                break;
            }
            state.stats.attempted += 1;
            if state.rotator.strategy() == ProxyStrategy::PerQuery {
                if let Some(proxy) = state.rotator.next() {
                    state.stats.proxies_used += 1;
                    self.client.set_proxy(Some(proxy));
                }
            }
            let outcome = Self::run_single(
                self.client.as_mut(),
                &self.pipeline,
                &self.config,
                &self.site,
                query,
                &paths,
                &mut state,
            )
            .await?;
            match outcome {
                QueryOutcome::Recorded(record) => {
                    checkpoint.append(&record)?;
                    state.stats.succeeded += 1;
                    info!(
                        query = %query.id,
                        score = record.judge.score,
                        items = record.items.len(),
                        "Query audited"
                    );
                }
                QueryOutcome::SkippedTimeout { message } => {
                    state.stats.skipped_timeout += 1;
                    state
                        .stats
                        .errors
                        .push(format!("{}: timeout, skipped ({message})", query.id));
                }
                QueryOutcome::Failed { kind, message } => {
                    state.stats.failed_permanent += 1;
                    state
                        .stats
                        .errors
                        .push(format!("{}: {kind}: {message}", query.id));
                }
            }
        }

        if let Err(err) = self.client.disconnect().await {
            warn!(error = %err, "Browser teardown failed");
        }
        state.stats.duration_secs = started.elapsed().as_secs_f64();
        info!(
            succeeded = state.stats.succeeded,
            failed = state.stats.failed_permanent,
            skipped_timeout = state.stats.skipped_timeout,
            "Audit run finished"
        );
        Ok(state.stats)
    }

    /// Attempt loop for one query. Returns an infrastructure error only when
    /// logging the failure itself failed; query-level faults turn into an
    /// outcome so the run continues.
    async fn run_single(
        client: &mut dyn BrowserClient,
        pipeline: &QueryPipeline,
        config: &RunConfig,
        site: &str,
        query: &Query,
        paths: &RunPaths,
        state: &mut RunState,
    ) -> AuditResult<QueryOutcome> {
        let max_retries = config.retry.max_retries;
        let mut failed_attempts = 0u32;
        loop {
            let pause = state.throttle.next_delay(&mut rand::thread_rng());
            if !pause.is_zero() {
                state.stats.total_wait_ms += pause.as_millis() as u64;
                tokio::time::sleep(pause).await;
            }

            let attempt_result = match Self::ensure_session(client, site, state).await {
                Ok(()) => pipeline.run_query(client, site, query, paths).await,
                Err(err) => Err(AuditError::Browser(err)),
            };
            let err = match attempt_result {
                Ok(record) => return Ok(QueryOutcome::Recorded(Box::new(record))),
                Err(err) => err,
            };

            let (kind, message, challenged) = match &err {
                AuditError::Browser(browser_err) => (
                    classify(browser_err),
                    browser_err.to_string(),
                    matches!(browser_err, BrowserError::Challenge(_)),
                ),
                AuditError::Judge(message) => (ErrorKind::Permanent, message.clone(), false),
                _ => return Err(err),
            };

            if kind == ErrorKind::Timeout {
                warn!(query = %query.id, error = %message, "Attempt timed out, skipping query");
                state.failures.record(
                    &FailureContext::new(&query.id, failed_attempts + 1, kind, message.clone())
                        .with_action(RemediationAction::SkippedTimeout),
                )?;
                return Ok(QueryOutcome::SkippedTimeout { message });
            }
            if challenged {
                state.stats.challenges_detected += 1;
            }
            if !is_retryable(kind) || failed_attempts >= max_retries {
                warn!(query = %query.id, kind = %kind, error = %message, "Query failed permanently");
                state.failures.record(
                    &FailureContext::new(&query.id, failed_attempts + 1, kind, message.clone())
                        .with_action(RemediationAction::Abort),
                )?;
                return Ok(QueryOutcome::Failed { kind, message });
            }

            let delay = backoff_delay(
                config.retry.backoff_base(),
                failed_attempts,
                &mut rand::thread_rng(),
            );
            failed_attempts += 1;
            state.stats.retries += 1;

            let mut action = RemediationAction::RetryScheduled {
                delay_ms: delay.as_millis() as u64,
            };
            if challenged {
                if let Some(proxy) = state.rotator.next() {
                    client.set_proxy(Some(proxy.clone()));
                    state.stats.proxies_used += 1;
                    action = RemediationAction::ProxyRotated { proxy };
                }
            }
            state.failures.record(
                &FailureContext::new(&query.id, failed_attempts, kind, message.clone())
                    .with_action(action),
            )?;
            warn!(
                query = %query.id,
                attempt = failed_attempts,
                kind = %kind,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Attempt failed, scheduling retry"
            );

            if let Err(recover_err) =
                Self::repair_session(client, site, kind, challenged, state).await
            {
                warn!(error = %recover_err, "Recovery failed, retrying regardless");
            }

            state.stats.total_wait_ms += delay.as_millis() as u64;
            tokio::time::sleep(delay).await;
        }
    }

    /// Verifies the session is usable before an attempt and repairs it if
    /// not. A healthy session passes through untouched.
    async fn ensure_session(
        client: &mut dyn BrowserClient,
        site: &str,
        state: &mut RunState,
    ) -> Result<(), BrowserError> {
        if !client.is_browser_alive().await {
            warn!("Browser session is gone, reconnecting");
            client.reconnect().await?;
            state.stats.reconnects += 1;
            client.navigate(site, WaitCondition::Load).await?;
            return Ok(());
        }
        if !client.is_page_alive().await {
            debug!("Page is gone, opening a fresh one");
            client.recover_page().await?;
            state.stats.page_recoveries += 1;
            client.navigate(site, WaitCondition::Load).await?;
        }
        Ok(())
    }

    /// Kind-specific recovery after a failed attempt. A challenge or a dead
    /// browser forces a full reconnect (which also applies any proxy change);
    /// otherwise a fresh page on the live browser is enough.
    async fn repair_session(
        client: &mut dyn BrowserClient,
        site: &str,
        kind: ErrorKind,
        challenged: bool,
        state: &mut RunState,
    ) -> Result<(), BrowserError> {
        let full_reconnect =
            challenged || kind == ErrorKind::BrowserDead || !client.is_browser_alive().await;
        if full_reconnect {
            client.reconnect().await?;
            state.stats.reconnects += 1;
        } else {
            client.recover_page().await?;
            state.stats.page_recoveries += 1;
        }
        client.navigate(site, WaitCondition::Load).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn backoff_grows_and_stays_within_jitter_bounds() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let base = Duration::from_millis(500);
        for failures in 0..4 {
            let delay = backoff_delay(base, failures, &mut rng);
            let nominal = 500u64 << failures;
            assert!(delay >= Duration::from_millis((nominal as f64 * JITTER_LOW) as u64));
            assert!(delay <= Duration::from_millis((nominal as f64 * JITTER_HIGH) as u64 + 1));
        }
    }

    #[test]
    fn backoff_caps_out_regardless_of_attempt() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        for failures in [10, 20, 60] {
            let delay = backoff_delay(Duration::from_secs(10), failures, &mut rng);
            assert!(delay <= BACKOFF_CAP);
        }
    }

    #[test]
    fn first_throttle_pause_is_free() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let mut gate = ThrottleGate::new(2.0);
        assert_eq!(gate.next_delay(&mut rng), Duration::ZERO);
        let second = gate.next_delay(&mut rng);
        assert!(second >= Duration::from_millis(350));
        assert!(second <= Duration::from_millis(650));
    }

    #[test]
    fn zero_throttle_never_pauses() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let mut gate = ThrottleGate::new(0.0);
        gate.next_delay(&mut rng);
        assert_eq!(gate.next_delay(&mut rng), Duration::ZERO);
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
