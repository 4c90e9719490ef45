use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sqa_core::{
    build_client, latest_run_dir, load_records, load_run_config, site_host, AuditOrchestrator,
    AuditRecord, Query, QueryOrigin, ResumeMode, RobotsChecker, RunConfig, RunPaths, RunStats,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] sqa_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("audit error: {0}")]
    Audit(#[from] sqa_core::AuditError),
    #[error("browser error: {0}")]
    Browser(#[from] sqa_core::BrowserError),
    #[error("compliance error: {0}")]
    Compliance(#[from] sqa_core::ComplianceError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] sqa_core::CheckpointError),
    #[error("invalid query file {path}: {message}")]
    QueryFile { path: PathBuf, message: String },
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("{0} queries failed permanently")]
    QueriesFailed(usize),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Search quality audit control interface", long_about = None)]
pub struct Cli {
    /// Path to the audit configuration file
    #[arg(long, default_value = "configs/audit.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a search quality audit against one site
    Run(RunArgs),
    /// Inspect checkpointed runs
    #[command(subcommand)]
    Checkpoint(CheckpointCommands),
    /// Robots.txt pre-flight checks
    #[command(subcommand)]
    Robots(RobotsCommands),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Site root URL to audit
    #[arg(long)]
    pub site: String,
    /// Query list file: JSON array, JSONL, or plain text lines
    #[arg(long)]
    pub queries: PathBuf,
    /// Continue the latest prior run for this site
    #[arg(long, default_value_t = false)]
    pub resume: bool,
    /// Continue a specific run directory
    #[arg(long, conflicts_with = "resume")]
    pub resume_dir: Option<PathBuf>,
    /// Override the configured browser backend (chromium, remote, stealth)
    #[arg(long)]
    pub backend: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum CheckpointCommands {
    /// Summarize the checkpoint of a run directory
    Show(CheckpointShowArgs),
}

#[derive(Args, Debug)]
pub struct CheckpointShowArgs {
    /// Run directory to inspect; relative paths resolve under paths.out_dir
    #[arg(long)]
    pub run_dir: Option<PathBuf>,
    /// Site whose latest run to inspect instead of naming a directory
    #[arg(long, conflicts_with = "run_dir")]
    pub site: Option<String>,
    /// Include the full audit records in json output
    #[arg(long, default_value_t = false)]
    pub records: bool,
}

#[derive(Subcommand, Debug)]
pub enum RobotsCommands {
    /// Fetch robots.txt and report whether a URL may be audited
    Check(RobotsCheckArgs),
}

#[derive(Args, Debug)]
pub struct RobotsCheckArgs {
    /// URL to check against the site's robots policy
    #[arg(long)]
    pub url: String,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

pub async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Run(args) => {
            let config = load_run_config(&cli.config)?;
            let report = run_audit(config, args).await?;
            render(&report, cli.format)?;
            if report.stats.failed_permanent > 0 {
                return Err(AppError::QueriesFailed(report.stats.failed_permanent));
            }
        }
        Commands::Checkpoint(CheckpointCommands::Show(args)) => {
            let config = load_run_config(&cli.config)?;
            let report = checkpoint_show(&config, args)?;
            render(&report, cli.format)?;
        }
        Commands::Robots(RobotsCommands::Check(args)) => {
            let config = load_run_config(&cli.config)?;
            let report = robots_check(&config, args).await?;
            render(&report, cli.format)?;
        }
        Commands::Completions(args) => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            clap_complete::generate(args.shell, &mut command, name, &mut io::stdout());
        }
    }

    Ok(())
}

async fn run_audit(mut config: RunConfig, args: &RunArgs) -> Result<RunReport> {
    if let Some(backend) = &args.backend {
        config.backend.kind = backend.parse()?;
    }
    let queries = load_queries(&args.queries)?;
    if queries.is_empty() {
        return Err(AppError::MissingResource(format!(
            "no queries found in {}",
            args.queries.display()
        )));
    }

    let resume = if let Some(dir) = &args.resume_dir {
        ResumeMode::Dir(dir.clone())
    } else if args.resume {
        ResumeMode::Latest
    } else {
        ResumeMode::Fresh
    };

    let client = build_client(&config)?;
    let mut orchestrator =
        AuditOrchestrator::new(config, &args.site, client)?.with_resume(resume);

    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, stopping after the current query");
            cancel.cancel();
        }
    });

    let stats = orchestrator.run(&queries).await?;
    Ok(RunReport {
        site: args.site.clone(),
        stats,
    })
}

fn checkpoint_show(config: &RunConfig, args: &CheckpointShowArgs) -> Result<CheckpointReport> {
    let run_dir = match (&args.run_dir, &args.site) {
        (Some(dir), _) => config.resolve_path(dir),
        (None, Some(site)) => {
            let host = host_for(site);
            latest_run_dir(Path::new(&config.paths.out_dir), &host)?.ok_or_else(|| {
                AppError::MissingResource(format!(
                    "no prior run for {host} under {}",
                    config.paths.out_dir
                ))
            })?
        }
        (None, None) => {
            return Err(AppError::MissingResource(
                "either --run-dir or --site is required".to_string(),
            ))
        }
    };

    let paths = RunPaths::open(&run_dir);
    if !paths.audit_log.is_file() {
        return Err(AppError::MissingResource(format!(
            "no checkpoint log in {}",
            run_dir.display()
        )));
    }
    let (records, skipped) = load_records(&paths.audit_log)?;
    let queries = records
        .iter()
        .map(|record| CompletedQuery {
            id: record.query.id.clone(),
            text: record.query.text.clone(),
            score: record.judge.score,
            items: record.items.len(),
            captured_at: record.page.captured_at,
        })
        .collect();

    Ok(CheckpointReport {
        run_dir,
        completed: records.len(),
        malformed_lines: skipped,
        queries,
        records: args.records.then_some(records),
    })
}

async fn robots_check(config: &RunConfig, args: &RobotsCheckArgs) -> Result<RobotsReport> {
    let checker = RobotsChecker::new(&config.compliance)?;
    let verdict = checker.check_url(&args.url).await?;
    Ok(RobotsReport {
        url: args.url.clone(),
        user_agent: config.compliance.user_agent.clone(),
        allowed: verdict.allowed,
        rule: verdict.rule,
    })
}

/// Accepts a full site URL or a bare host for run directory lookups.
fn host_for(site: &str) -> String {
    site_host(site).unwrap_or_else(|_| site.trim_end_matches('/').to_string())
}

#[derive(Debug, Deserialize)]
struct QuerySpec {
    #[serde(default)]
    id: Option<String>,
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    origin: Option<QueryOrigin>,
}

/// Loads the query list for a run. A file starting with `[` is a JSON
/// array, one starting with `{` is JSONL, anything else is plain lines
/// (blank lines and `#` comments skipped). Missing ids become a `q###`
/// sequence keyed on position.
pub fn load_queries(path: &Path) -> Result<Vec<Query>> {
    let content = fs::read_to_string(path).map_err(|err| AppError::QueryFile {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    let specs = match content.trim_start().chars().next() {
        Some('[') => {
            serde_json::from_str::<Vec<QuerySpec>>(&content).map_err(|err| {
                AppError::QueryFile {
                    path: path.to_path_buf(),
                    message: err.to_string(),
                }
            })?
        }
        Some('{') => {
            let mut specs = Vec::new();
            for (number, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let spec =
                    serde_json::from_str::<QuerySpec>(line).map_err(|err| AppError::QueryFile {
                        path: path.to_path_buf(),
                        message: format!("line {}: {err}", number + 1),
                    })?;
                specs.push(spec);
            }
            specs
        }
        _ => content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| QuerySpec {
                id: None,
                text: line.to_string(),
                language: None,
                origin: None,
            })
            .collect(),
    };

    finalize_queries(specs, path)
}

fn finalize_queries(specs: Vec<QuerySpec>, path: &Path) -> Result<Vec<Query>> {
    let mut seen = HashSet::new();
    let mut queries = Vec::with_capacity(specs.len());
    for (index, spec) in specs.into_iter().enumerate() {
        let text = spec.text.trim().to_string();
        if text.is_empty() {
            return Err(AppError::QueryFile {
                path: path.to_path_buf(),
                message: format!("entry {} has empty text", index + 1),
            });
        }
        let id = spec
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("q{:03}", index + 1));
        if !seen.insert(id.clone()) {
            return Err(AppError::QueryFile {
                path: path.to_path_buf(),
                message: format!("duplicate query id '{id}'"),
            });
        }
        let mut query = Query::predefined(id, text);
        query.language = spec.language;
        if let Some(origin) = spec.origin {
            query.origin = origin;
        }
        queries.push(query);
    }
    Ok(queries)
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub site: String,
    pub stats: RunStats,
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let stats = &self.stats;
        let mut lines = vec![
            format!("Site: {}", self.site),
            format!("Run dir: {}", stats.run_dir.display()),
            format!(
                "Queries: {} total, {} already checkpointed, {} attempted",
                stats.total_queries, stats.skipped_checkpoint, stats.attempted
            ),
            format!(
                "Succeeded: {} | timeouts skipped: {} | failed: {}",
                stats.succeeded, stats.skipped_timeout, stats.failed_permanent
            ),
            format!(
                "Retries: {} (page recoveries: {}, reconnects: {}, challenges: {}, proxies: {})",
                stats.retries,
                stats.page_recoveries,
                stats.reconnects,
                stats.challenges_detected,
                stats.proxies_used
            ),
            format!(
                "Waited {} ms between attempts; finished in {:.1} s",
                stats.total_wait_ms, stats.duration_secs
            ),
        ];
        if stats.checkpoint_lines_skipped > 0 {
            lines.push(format!(
                "Malformed checkpoint lines skipped: {}",
                stats.checkpoint_lines_skipped
            ));
        }
        if !stats.errors.is_empty() {
            lines.push("Failures:".to_string());
            for error in &stats.errors {
                lines.push(format!("  - {error}"));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CheckpointReport {
    pub run_dir: PathBuf,
    pub completed: usize,
    pub malformed_lines: usize,
    pub queries: Vec<CompletedQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<AuditRecord>>,
}

#[derive(Debug, Serialize)]
pub struct CompletedQuery {
    pub id: String,
    pub text: String,
    pub score: f64,
    pub items: usize,
    pub captured_at: DateTime<Utc>,
}

impl DisplayFallback for CheckpointReport {
    fn display(&self) -> String {
        if self.completed == 0 {
            return format!("No completed queries in {}", self.run_dir.display());
        }
        let mut lines = vec![format!(
            "{} completed queries in {}",
            self.completed,
            self.run_dir.display()
        )];
        if self.malformed_lines > 0 {
            lines.push(format!(
                "{} malformed lines skipped",
                self.malformed_lines
            ));
        }
        for query in &self.queries {
            lines.push(format!(
                "{} | score={:.2} | items={} | {} | {}",
                query.id,
                query.score,
                query.items,
                query.captured_at.format("%Y-%m-%d %H:%M:%S"),
                query.text
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct RobotsReport {
    pub url: String,
    pub user_agent: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl DisplayFallback for RobotsReport {
    fn display(&self) -> String {
        let verdict = if self.allowed { "allowed" } else { "disallowed" };
        match &self.rule {
            Some(rule) => format!(
                "{} is {verdict} for '{}' (rule: {rule})",
                self.url, self.user_agent
            ),
            None => format!("{} is {verdict} for '{}'", self.url, self.user_agent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqa_core::{CheckpointLog, JudgeScore, PageArtifacts, ResultItem};
    use tempfile::TempDir;

    fn write_queries(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn record(id: &str, score: f64) -> AuditRecord {
        AuditRecord {
            site: "https://shop.example.com".to_string(),
            query: Query::predefined(id, "wireless headphones"),
            items: vec![ResultItem::new(1, Some("Sony WH-1000XM5".to_string()))],
            page: PageArtifacts::new("https://shop.example.com/s?q=wireless+headphones"),
            judge: JudgeScore {
                score,
                rationale: None,
                model: None,
            },
        }
    }

    fn fixture_config(out_dir: &Path) -> RunConfig {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/audit.toml");
        let mut config = load_run_config(path).unwrap();
        config.paths.out_dir = out_dir.to_string_lossy().into_owned();
        config
    }

    #[test]
    fn json_array_queries_get_sequential_ids() {
        let dir = TempDir::new().unwrap();
        let path = write_queries(
            &dir,
            "queries.json",
            r#"[
                {"text": "wireless headphones"},
                {"id": "socks-01", "text": "wool socks", "language": "en"},
                {"text": "usb-c hub", "origin": "generated"}
            ]"#,
        );
        let queries = load_queries(&path).unwrap();
        assert_eq!(queries.len(), 3);
        assert_eq!(queries[0].id, "q001");
        assert_eq!(queries[1].id, "socks-01");
        assert_eq!(queries[1].language.as_deref(), Some("en"));
        assert_eq!(queries[2].id, "q003");
        assert_eq!(queries[2].origin, QueryOrigin::Generated);
    }

    #[test]
    fn jsonl_queries_report_the_bad_line() {
        let dir = TempDir::new().unwrap();
        let path = write_queries(
            &dir,
            "queries.jsonl",
            "{\"text\": \"wireless headphones\"}\n{\"text\": 42}\n",
        );
        let err = load_queries(&path).unwrap_err();
        match err {
            AppError::QueryFile { message, .. } => assert!(message.starts_with("line 2")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn plain_lines_skip_comments_and_blanks() {
        let dir = TempDir::new().unwrap();
        let path = write_queries(
            &dir,
            "queries.txt",
            "# electronics\nwireless headphones\n\nusb-c hub\n",
        );
        let queries = load_queries(&path).unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].id, "q001");
        assert_eq!(queries[0].text, "wireless headphones");
        assert_eq!(queries[1].id, "q002");
        assert_eq!(queries[1].origin, QueryOrigin::Predefined);
    }

    #[test]
    fn duplicate_query_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_queries(
            &dir,
            "queries.json",
            r#"[{"id": "q1", "text": "socks"}, {"id": "q1", "text": "hats"}]"#,
        );
        let err = load_queries(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate query id 'q1'"));
    }

    #[test]
    fn empty_text_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_queries(&dir, "queries.json", r#"[{"text": "   "}]"#);
        let err = load_queries(&path).unwrap_err();
        assert!(err.to_string().contains("entry 1 has empty text"));
    }

    #[test]
    fn checkpoint_show_summarizes_a_run_dir() {
        let out = TempDir::new().unwrap();
        let paths = RunPaths::create(out.path(), "shop.example.com").unwrap();
        let mut log = CheckpointLog::append_to(&paths.audit_log).unwrap();
        log.append(&record("q001", 0.9)).unwrap();
        log.append(&record("q002", 0.4)).unwrap();
        drop(log);

        let config = fixture_config(out.path());
        let report = checkpoint_show(
            &config,
            &CheckpointShowArgs {
                run_dir: Some(paths.root.clone()),
                site: None,
                records: true,
            },
        )
        .unwrap();

        assert_eq!(report.completed, 2);
        assert_eq!(report.malformed_lines, 0);
        assert_eq!(report.queries[0].id, "q001");
        assert_eq!(report.queries[1].score, 0.4);
        assert_eq!(report.records.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn checkpoint_show_finds_the_latest_run_for_a_site() {
        let out = TempDir::new().unwrap();
        let paths = RunPaths::create(out.path(), "shop.example.com").unwrap();
        let mut log = CheckpointLog::append_to(&paths.audit_log).unwrap();
        log.append(&record("q001", 0.7)).unwrap();
        drop(log);

        let config = fixture_config(out.path());
        let report = checkpoint_show(
            &config,
            &CheckpointShowArgs {
                run_dir: None,
                site: Some("https://shop.example.com".to_string()),
                records: false,
            },
        )
        .unwrap();
        assert_eq!(report.run_dir, paths.root);
        assert_eq!(report.completed, 1);
        assert!(report.records.is_none());
    }

    #[test]
    fn checkpoint_show_without_prior_runs_errors() {
        let out = TempDir::new().unwrap();
        let config = fixture_config(out.path());
        let err = checkpoint_show(
            &config,
            &CheckpointShowArgs {
                run_dir: None,
                site: Some("fresh.example.com".to_string()),
                records: false,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("no prior run"));
    }
}
