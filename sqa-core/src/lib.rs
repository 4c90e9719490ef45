pub mod audit;
pub mod browser;
pub mod challenge;
pub mod checkpoint;
pub mod compliance;
pub mod config;
pub mod error;
pub mod model;
pub mod proxy;
pub mod scroll;

pub use audit::{
    site_host, AuditError, AuditOrchestrator, AuditResult, CancelFlag, DomExtractor,
    QueryPipeline, ResultExtractor, ResultJudge, ResumeMode, RunStats, SearchSubmitter,
    SelectorSubmitter, TermOverlapJudge,
};
pub use browser::{
    build_client, classify, is_retryable, BackendKind, BrowserClient, BrowserError, BrowserResult,
    ErrorKind, WaitCondition,
};
pub use challenge::{ChallengeDetector, ChallengeKind, ChallengeVerdict, PageSnapshot};
pub use checkpoint::{
    completed_ids, latest_run_dir, load_records, CheckpointError, CheckpointLog, FailureContext,
    FailureLog, RemediationAction, RunPaths,
};
pub use compliance::{
    AllowAllPolicy, CompliancePolicy, ComplianceError, ComplianceResult, RobotsChecker,
    RobotsPolicy, RobotsVerdict,
};
pub use config::{load_run_config, RunConfig};
pub use error::{ConfigError, Result};
pub use model::{AuditRecord, JudgeScore, PageArtifacts, Query, QueryOrigin, ResultItem};
pub use proxy::{ProxyRotator, ProxyStrategy};
pub use scroll::{CountVisible, ScrollController, ScrollOutcome};
