mod error;
mod orchestrator;
mod pipeline;

pub use error::{AuditError, AuditResult};
pub use orchestrator::{site_host, AuditOrchestrator, CancelFlag, ResumeMode, RunStats};
pub use pipeline::{
    DomExtractor, QueryPipeline, ResultExtractor, ResultJudge, SearchSubmitter, SelectorSubmitter,
    TermOverlapJudge,
};
