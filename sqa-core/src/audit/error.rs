use thiserror::Error;

use crate::browser::BrowserError;
use crate::checkpoint::CheckpointError;
use crate::compliance::ComplianceError;

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Compliance check failed: {0}")]
    Compliance(#[from] ComplianceError),
    #[error("Browser failure: {0}")]
    Browser(#[from] BrowserError),
    #[error("Judge failure: {0}")]
    Judge(String),
    #[error("Checkpoint failure: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Invalid site URL: {0}")]
    Site(String),
}
