//! Typed errors for broken setup.
//!
//! Everything else travels as `anyhow::Error`. Precondition errors are
//! returned immediately and never retried; callers tell them apart with
//! [`is_precondition`].

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("unknown check '{0}'")]
    UnknownCheck(String),
    #[error("unknown stage '{0}'")]
    UnknownStage(String),
    #[error("duplicate stage id '{0}'")]
    DuplicateStage(String),
    #[error("stage '{stage}' routes failures to unknown stage '{target}'")]
    InvalidOnFailTarget { stage: String, target: String },
    #[error("stage '{stage}' has invalid on_fail: {reason}")]
    InvalidOnFail { stage: String, reason: String },
    #[error("stage '{stage}' has invalid context mode '{mode}' (expected full, summary, or none)")]
    InvalidContextMode { stage: String, mode: String },
    #[error("check '{check}' has unknown parser '{parser}'")]
    UnknownParser { check: String, parser: String },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid issue id '{0}'")]
    InvalidIssueId(String),
    #[error("no pipeline for issue '{0}'")]
    PipelineNotFound(String),
    #[error("pipeline for issue '{0}' already exists")]
    PipelineExists(String),
    #[error("pipeline for issue '{issue}' is already {status}")]
    PipelineTerminal { issue: String, status: String },
    #[error("an advance is already running for issue '{0}'")]
    AdvanceInProgress(String),
}

/// The pipeline left the stage attempt a run was working on, or became
/// terminal, while the run was in flight.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("pipeline {issue} moved to {status} at {stage} #{attempt} during the run")]
pub struct Superseded {
    pub issue: String,
    pub status: String,
    pub stage: String,
    pub attempt: u32,
}

/// True if `err` (or anything it wraps) is a [`PreconditionError`].
pub fn is_precondition(err: &anyhow::Error) -> bool {
    err.downcast_ref::<PreconditionError>().is_some()
}
