use std::path::PathBuf;
use thiserror::Error;

/// Faults raised while turning a virtual path into a physical one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("virtual path is empty")]
    Empty,

    #[error("virtual path {0:?} does not start with [GAME], [MOD] or [INTEGRATION]")]
    UnknownRoot(String),

    #[error("virtual path {0:?} escapes its root directory")]
    EscapesRoot(String),

    #[error("virtual path {0:?} refers to a mod but no mod is being installed")]
    MissingModContext(String),

    #[error("virtual path {0:?} refers to an integration but no integration is loaded")]
    MissingIntegrationContext(String),
}

/// Faults raised by the byte offset writer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("invalid range {start}..{end} for {path:?}")]
    InvalidRange { path: PathBuf, start: i64, end: i64 },

    #[error("write {start}..{end} is out of bounds for {path:?} ({len} bytes)")]
    OutOfBounds {
        path: PathBuf,
        start: i64,
        end: i64,
        len: i64,
    },
}

/// Orchestrator faults that are not plain I/O failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("required resource is missing: {0:?}")]
    MissingResource(PathBuf),

    #[error("invalid file filter {pattern:?}: {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{tool} failed on {file:?}: {message}")]
    ToolFailed {
        tool: String,
        file: PathBuf,
        message: String,
    },

    #[error("progress overflow: {completed} of {total} steps")]
    ProgressOverflow { completed: usize, total: usize },

    #[error("patch does not apply: {0}")]
    PatchMismatch(String),
}
