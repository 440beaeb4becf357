//! Error taxonomy for parameter binding, backend execution, registry
//! reloads and engine runs.
//!
//! Every failure the agent can report maps onto exactly one
//! [`ExecutionError`] variant, and from there onto one HTTP status.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::backend::BackendKind;

/// Failure while substituting parameters into a template
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("missing parameter `{0}`")]
    MissingParameter(String),
    #[error("malformed template at byte {position}: {reason}")]
    Malformed { position: usize, reason: String },
}

/// Failure while turning a command spec and parameters into a resolved command
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("invalid header `{name}`: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("unsupported HTTP method `{0}`")]
    InvalidMethod(String),
}

/// Backend-specific execution fault
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("operation exceeded {0:?}")]
    Timeout(Duration),
    #[error("failed to start process: {0}")]
    SpawnFailed(String),
    #[error("command exited with status {exit_code}: {stderr}")]
    ExecutionFailed { exit_code: i32, stderr: String },
    #[error("remote fault (HTTP {status}): {fault}")]
    RemoteFault { status: u16, fault: String },
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("unexpected HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("query failed: {0}")]
    QueryFailed(String),
}

impl BackendError {
    /// Machine-readable sub-kind reported to callers
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Timeout(_) => "timeout",
            BackendError::SpawnFailed(_) => "spawn_failed",
            BackendError::ExecutionFailed { .. } => "execution_failed",
            BackendError::RemoteFault { .. } => "remote_fault",
            BackendError::Unreachable(_) => "unreachable",
            BackendError::HttpStatus { .. } => "http_status",
            BackendError::QueryFailed(_) => "query_failed",
        }
    }
}

/// Registry reload failure. The active snapshot is untouched when one of these is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse command definitions: {0}")]
    Parse(String),
    #[error("duplicate command name `{0}`")]
    DuplicateName(String),
    #[error("invalid command `{name}`: {reason}")]
    InvalidEntry { name: String, reason: String },
    #[error("registry has no configured source file")]
    NoSource,
}

/// Terminal failure state of one execution
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("unknown command `{0}`")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(#[from] BindError),
    #[error("command `{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("{backend} backend failed: {source}")]
    BackendFailure {
        backend: BackendKind,
        #[source]
        source: BackendError,
    },
}

impl ExecutionError {
    /// Machine-readable error kind used in response envelopes
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::NotFound(_) => "not_found",
            ExecutionError::BadRequest(_) => "bad_request",
            ExecutionError::Timeout { .. } => "timeout",
            ExecutionError::BackendFailure { .. } => "backend_failure",
        }
    }
}
