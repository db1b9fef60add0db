//! Top-level error types for toolbridge.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Stable identifier for the failure, reported to HTTP callers next to
    /// the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::Worker(error) => error.kind(),
            Error::Llm(_) => "model_request_error",
            Error::Io(_) => "io_error",
            Error::Other(_) => "internal",
        }
    }

    /// The worker a failure concerns, when it came from the worker layer.
    pub fn worker(&self) -> Option<&str> {
        match self {
            Error::Worker(error) => Some(error.worker()),
            _ => None,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("no config file found (tried {tried})")]
    NotFound { tried: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failures of the process-backed RPC layer.
///
/// Every variant names the worker it concerns so a single message is enough
/// to diagnose a failed call from the HTTP response alone.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to launch worker '{worker}': {message}")]
    Launch { worker: String, message: String },

    #[error("worker '{worker}' not running")]
    NotFound { worker: String },

    #[error("worker '{worker}' sent a response that is not valid JSON: {line}")]
    Protocol { worker: String, line: String },

    #[error("worker '{worker}' error: {message}")]
    Reported { worker: String, message: String },

    #[error("worker '{worker}' exited{}", exit_suffix(*.code))]
    Exited { worker: String, code: Option<i32> },

    #[error("worker '{worker}' timed out after {}ms", .after.as_millis())]
    Timeout {
        worker: String,
        after: std::time::Duration,
    },

    #[error("failed to write request to worker '{worker}': {source}")]
    Write {
        worker: String,
        source: std::io::Error,
    },
}

impl WorkerError {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Launch { .. } => "launch_error",
            WorkerError::NotFound { .. } => "worker_not_found",
            WorkerError::Protocol { .. } => "protocol_error",
            WorkerError::Reported { .. } => "worker_reported_error",
            WorkerError::Exited { .. } => "worker_exited",
            WorkerError::Timeout { .. } => "timeout",
            WorkerError::Write { .. } => "io_error",
        }
    }

    /// Name of the worker the failure concerns.
    pub fn worker(&self) -> &str {
        match self {
            WorkerError::Launch { worker, .. }
            | WorkerError::NotFound { worker }
            | WorkerError::Protocol { worker, .. }
            | WorkerError::Reported { worker, .. }
            | WorkerError::Exited { worker, .. }
            | WorkerError::Timeout { worker, .. }
            | WorkerError::Write { worker, .. } => worker,
        }
    }
}

fn exit_suffix(code: Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {code}"),
        None => String::new(),
    }
}

/// Model endpoint errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("model request failed: {0}")]
    Request(String),

    #[error("model endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unparseable model response: {0}")]
    InvalidResponse(String),

    #[error("model requested unknown tool: {0}")]
    UnknownTool(String),
}
