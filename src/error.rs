//! Error types for the deployment core
//!
//! Two families live here:
//! - [`DeployError`]: library errors raised while loading configuration, constructing
//!   actions, splitting tasks or talking to remote hosts.
//! - [`ActionError`]: the operator-facing structured error that crosses the executor
//!   boundary. It is data (reason, detail, fix hint), not a control-flow error.

use crate::action::ActionType;
use crate::models::Status;
use crate::task::TaskType;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Deployment core error types
#[derive(Error, Debug)]
pub enum DeployError {
    /// Task passed to a processor was missing
    #[error("task is empty")]
    EmptyTask,

    /// Task routed to the processor of another task type
    #[error("task type mismatched: expected {expected}, got {actual}")]
    TaskTypeMismatch { expected: TaskType, actual: TaskType },

    /// Task carries no per-node configuration
    #[error("task '{task}' has no node configs")]
    EmptyNodeConfigs { task: String },

    /// Action config was missing
    #[error("action config is missing")]
    MissingActionConfig,

    /// A node reference in an action config was missing
    #[error("{role} node in config is missing")]
    MissingNode { role: &'static str },

    /// Check item handed to a new action after it already ran
    #[error("check item {protocol} {port} is already {status}, renew the task before running it again")]
    CheckItemNotPending {
        protocol: String,
        port: u16,
        status: Status,
    },

    /// Illegal status transition
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Cluster file validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// Cluster YAML size exceeded limit
    #[error("Cluster YAML exceeds 1MB limit (size: {0} bytes)")]
    YamlSizeExceeded(usize),

    /// Settings loading errors
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Remote session could not be established
    #[error("failed to connect to {host}: {message}")]
    Connect { host: String, message: String },

    /// Remote command or channel errors
    #[error("remote error on {host}: {message}")]
    Remote { host: String, message: String },

    /// Remote command exited with a non-zero status
    #[error("command on {host} exited with status {exit_code}")]
    CommandFailed {
        host: String,
        exit_code: i32,
        output: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type alias using DeployError
pub type Result<T> = std::result::Result<T, DeployError>;

/// Operator-facing error attached to an action or a single check item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    /// Short category
    pub reason: String,
    /// Free-text diagnostic
    pub detail: String,
    /// Remediation hint shown to the operator
    pub fix_methods: String,
    /// Correlates the error with an action log
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
}

impl ActionError {
    pub fn new(
        reason: impl Into<String>,
        detail: impl Into<String>,
        fix_methods: impl Into<String>,
    ) -> Self {
        Self {
            reason: reason.into(),
            detail: detail.into(),
            fix_methods: fix_methods.into(),
            log_id: None,
        }
    }

    pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
        self.log_id = Some(log_id.into());
        self
    }

    /// Fold several item errors into one action-level error.
    ///
    /// A single error is returned untouched. Otherwise details are joined and the
    /// reason is kept only when every error shares it.
    pub fn aggregate(errors: &[ActionError]) -> Option<ActionError> {
        match errors {
            [] => None,
            [only] => Some(only.clone()),
            [first, rest @ ..] => {
                let reason = if rest.iter().all(|e| e.reason == first.reason) {
                    first.reason.clone()
                } else {
                    format!("{} checks failed", errors.len())
                };
                let detail = errors
                    .iter()
                    .map(|e| e.detail.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                let mut fixes: Vec<&str> = Vec::new();
                for e in errors {
                    if !fixes.contains(&e.fix_methods.as_str()) {
                        fixes.push(&e.fix_methods);
                    }
                }
                Some(ActionError::new(reason, detail, fixes.join("; ")))
            }
        }
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (fix: {})", self.reason, self.detail, self.fix_methods)
    }
}

impl std::error::Error for ActionError {}

/// Failure modes of dispatching an action to its executor
#[derive(Error, Debug)]
pub enum ExecuteError {
    /// No executor registered for the action type
    #[error("no executor registered for action type {0}")]
    NoExecutor(ActionType),

    /// Action routed to an executor that cannot run its shape
    #[error("action type mismatched: {executor} executor cannot run {actual} action")]
    TypeMismatch {
        executor: ActionType,
        actual: ActionType,
    },

    /// Action already left Pending; it is never executed twice
    #[error("action cannot be dispatched in status {0}")]
    InvalidState(Status),

    /// The action ran and failed
    #[error("{0}")]
    Failed(ActionError),
}

impl ExecuteError {
    /// The structured error for a runtime failure, if this is one
    pub fn action_error(&self) -> Option<&ActionError> {
        match self {
            ExecuteError::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ActionError> for ExecuteError {
    fn from(err: ActionError) -> Self {
        ExecuteError::Failed(err)
    }
}
