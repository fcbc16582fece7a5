use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enum for the failure modes of rules evaluation.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertsError {
    /// The evaluation was interrupted by shutdown or group reload.
    #[error("execution cancelled")]
    Cancelled,

    #[error("Invalid configuration. {0}")]
    InvalidConfiguration(String),

    #[error("Invalid rule. {0}")]
    InvalidRule(String),

    #[error("Failed to execute query: {0}")]
    QueryExecutionError(String),

    #[error("Remote write failure: {0}")]
    RemoteWriteError(String),

    #[error("Failed to send alerts: {0}")]
    NotifierError(ErrorGroup),

    #[error("Failure restoring rule: {0}")]
    RuleRestoreError(String),

    #[error("{0}")]
    Generic(String),
}

pub type AlertsResult<T> = Result<T, AlertsError>;

/// Accumulates independent errors without short-circuiting, so one failing
/// collaborator doesn't hide the others.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorGroup(pub Vec<String>);

impl ErrorGroup {
    pub fn new() -> Self {
        ErrorGroup(Vec::new())
    }

    pub fn push(&mut self, err: String) {
        self.0.push(err);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for ErrorGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

impl From<ErrorGroup> for AlertsError {
    fn from(err: ErrorGroup) -> Self {
        AlertsError::Generic(err.0.join(", "))
    }
}
