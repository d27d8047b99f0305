use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// A single rejected field in a schedule or flag definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

/// All issues found while validating one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub Vec<ValidationIssue>);

impl ValidationErrors {
    pub fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationIssue {
            path: path.into(),
            message: message.into(),
        });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.0.iter()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|issue| format!("{}: {}", issue.path, issue.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("cascade from flag {flag_id} failed: {source}")]
    Cascade {
        flag_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_display_joins_issues() {
        let mut errors = ValidationErrors::default();
        errors.push("scheduledAt", "Scheduled time must be in the future");
        errors.push("rolloutSteps", "Rollout steps allowed only for update_rollout type");

        let err = errors.into_result().unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation failed: scheduledAt: Scheduled time must be in the future; \
             rolloutSteps: Rollout steps allowed only for update_rollout type"
        );
    }

    #[test]
    fn test_empty_validation_errors_is_ok() {
        assert!(ValidationErrors::default().into_result().is_ok());
    }
}
