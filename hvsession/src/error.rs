use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain error codes reported by session operations and handlers.
///
/// The numeric values are stable and are what progress consumers receive in
/// `Progress::fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CreateError,
    ExternalError,
    QueryError,
    DeleteError,
    NotFound,
    NotValidated,
    ControlError,
    InvalidState,
    NotImplemented,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::CreateError => -1,
            ErrorCode::ExternalError => -2,
            ErrorCode::QueryError => -3,
            ErrorCode::DeleteError => -4,
            ErrorCode::NotFound => -5,
            ErrorCode::NotValidated => -6,
            ErrorCode::ControlError => -7,
            ErrorCode::InvalidState => -8,
            ErrorCode::NotImplemented => -9,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::CreateError => "create error",
            ErrorCode::ExternalError => "external tool error",
            ErrorCode::QueryError => "query error",
            ErrorCode::DeleteError => "delete error",
            ErrorCode::NotFound => "not found",
            ErrorCode::NotValidated => "not validated",
            ErrorCode::ControlError => "control error",
            ErrorCode::InvalidState => "invalid state",
            ErrorCode::NotImplemented => "not implemented",
        };
        f.write_str(name)
    }
}

/// Error produced by a session handler or operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} ({code})")]
pub struct SessionError {
    pub code: ErrorCode,
    pub message: String,
}

impl SessionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn create(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CreateError, message)
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExternalError, message)
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::QueryError, message)
    }

    pub fn control(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ControlError, message)
    }
}

/// Construction-time errors for a state graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {node} declared more than once")]
    DuplicateNode { node: String },

    #[error("node {node} references undeclared child {child}")]
    UnknownChild { node: String, child: String },

    #[error("root node {root} is not declared")]
    UnknownRoot { root: String },
}

/// Outcome of a session operation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Completed synchronously.
    Ok,
    /// Accepted; the worker carries it out in the background.
    Scheduled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct() {
        let all = [
            ErrorCode::CreateError,
            ErrorCode::ExternalError,
            ErrorCode::QueryError,
            ErrorCode::DeleteError,
            ErrorCode::NotFound,
            ErrorCode::NotValidated,
            ErrorCode::ControlError,
            ErrorCode::InvalidState,
            ErrorCode::NotImplemented,
        ];
        let mut codes: Vec<i32> = all.iter().map(|c| c.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert!(codes.iter().all(|c| *c < 0));
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::control("unable to pause VM");
        assert_eq!(err.to_string(), "unable to pause VM (control error)");
    }
}
