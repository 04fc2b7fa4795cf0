//! Structured command reports
//!
//! Every command returns a [`CommandReport`], on success and on failure.
//! `success` is the authoritative outcome; callers must not infer it from
//! the process exit status alone.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vigil_core::{ErrorKind, Result, Timestamp, VigilError};

/// Machine-readable error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Error category
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
    /// Structured fields of the error (sequence, digests, token cause)
    pub details: Value,
}

impl From<&VigilError> for ErrorReport {
    fn from(error: &VigilError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            details: serde_json::to_value(error).unwrap_or(Value::Null),
        }
    }
}

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReport {
    /// Command name as invoked
    pub command: String,
    /// Whether the command achieved its purpose
    pub success: bool,
    /// Completion time
    pub finished_at: Timestamp,
    /// Command-specific result, `null` when there is none
    pub data: Value,
    /// Failure detail when `success` is false
    pub error: Option<ErrorReport>,
}

impl CommandReport {
    /// Report for a finished command
    ///
    /// `problem` marks a command that ran to completion but found something
    /// wrong (a divergent ledger, a rejected snapshot); `data` is kept.
    pub fn completed<T: Serialize>(
        command: &str,
        finished_at: Timestamp,
        data: &T,
        problem: Option<VigilError>,
    ) -> Self {
        let (data, problem) = match serde_json::to_value(data) {
            Ok(value) => (value, problem),
            Err(e) => (Value::Null, Some(VigilError::from(e))),
        };
        Self {
            command: command.to_owned(),
            success: problem.is_none(),
            finished_at,
            data,
            error: problem.as_ref().map(ErrorReport::from),
        }
    }

    /// Report for a command that failed outright
    pub fn failed(command: &str, finished_at: Timestamp, error: &VigilError) -> Self {
        Self {
            command: command.to_owned(),
            success: false,
            finished_at,
            data: Value::Null,
            error: Some(ErrorReport::from(error)),
        }
    }

    /// Report from a command result
    pub fn from_result<T: Serialize>(
        command: &str,
        finished_at: Timestamp,
        result: Result<T>,
    ) -> Self {
        match result {
            Ok(data) => Self::completed(command, finished_at, &data, None),
            Err(e) => Self::failed(command, finished_at, &e),
        }
    }

    /// Error kind, if the command failed
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Pretty JSON for printing
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
