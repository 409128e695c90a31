//! Error types for the lab manager

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Command `{command}` failed (exit code {code:?})")]
    RuntimeCommand {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {elapsed:?}")]
    Timeout { command: String, elapsed: Duration },

    #[error("Roster {0} contains no students")]
    EmptyRoster(String),

    #[error("Student not found in roster: {0}")]
    StudentNotFound(String),

    #[error("Student {0} has no resolved port/subnet assignment")]
    Unresolved(String),

    #[error("Invalid container type: {0} (valid types: kali, ubuntu1, ubuntu2)")]
    InvalidContainerKind(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this is a failure of the container runtime itself
    /// (non-zero exit or timeout), as opposed to bad input.
    pub fn is_runtime_failure(&self) -> bool {
        matches!(self, Error::RuntimeCommand { .. } | Error::Timeout { .. })
    }
}
