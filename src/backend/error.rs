// SPDX-License-Identifier: MIT

//! Typed error handling for casefile-rs
//!
//! The hierarchy mirrors the layers of the crate:
//! - [`CasefileError`] is what the binary and the HTTP surface see
//! - [`PipelineError`] covers definition problems and scheduler failures
//! - [`BackendError`] covers the remote collaborators (LLM, search, indices)
//! - [`TaskError`] is what a single task returns to the scheduler

use thiserror::Error;

/// Top-level error type for casefile-rs
#[derive(Debug, Error)]
pub enum CasefileError {
    /// API errors from external services (OpenAI, case search, etc.)
    #[error("API error from {provider}: {message}")]
    Api { provider: String, message: String },

    /// Configuration errors (missing env vars, invalid settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pipeline definition or scheduling errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors raised by a remote collaborator outside of a task
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Generic error wrapper
    #[error("{0}")]
    Other(String),
}

/// Pipeline definition and scheduler errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A requested or referenced task is not in the table
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Two definitions share a name
    #[error("Task '{0}' is defined more than once")]
    DuplicateTask(String),

    /// A task names a prerequisite that does not exist
    #[error("Task '{task}' depends on unknown task '{prerequisite}'")]
    UnknownPrerequisite { task: String, prerequisite: String },

    /// Circular dependency detected between tasks
    #[error("Circular dependency detected: {0:?}")]
    CircularDependency(Vec<String>),

    /// Two tasks claim the same output field
    #[error("Field '{field}' is produced by both '{first}' and '{second}'")]
    FieldProducedTwice {
        field: String,
        first: String,
        second: String,
    },

    /// A job is already running against this session
    #[error("Session '{0}' already has a run in flight")]
    SessionBusy(String),

    /// No checkpoint exists for this session
    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    /// A first request for a session arrived without a source document
    #[error("Session '{0}' has no source document; upload one first")]
    MissingDocument(String),

    /// Checkpoint store unavailable or corrupt
    #[error("Checkpoint store failure: {0}")]
    Checkpoint(String),

    /// A wave failed while running in fail-fast mode
    #[error("Wave {wave} failed: task '{task}': {reason}")]
    WaveFailed {
        wave: usize,
        task: String,
        reason: String,
    },

    /// Pipeline file not found
    #[error("Pipeline file not found: {0}")]
    FileNotFound(String),
}

/// Errors from the remote collaborators
#[derive(Debug, Error)]
pub enum BackendError {
    /// API key not configured
    #[error("API key not configured for provider: {0}")]
    ApiKeyMissing(String),

    /// Non-success response from a provider
    #[error("API error from {provider}: {message}")]
    Api { provider: String, message: String },

    /// Response did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Retrieval index does not exist on disk
    #[error("Retrieval index '{0}' not found")]
    IndexNotFound(String),

    /// Document could not be turned into text
    #[error("Unreadable document '{0}'")]
    UnreadableDocument(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors a task reports back to the scheduler
#[derive(Debug, Error)]
pub enum TaskError {
    /// A remote call kept failing until the attempt cap was reached
    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: BackendError },

    /// A remote call failed in a way the task could not recover from
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The model returned something that does not fit the declared outputs
    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    /// A field the task reads is absent from its input view
    #[error("Missing input field: {0}")]
    MissingInput(String),
}

impl CasefileError {
    /// Create an API error
    pub fn api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create from a generic error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

impl BackendError {
    pub fn api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

impl From<&str> for CasefileError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}

impl From<String> for CasefileError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_converts_to_top_level() {
        let err: CasefileError = PipelineError::UnknownTask("ghost".to_string()).into();
        assert_eq!(err.to_string(), "Pipeline error: Unknown task: ghost");
    }

    #[test]
    fn test_retry_exhausted_message_carries_last_error() {
        let err = TaskError::RetryExhausted {
            attempts: 6,
            last: BackendError::api("openai", "503 Service Unavailable"),
        };
        assert_eq!(
            err.to_string(),
            "gave up after 6 attempts: API error from openai: 503 Service Unavailable"
        );
    }

    #[test]
    fn test_circular_dependency_lists_cycle() {
        let err = PipelineError::CircularDependency(vec!["a".into(), "b".into(), "a".into()]);
        assert!(err.to_string().contains("[\"a\", \"b\", \"a\"]"));
    }
}
