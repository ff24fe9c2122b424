// SPDX-License-Identifier: MIT

//! The unit of work the scheduler runs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::{StateUpdate, StateView};
use crate::backend::error::TaskError;

/// One analysis capability.
///
/// A task reads the fields it declared as required and returns only the
/// fields it declared as produced. The scheduler checks both sides; tasks
/// never see or touch the shared state directly.
#[async_trait]
pub trait TaskUnit: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, input: &StateView) -> Result<StateUpdate, TaskError>;
}

/// Why a task has no output in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A remote call failed on every attempt
    RetryExhausted,
    /// A required field was absent, usually because a prerequisite failed
    UnresolvedDependency,
    /// The task failed for any other reason
    TaskFailure,
    /// The wave deadline passed before the task finished
    TimedOut,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::RetryExhausted => "retry_exhausted",
            FailureKind::UnresolvedDependency => "unresolved_dependency",
            FailureKind::TaskFailure => "task_failure",
            FailureKind::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Per-task failure record kept in reports and checkpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task: String,
    pub kind: FailureKind,
    pub reason: String,
}

impl TaskFailure {
    pub fn new(task: impl Into<String>, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            kind,
            reason: reason.into(),
        }
    }

    /// Classify an error returned by a task
    pub fn from_error(task: impl Into<String>, err: &TaskError) -> Self {
        let kind = match err {
            TaskError::RetryExhausted { .. } => FailureKind::RetryExhausted,
            TaskError::MissingInput(_) => FailureKind::UnresolvedDependency,
            TaskError::Backend(_) | TaskError::MalformedOutput(_) => FailureKind::TaskFailure,
        };
        Self::new(task, kind, err.to_string())
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.task, self.kind, self.reason)
    }
}
