// SPDX-License-Identifier: MIT

//! YAML schema types for pipeline definitions
//!
//! A pipeline file declares every task the orchestrator knows about: what
//! each one reads, what it writes, which tasks must finish before it, and
//! how it is realised (prompt, schema, retrieval or search step).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::backend::search::SearchOptions;

/// Top-level pipeline definition
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Tasks added to every request
    #[serde(default)]
    pub fixed: Vec<String>,
    pub tasks: Vec<TaskDefinition>,
}

/// One task in a pipeline
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TaskDefinition {
    /// Unique task name
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// State fields that must be present before the task runs
    #[serde(default)]
    pub requires: Vec<String>,
    /// State fields the task writes
    #[serde(default)]
    pub produces: Vec<String>,
    /// Tasks that must complete before this one starts
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(default)]
    pub kind: TaskKind,
    /// System instructions for the model
    #[serde(default)]
    pub instructions: Option<String>,
    /// Prompt template; `{{field}}` is replaced with the rendered field
    #[serde(default)]
    pub prompt: Option<String>,
    /// JSON Schema for structured output
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
    /// Maps state fields to dot paths in the model result
    #[serde(default)]
    pub outputs: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub retrieval: Option<RetrievalStep>,
    #[serde(default)]
    pub search: Option<SearchOptions>,
}

/// How a task is realised
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Prompt + schema generation, optionally retrieval-augmented
    #[default]
    Structured,
    /// Typed fact sheet extraction from the source document
    FactExtraction,
    /// Precedent search and summarisation
    CaseSearch,
}

/// Retrieval run before generation; results are exposed to the prompt as
/// `{{context}}`
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RetrievalStep {
    /// Index name under the index directory
    pub index: String,
    #[serde(default = "default_k")]
    pub k: usize,
    /// Query template, same placeholder syntax as the prompt
    pub query: String,
}

fn default_k() -> usize {
    5
}

/// Dependency specification (single string or array)
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(untagged)]
pub enum DependsOn {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl DependsOn {
    /// Convert to a vector of task names
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            DependsOn::None => vec![],
            DependsOn::Single(s) => vec![s.clone()],
            DependsOn::Multiple(v) => v.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            DependsOn::None => true,
            DependsOn::Single(_) => false,
            DependsOn::Multiple(v) => v.is_empty(),
        }
    }
}
