// SPDX-License-Identifier: MIT

//! Model module - generation and embedding backends
//!
//! Tasks never talk to a provider directly. They build a
//! [`GenerationRequest`] and hand it to a [`GenerationBackend`]; retrieval
//! goes through an [`Embedder`]. Provider implementations live in their own
//! submodules:
//! - [openai] - OpenAI chat completions and embeddings

pub mod openai;

use crate::backend::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Configuration for model generation
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// A single structured generation call
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerationRequest {
    /// System-level instructions
    pub instructions: Option<String>,
    /// Fully rendered user prompt
    pub prompt: String,
    /// JSON Schema the result must satisfy; `None` asks for free text
    pub output_schema: Option<Value>,
    /// Name reported to the provider alongside the schema
    pub schema_name: Option<String>,
    #[serde(default)]
    pub config: GenerationConfig,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_schema(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.schema_name = Some(name.into());
        self.output_schema = Some(schema);
        self
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }
}

/// Produces a structured result for a prompt.
///
/// With an output schema the returned value is the parsed JSON object;
/// without one it is a JSON string holding the model's text.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value, BackendError>;
}

/// Turns text into an embedding vector
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError>;
}
