// SPDX-License-Identifier: MIT

//! Pipeline loader - YAML file loading and parsing

use super::types::PipelineDefinition;
use crate::backend::error::{CasefileError, PipelineError};
use std::fs;
use std::path::Path;

const BUILTIN_PIPELINE: &str = include_str!("../../../pipelines/fir_analysis.yaml");

/// Loads pipeline definitions from YAML files
pub struct PipelineLoader;

impl PipelineLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a pipeline definition from a YAML file
    pub fn load_pipeline<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<PipelineDefinition, CasefileError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PipelineError::FileNotFound(path.display().to_string()).into());
        }
        let content = fs::read_to_string(path)?;
        Self::parse_yaml(&content)
    }

    /// The FIR analysis pipeline shipped with the binary
    pub fn builtin(&self) -> Result<PipelineDefinition, CasefileError> {
        Self::parse_yaml(BUILTIN_PIPELINE)
    }

    /// Parse a pipeline definition from a YAML string
    pub fn parse_yaml(content: &str) -> Result<PipelineDefinition, CasefileError> {
        let def: PipelineDefinition = serde_yaml::from_str(content)?;
        Ok(def)
    }
}

impl Default for PipelineLoader {
    fn default() -> Self {
        Self::new()
    }
}
