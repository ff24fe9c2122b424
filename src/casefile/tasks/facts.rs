// SPDX-License-Identifier: MIT

//! Fixed first stage: structured facts from the FIR

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::{render_template, schema_of};
use crate::backend::error::TaskError;
use crate::backend::model::{GenerationBackend, GenerationConfig, GenerationRequest};
use crate::backend::retry::RetryPolicy;
use crate::casefile::workflow::state::{StateUpdate, StateView};
use crate::casefile::workflow::task::TaskUnit;
use crate::casefile::workflow::types::TaskDefinition;

const DEFAULT_INSTRUCTIONS: &str = "You are a legal analyst reading a First Information Report \
under the NDPS Act. Extract only what the document states. Write 'Not mentioned' for anything \
the report does not cover.";

const DEFAULT_PROMPT: &str = "Extract the facts of this FIR.\n\n{{document_text}}";

/// Facts every downstream analysis relies on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FactSheet {
    /// Date, time and place of the occurrence
    #[serde(default)]
    pub date_time_location: String,
    /// How and when the accused were detained
    #[serde(default)]
    pub initial_detention: String,
    #[serde(default)]
    pub identity_of_accused: String,
    /// Orders given and how the accused were moved
    #[serde(default)]
    pub police_order_and_transport: String,
    /// Whether a gazetted officer or magistrate was present
    #[serde(default)]
    pub presence_of_required_officer: String,
    #[serde(default)]
    pub search_and_seizure: String,
    #[serde(default)]
    pub weighment_and_packaging: String,
    /// Sampling, sealing and other procedural steps
    #[serde(default)]
    pub procedural_notes: String,
    #[serde(default)]
    pub statement_of_accused: String,
    /// Sections invoked in the FIR
    #[serde(default)]
    pub offences_charged: Vec<String>,
}

pub struct FactExtractionTask {
    definition: TaskDefinition,
    generation: Arc<dyn GenerationBackend>,
    retry: RetryPolicy,
    config: GenerationConfig,
}

impl FactExtractionTask {
    pub fn new(
        definition: TaskDefinition,
        generation: Arc<dyn GenerationBackend>,
        retry: RetryPolicy,
        config: GenerationConfig,
    ) -> Self {
        Self {
            definition,
            generation,
            retry,
            config,
        }
    }
}

#[async_trait]
impl TaskUnit for FactExtractionTask {
    fn name(&self) -> &str {
        &self.definition.name
    }

    async fn run(&self, input: &StateView) -> Result<StateUpdate, TaskError> {
        let field = self
            .definition
            .produces
            .first()
            .ok_or_else(|| TaskError::MalformedOutput("no output field declared".into()))?;

        let template = self.definition.prompt.as_deref().unwrap_or(DEFAULT_PROMPT);
        let prompt = render_template(template, input, &HashMap::new())?;
        let instructions = self
            .definition
            .instructions
            .as_deref()
            .unwrap_or(DEFAULT_INSTRUCTIONS);

        let request = GenerationRequest::new(prompt)
            .with_instructions(instructions)
            .with_schema("fact_sheet", schema_of::<FactSheet>())
            .with_config(self.config.clone());

        let label = format!("{} generation", self.definition.name);
        let result = self
            .retry
            .execute(&label, || self.generation.generate(&request))
            .await?;

        let facts: FactSheet = serde_json::from_value(result)
            .map_err(|e| TaskError::MalformedOutput(format!("fact sheet: {}", e)))?;
        let value = serde_json::to_value(&facts)
            .map_err(|e| TaskError::MalformedOutput(format!("fact sheet: {}", e)))?;

        Ok(StateUpdate::from([(field.clone(), value)]))
    }
}
