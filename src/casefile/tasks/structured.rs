// SPDX-License-Identifier: MIT

//! Prompt + schema generation task, optionally retrieval-augmented

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::{default_prompt, render_template};
use crate::backend::error::{BackendError, TaskError};
use crate::backend::model::{GenerationBackend, GenerationConfig, GenerationRequest};
use crate::backend::render::extract_json_path;
use crate::backend::retrieval::RetrievalBackend;
use crate::backend::retry::RetryPolicy;
use crate::casefile::workflow::state::{StateUpdate, StateView};
use crate::casefile::workflow::task::TaskUnit;
use crate::casefile::workflow::types::TaskDefinition;

pub struct StructuredTask {
    definition: TaskDefinition,
    generation: Arc<dyn GenerationBackend>,
    retrieval: Option<Arc<dyn RetrievalBackend>>,
    retry: RetryPolicy,
    config: GenerationConfig,
}

impl StructuredTask {
    pub fn new(
        definition: TaskDefinition,
        generation: Arc<dyn GenerationBackend>,
        retrieval: Option<Arc<dyn RetrievalBackend>>,
        retry: RetryPolicy,
        config: GenerationConfig,
    ) -> Self {
        Self {
            definition,
            generation,
            retrieval,
            retry,
            config,
        }
    }

    /// Retrieved passages joined for `{{context}}`, if the task has a retrieval step
    async fn context(&self, input: &StateView) -> Result<Option<String>, TaskError> {
        let Some(step) = &self.definition.retrieval else {
            return Ok(None);
        };
        let backend = self
            .retrieval
            .as_ref()
            .ok_or_else(|| BackendError::IndexNotFound(step.index.clone()))?;

        let query = render_template(&step.query, input, &HashMap::new())?;
        let label = format!("{} retrieval", self.definition.name);
        let chunks = self
            .retry
            .execute(&label, || backend.search(&step.index, &query, step.k))
            .await?;

        log::debug!(
            "Task {} retrieved {} chunks from {}",
            self.definition.name,
            chunks.len(),
            step.index
        );

        Ok(Some(
            chunks
                .into_iter()
                .map(|c| c.content)
                .collect::<Vec<_>>()
                .join("\n\n---\n\n"),
        ))
    }

    fn build_request(&self, prompt: String) -> GenerationRequest {
        let mut request = GenerationRequest::new(prompt).with_config(self.config.clone());
        if let Some(instructions) = &self.definition.instructions {
            request = request.with_instructions(instructions.clone());
        }
        if let Some(schema) = &self.definition.output_schema {
            request = request.with_schema(self.definition.name.clone(), schema.clone());
        }
        request
    }
}

/// Map a model result onto the declared output fields
pub fn map_outputs(definition: &TaskDefinition, result: Value) -> Result<StateUpdate, TaskError> {
    let produces = &definition.produces;

    if let Some(outputs) = &definition.outputs {
        return produces
            .iter()
            .map(|field| {
                let path = outputs.get(field).map(String::as_str).unwrap_or(field);
                extract_json_path(&result, path)
                    .map(|v| (field.clone(), v))
                    .ok_or_else(|| TaskError::MalformedOutput(format!("result has no '{}'", path)))
            })
            .collect();
    }

    match produces.as_slice() {
        [field] => {
            let value = match result.get(field) {
                Some(v) => v.clone(),
                None => result,
            };
            Ok(StateUpdate::from([(field.clone(), value)]))
        }
        fields => fields
            .iter()
            .map(|field| {
                result
                    .get(field)
                    .cloned()
                    .map(|v| (field.clone(), v))
                    .ok_or_else(|| TaskError::MalformedOutput(format!("result has no '{}'", field)))
            })
            .collect(),
    }
}

#[async_trait]
impl TaskUnit for StructuredTask {
    fn name(&self) -> &str {
        &self.definition.name
    }

    async fn run(&self, input: &StateView) -> Result<StateUpdate, TaskError> {
        let mut extra = HashMap::new();
        if let Some(context) = self.context(input).await? {
            extra.insert("context", context);
        }

        let prompt = match &self.definition.prompt {
            Some(template) => render_template(template, input, &extra)?,
            None => default_prompt(input),
        };
        let request = self.build_request(prompt);

        let label = format!("{} generation", self.definition.name);
        let result = self
            .retry
            .execute(&label, || self.generation.generate(&request))
            .await?;

        map_outputs(&self.definition, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::retrieval::RetrievedChunk;
    use crate::casefile::workflow::types::RetrievalStep;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedModel {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        response: Value,
        last_prompt: Mutex<Option<String>>,
    }

    impl ScriptedModel {
        fn new(failures: usize, response: Value) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                response,
                last_prompt: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedModel {
        async fn generate(&self, request: &GenerationRequest) -> Result<Value, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = Some(request.prompt.clone());
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BackendError::api("mock", "rate limited"));
            }
            Ok(self.response.clone())
        }
    }

    struct StaticIndex;

    #[async_trait]
    impl RetrievalBackend for StaticIndex {
        async fn search(
            &self,
            index: &str,
            _query: &str,
            k: usize,
        ) -> Result<Vec<RetrievedChunk>, BackendError> {
            Ok((0..k)
                .map(|i| RetrievedChunk {
                    content: format!("{} section {}", index, i),
                    score: 1.0,
                    metadata: Value::Null,
                })
                .collect())
        }
    }

    fn definition(yaml: &str) -> TaskDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(10)).with_base_wait(Duration::from_millis(1))
    }

    fn input() -> StateView {
        StateView::from_iter([("document_text", json!("Ganja 2kg recovered"))])
    }

    #[tokio::test]
    async fn test_single_field_takes_whole_result() {
        let model = Arc::new(ScriptedModel::new(0, json!({"entries": ["day 1"]})));
        let task = StructuredTask::new(
            definition(
                "name: timeline\nrequires: [document_text]\nproduces: [investigation_and_legal_timeline]\nprompt: \"FIR: {{document_text}}\"",
            ),
            model.clone(),
            None,
            fast_retry(),
            GenerationConfig::default(),
        );

        let update = task.run(&input()).await.unwrap();
        assert_eq!(
            update["investigation_and_legal_timeline"],
            json!({"entries": ["day 1"]})
        );
        assert_eq!(
            model.last_prompt.lock().unwrap().as_deref(),
            Some("FIR: Ganja 2kg recovered")
        );
    }

    #[tokio::test]
    async fn test_multiple_fields_and_missing_field() {
        let def = definition("name: dos_and_donts\nproduces: [dos, donts]");
        let update = map_outputs(&def, json!({"dos": ["a"], "donts": ["b"], "extra": 1})).unwrap();
        assert_eq!(update.len(), 2);
        assert_eq!(update["donts"], json!(["b"]));

        let err = map_outputs(&def, json!({"dos": ["a"]})).unwrap_err();
        assert!(matches!(err, TaskError::MalformedOutput(_)));
    }

    #[tokio::test]
    async fn test_output_paths() {
        let def = definition(
            "name: investigation_plan\nproduces: [investigation_plan]\noutputs:\n  investigation_plan: plan.points",
        );
        let update = map_outputs(&def, json!({"plan": {"points": [1, 2]}})).unwrap();
        assert_eq!(update["investigation_plan"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_retrieval_context_and_retries() {
        let model = Arc::new(ScriptedModel::new(2, json!({"sections": ["20(b)"]})));
        let mut def = definition(
            "name: ndps_mapping\nrequires: [document_text]\nproduces: [ndps_sections_mapped]\nprompt: \"{{context}}\"\noutputs:\n  ndps_sections_mapped: sections",
        );
        def.retrieval = Some(RetrievalStep {
            index: "ndps".into(),
            k: 2,
            query: "{{document_text}}".into(),
        });
        let task = StructuredTask::new(
            def,
            model.clone(),
            Some(Arc::new(StaticIndex)),
            fast_retry(),
            GenerationConfig::default(),
        );

        let update = task.run(&input()).await.unwrap();
        assert_eq!(update["ndps_sections_mapped"], json!(["20(b)"]));
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            model.last_prompt.lock().unwrap().as_deref(),
            Some("ndps section 0\n\n---\n\nndps section 1")
        );
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let model = Arc::new(ScriptedModel::new(10, json!({})));
        let task = StructuredTask::new(
            definition("name: weaknesses\nproduces: [potential_prosecution_weaknesses]"),
            model.clone(),
            None,
            fast_retry(),
            GenerationConfig::default(),
        );

        let err = task.run(&input()).await.unwrap_err();
        assert!(matches!(err, TaskError::RetryExhausted { attempts: 3, .. }));
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retrieval_without_backend() {
        let mut def = definition("name: bns_mapping\nproduces: [bns_sections_mapped]");
        def.retrieval = Some(RetrievalStep {
            index: "bns".into(),
            k: 3,
            query: "q".into(),
        });
        let task = StructuredTask::new(
            def,
            Arc::new(ScriptedModel::new(0, json!({}))),
            None,
            fast_retry(),
            GenerationConfig::default(),
        );

        let err = task.run(&input()).await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::Backend(BackendError::IndexNotFound(name)) if name == "bns"
        ));
    }
}
