// SPDX-License-Identifier: MIT

//! Pipeline builder - turns a definition into a validated table and task units

use crate::backend::error::CasefileError;
use crate::backend::model::{GenerationBackend, GenerationConfig};
use crate::backend::retrieval::RetrievalBackend;
use crate::backend::retry::RetryPolicy;
use crate::backend::search::CaseSearch;
use crate::casefile::tasks::{FactExtractionTask, HistoricalCasesTask, StructuredTask};
use crate::casefile::workflow::graph::TaskTable;
use crate::casefile::workflow::loader::PipelineLoader;
use crate::casefile::workflow::registry::TaskRegistry;
use crate::casefile::workflow::task::TaskUnit;
use crate::casefile::workflow::types::{PipelineDefinition, TaskDefinition, TaskKind};

use std::path::Path;
use std::sync::Arc;

/// Remote collaborators shared by every task
#[derive(Clone)]
pub struct Backends {
    pub generation: Arc<dyn GenerationBackend>,
    pub retrieval: Option<Arc<dyn RetrievalBackend>>,
    pub search: Option<Arc<dyn CaseSearch>>,
    pub retry: RetryPolicy,
    pub generation_config: GenerationConfig,
}

impl Backends {
    pub fn new(generation: Arc<dyn GenerationBackend>) -> Self {
        Self {
            generation,
            retrieval: None,
            search: None,
            retry: RetryPolicy::default(),
            generation_config: GenerationConfig::default(),
        }
    }
}

/// A pipeline ready to hand to the scheduler
pub struct Pipeline {
    pub definition: PipelineDefinition,
    pub table: Arc<TaskTable>,
    pub registry: TaskRegistry,
}

pub struct PipelineBuilder {
    loader: PipelineLoader,
    backends: Backends,
}

impl PipelineBuilder {
    pub fn new(backends: Backends) -> Self {
        Self {
            loader: PipelineLoader::new(),
            backends,
        }
    }

    /// Build from a YAML file
    pub async fn build_file<P: AsRef<Path>>(&self, path: P) -> Result<Pipeline, CasefileError> {
        let def = self.loader.load_pipeline(path)?;
        self.build_from_def(def).await
    }

    /// Build the pipeline shipped with the binary
    pub async fn build_builtin(&self) -> Result<Pipeline, CasefileError> {
        let def = self.loader.builtin()?;
        self.build_from_def(def).await
    }

    pub async fn build_from_def(&self, def: PipelineDefinition) -> Result<Pipeline, CasefileError> {
        let table = TaskTable::from_definition(&def)?;
        let registry = TaskRegistry::new();

        for task_def in &def.tasks {
            registry.register(self.build_task(task_def)?).await;
        }

        log::info!(
            "Built pipeline '{}' with {} tasks ({} fixed)",
            def.name,
            def.tasks.len(),
            def.fixed.len()
        );

        Ok(Pipeline {
            definition: def,
            table: Arc::new(table),
            registry,
        })
    }

    fn build_task(&self, def: &TaskDefinition) -> Result<Arc<dyn TaskUnit>, CasefileError> {
        let b = &self.backends;

        if def.kind != TaskKind::Structured && def.produces.len() != 1 {
            return Err(CasefileError::config(format!(
                "Task '{}' of kind {:?} must produce exactly one field",
                def.name, def.kind
            )));
        }

        let task: Arc<dyn TaskUnit> = match def.kind {
            TaskKind::Structured => Arc::new(StructuredTask::new(
                def.clone(),
                b.generation.clone(),
                b.retrieval.clone(),
                b.retry.clone(),
                b.generation_config.clone(),
            )),
            TaskKind::FactExtraction => Arc::new(FactExtractionTask::new(
                def.clone(),
                b.generation.clone(),
                b.retry.clone(),
                b.generation_config.clone(),
            )),
            TaskKind::CaseSearch => Arc::new(HistoricalCasesTask::new(
                def.clone(),
                b.generation.clone(),
                b.search.clone(),
                b.retry.clone(),
                b.generation_config.clone(),
            )),
        };
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::error::{BackendError, PipelineError};
    use crate::backend::model::GenerationRequest;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct EchoModel;

    #[async_trait]
    impl GenerationBackend for EchoModel {
        async fn generate(&self, request: &GenerationRequest) -> Result<Value, BackendError> {
            Ok(json!({"prompt": request.prompt}))
        }
    }

    fn builder() -> PipelineBuilder {
        PipelineBuilder::new(Backends::new(Arc::new(EchoModel)))
    }

    #[tokio::test]
    async fn test_builtin_pipeline_registers_every_task() {
        let pipeline = builder().build_builtin().await.unwrap();

        let names = pipeline.registry.names().await;
        assert_eq!(names.len(), pipeline.table.specs().len());
        assert!(names.contains(&"historical_cases".to_string()));
        assert_eq!(pipeline.table.fixed(), ["fact_extraction".to_string()]);
    }

    #[tokio::test]
    async fn test_case_search_needs_single_output() {
        let def = PipelineLoader::parse_yaml(
            r#"
name: bad
tasks:
  - name: historical_cases
    kind: case_search
    produces: [cases, more_cases]
"#,
        )
        .unwrap();

        let err = builder().build_from_def(def).await.err().unwrap();
        assert!(err.to_string().contains("exactly one field"));
    }

    #[tokio::test]
    async fn test_cycle_rejected() {
        let def = PipelineLoader::parse_yaml(
            r#"
name: cyclic
tasks:
  - name: a
    produces: [a]
    depends_on: b
  - name: b
    produces: [b]
    depends_on: a
"#,
        )
        .unwrap();

        let err = builder().build_from_def(def).await.err().unwrap();
        assert!(matches!(
            err,
            CasefileError::Pipeline(PipelineError::CircularDependency(_))
        ));
    }
}
