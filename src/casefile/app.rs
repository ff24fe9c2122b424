// SPDX-License-Identifier: MIT

//! Wiring: settings to backends, pipeline, scheduler and job tracker

use std::sync::Arc;

use crate::backend::document::{DocumentLoader, PlainTextLoader};
use crate::backend::error::{BackendError, CasefileError, PipelineError};
use crate::backend::model::openai::{OpenAIEmbedder, OpenAIModel};
use crate::backend::render::{ExportDocument, MarkdownRenderer, RenderedDocument, Renderer};
use crate::backend::retrieval::IndexCatalog;
use crate::backend::search::{CaseSearch, KanoonSearch};
use crate::casefile::config::Settings;
use crate::casefile::jobs::JobTracker;
use crate::casefile::workflow::builder::{Backends, Pipeline, PipelineBuilder};
use crate::casefile::workflow::graph::{Scheduler, SchedulerConfig, DOCUMENT_NAME, DOCUMENT_TEXT};
use crate::casefile::workflow::state::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use crate::casefile::workflow::types::PipelineDefinition;

pub struct App {
    definition: PipelineDefinition,
    tracker: JobTracker,
    renderer: Arc<dyn Renderer>,
}

impl App {
    /// Build everything from settings, talking to live backends
    pub async fn from_settings(settings: &Settings) -> Result<Self, CasefileError> {
        let api_key = settings
            .openai_api_key
            .clone()
            .ok_or_else(|| BackendError::ApiKeyMissing("openai".into()))?;

        let generation = OpenAIModel::with_endpoint(
            api_key.clone(),
            settings.openai_base_url.clone(),
            settings.model.clone(),
        )
        .with_defaults(settings.generation_config());
        let embedder = OpenAIEmbedder::with_endpoint(
            api_key,
            settings.openai_base_url.clone(),
            settings.embedding_model.clone(),
        );

        let search: Option<Arc<dyn CaseSearch>> = match &settings.kanoon_token {
            Some(token) => Some(Arc::new(KanoonSearch::with_token(token.clone()))),
            None => {
                log::warn!("INDIAN_KANOON_API_TOKEN not set; historical case search will fail");
                None
            }
        };

        let backends = Backends {
            generation: Arc::new(generation),
            retrieval: Some(Arc::new(IndexCatalog::new(
                settings.index_dir.clone(),
                Arc::new(embedder),
            ))),
            search,
            retry: settings.retry_policy(),
            generation_config: settings.generation_config(),
        };

        let builder = PipelineBuilder::new(backends);
        let pipeline = match &settings.pipeline_path {
            Some(path) => builder.build_file(path).await?,
            None => builder.build_builtin().await?,
        };

        let store: Arc<dyn CheckpointStore> = match &settings.checkpoint_dir {
            Some(dir) => {
                log::info!("Checkpoints stored in {}", dir.display());
                Arc::new(FileCheckpointStore::new(dir.clone()))
            }
            None => Arc::new(MemoryCheckpointStore::new()),
        };

        Ok(Self::with_parts(
            pipeline,
            store,
            Arc::new(PlainTextLoader),
            settings.scheduler_config(),
        ))
    }

    /// Assemble from already built parts
    pub fn with_parts(
        pipeline: Pipeline,
        store: Arc<dyn CheckpointStore>,
        loader: Arc<dyn DocumentLoader>,
        config: SchedulerConfig,
    ) -> Self {
        let scheduler = Scheduler::new(pipeline.table, pipeline.registry, store, loader, config);
        Self {
            definition: pipeline.definition,
            tracker: JobTracker::new(Arc::new(scheduler)),
            renderer: Arc::new(MarkdownRenderer),
        }
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.tracker.scheduler()
    }

    /// Render everything a session has produced so far
    pub async fn export(&self, session_key: &str) -> Result<RenderedDocument, CasefileError> {
        let snapshot = self
            .scheduler()
            .snapshot(session_key)
            .await?
            .ok_or_else(|| PipelineError::SessionNotFound(session_key.to_string()))?;

        let title = match snapshot.state.get(DOCUMENT_NAME).and_then(|v| v.as_str()) {
            Some(name) => format!("FIR Analysis: {}", name),
            None => "FIR Analysis".to_string(),
        };

        let sections = self
            .scheduler()
            .table()
            .specs()
            .iter()
            .flat_map(|spec| spec.produces.iter())
            .filter(|field| field.as_str() != DOCUMENT_TEXT && field.as_str() != DOCUMENT_NAME)
            .filter_map(|field| {
                snapshot
                    .state
                    .get(field)
                    .map(|value| (field.clone(), value.clone()))
            })
            .collect();

        let failures = snapshot
            .failures
            .values()
            .map(|f| (f.task.clone(), format!("{} ({})", f.reason, f.kind)))
            .collect();

        let document = ExportDocument {
            title,
            sections,
            failures,
        };
        log::debug!(
            "Exporting session {} with {} sections",
            session_key,
            document.sections.len()
        );
        Ok(self.renderer.render(&document)?)
    }

    /// Export file name for a session
    pub fn export_filename(&self, session_key: &str, rendered: &RenderedDocument) -> String {
        let safe: String = session_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("{}_{}.{}", self.definition.name, safe, rendered.extension)
    }
}
