// SPDX-License-Identifier: MIT

//! Wave scheduler
//!
//! Runs the waves computed by the [`DependencyResolver`] against one
//! session. Tasks of a wave run concurrently and all read the state as it
//! was when the wave started; their updates are merged and checkpointed
//! before the next wave begins.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use super::resolver::{DependencyResolver, Wave};
use super::spec::TaskTable;
use crate::backend::document::DocumentLoader;
use crate::backend::error::{CasefileError, PipelineError};
use crate::casefile::workflow::registry::TaskRegistry;
use crate::casefile::workflow::state::{
    CheckpointStore, SessionSnapshot, SharedState, StateUpdate,
};
use crate::casefile::workflow::task::{FailureKind, TaskFailure};

/// Field holding the extracted source document
pub const DOCUMENT_TEXT: &str = "document_text";
/// Field holding the uploaded file name
pub const DOCUMENT_NAME: &str = "document_name";

/// What happens to a run when a task fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep sibling results, record the failure and continue
    #[default]
    BestEffort,
    /// Abort the run at the first failing wave
    FailFast,
}

impl FromStr for FailurePolicy {
    type Err = CasefileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "best_effort" => Ok(Self::BestEffort),
            "fail_fast" => Ok(Self::FailFast),
            other => Err(CasefileError::config(format!(
                "Unknown failure policy '{}', expected best_effort or fail_fast",
                other
            ))),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BestEffort => f.write_str("best_effort"),
            Self::FailFast => f.write_str("fail_fast"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub failure_policy: FailurePolicy,
    /// Deadline shared by every task of a wave; `None` waits forever
    pub wave_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::BestEffort,
            wave_timeout: Some(Duration::from_secs(900)),
        }
    }
}

/// Newly uploaded source document
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub filename: String,
    pub content: DocumentContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentContent {
    /// Raw upload, extracted when the run starts
    Bytes(Vec<u8>),
    /// Already extracted text
    Text(String),
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub session_key: String,
    pub tasks: Vec<String>,
    pub document: Option<DocumentInput>,
    /// Recompute explicitly requested tasks even if their outputs exist
    pub force: bool,
}

impl RunRequest {
    pub fn new<I, S>(session_key: impl Into<String>, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            session_key: session_key.into(),
            tasks: tasks.into_iter().map(Into::into).collect(),
            document: None,
            force: false,
        }
    }

    pub fn with_document(mut self, filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.document = Some(DocumentInput {
            filename: filename.into(),
            content: DocumentContent::Bytes(bytes.into()),
        });
        self
    }

    pub fn with_text(mut self, filename: impl Into<String>, text: impl Into<String>) -> Self {
        self.document = Some(DocumentInput {
            filename: filename.into(),
            content: DocumentContent::Text(text.into()),
        });
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Outcome of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub session_key: String,
    pub state: SharedState,
    /// Waves actually executed, after dropping satisfied tasks
    pub waves: Vec<Wave>,
    pub executed: Vec<String>,
    /// Tasks whose outputs were already present
    pub skipped: Vec<String>,
    pub failures: Vec<TaskFailure>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Receives per-task progress while a run is in flight
pub trait ProgressObserver: Send + Sync {
    /// Number of tasks that will be attempted
    fn on_planned(&self, total: usize);

    fn on_task_finished(&self, task: &str, failure: Option<&TaskFailure>);
}

pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_planned(&self, _total: usize) {}

    fn on_task_finished(&self, _task: &str, _failure: Option<&TaskFailure>) {}
}

enum Outcome {
    Done(StateUpdate),
    Failed(TaskFailure),
}

pub struct Scheduler {
    table: Arc<TaskTable>,
    registry: TaskRegistry,
    store: Arc<dyn CheckpointStore>,
    loader: Arc<dyn DocumentLoader>,
    config: SchedulerConfig,
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Scheduler {
    pub fn new(
        table: Arc<TaskTable>,
        registry: TaskRegistry,
        store: Arc<dyn CheckpointStore>,
        loader: Arc<dyn DocumentLoader>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            table,
            registry,
            store,
            loader,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> &TaskTable {
        &self.table
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn CheckpointStore> {
        self.store.clone()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Per-session lock; runs on one session queue behind each other
    fn session_lock(&self, session_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.sessions()
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once nobody holds or waits on it
    fn release_session_lock(&self, session_key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut sessions = self.sessions();
        drop(lock);
        let idle = sessions
            .get(session_key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1);
        if idle {
            sessions.remove(session_key);
        }
    }

    #[cfg(test)]
    fn session_lock_count(&self) -> usize {
        self.sessions().len()
    }

    /// Extract an uploaded document up front so bad uploads fail before a run is queued
    pub async fn prepare_document(&self, mut request: RunRequest) -> Result<RunRequest, CasefileError> {
        if let Some(document) = request.document.as_mut() {
            if let DocumentContent::Bytes(bytes) = &document.content {
                let text = self.loader.extract_text(&document.filename, bytes).await?;
                document.content = DocumentContent::Text(text);
            }
        }
        Ok(request)
    }

    /// Current checkpoint of a session
    pub async fn snapshot(&self, session_key: &str) -> Result<Option<SessionSnapshot>, CasefileError> {
        Ok(self.store.load(session_key).await?)
    }

    /// Forget everything stored for a session
    pub async fn reset(&self, session_key: &str) -> Result<bool, CasefileError> {
        let lock = self.session_lock(session_key);
        let guard = lock.lock().await;
        let result = self.store.reset(session_key).await;
        drop(guard);
        self.release_session_lock(session_key, lock);

        let existed = result?;
        log::info!("Session {} reset (existed: {})", session_key, existed);
        Ok(existed)
    }

    /// Run the requested tasks, plus prerequisites and fixed tasks, for a session
    pub async fn run(
        &self,
        request: RunRequest,
        observer: &dyn ProgressObserver,
    ) -> Result<RunReport, CasefileError> {
        let explicit: BTreeSet<String> = request.tasks.iter().cloned().collect();
        let mut names: Vec<String> = self.table.fixed().to_vec();
        names.extend(request.tasks.iter().cloned());
        let planned = DependencyResolver::resolve(&names, &self.table)?;

        let session_key = request.session_key.clone();
        let lock = self.session_lock(&session_key);
        let guard = lock.lock().await;
        let result = self.run_locked(request, explicit, planned, observer).await;
        drop(guard);
        self.release_session_lock(&session_key, lock);
        result
    }

    async fn run_locked(
        &self,
        request: RunRequest,
        explicit: BTreeSet<String>,
        planned: Vec<Wave>,
        observer: &dyn ProgressObserver,
    ) -> Result<RunReport, CasefileError> {
        let mut snapshot = self
            .store
            .load(&request.session_key)
            .await?
            .unwrap_or_else(|| SessionSnapshot::new(&request.session_key));

        if let Some(document) = &request.document {
            let text = match &document.content {
                DocumentContent::Text(text) => text.clone(),
                DocumentContent::Bytes(bytes) => {
                    self.loader.extract_text(&document.filename, bytes).await?
                }
            };
            let current = snapshot.state.get(DOCUMENT_TEXT).and_then(|v| v.as_str());
            if current != Some(text.as_str()) {
                if current.is_some() {
                    log::info!(
                        "New document for session {}, discarding previous analysis",
                        request.session_key
                    );
                }
                snapshot.clear();
                snapshot
                    .state
                    .insert(DOCUMENT_TEXT, serde_json::Value::String(text));
                snapshot.state.insert(
                    DOCUMENT_NAME,
                    serde_json::Value::String(document.filename.clone()),
                );
            }
        }

        if !snapshot.state.contains(DOCUMENT_TEXT) {
            return Err(PipelineError::MissingDocument(request.session_key).into());
        }

        snapshot.requested.extend(explicit.iter().cloned());

        let mut skipped = Vec::new();
        let waves: Vec<Wave> = planned
            .into_iter()
            .map(|wave| {
                wave.into_iter()
                    .filter(|name| {
                        let forced = request.force && explicit.contains(name);
                        let satisfied = self
                            .table
                            .get(name)
                            .is_some_and(|spec| snapshot.state.has_all(&spec.produces));
                        if satisfied && !forced {
                            skipped.push(name.clone());
                            false
                        } else {
                            true
                        }
                    })
                    .collect::<Wave>()
            })
            .filter(|wave| !wave.is_empty())
            .collect();

        let total: usize = waves.iter().map(Vec::len).sum();
        observer.on_planned(total);
        if !skipped.is_empty() {
            log::info!("Session {}: already satisfied {:?}", request.session_key, skipped);
        }

        let mut executed = Vec::new();
        let mut failures = Vec::new();
        let mut failed_this_run: HashSet<String> = HashSet::new();

        for (index, wave) in waves.iter().enumerate() {
            log::info!(
                "Session {}: wave {} starting with {} tasks: {:?}",
                request.session_key,
                index,
                wave.len(),
                wave
            );

            let outcomes = self
                .run_wave(wave, &snapshot.state, &failed_this_run, observer)
                .await;

            let mut wave_failures = Vec::new();
            let mut wave_updates = Vec::new();
            for (name, outcome) in outcomes {
                match outcome {
                    Outcome::Done(update) => wave_updates.push((name, update)),
                    Outcome::Failed(failure) => wave_failures.push(failure),
                }
            }

            if self.config.failure_policy == FailurePolicy::FailFast {
                if let Some(first) = wave_failures.first() {
                    log::error!("Session {}: aborting run, {}", request.session_key, first);
                    return Err(PipelineError::WaveFailed {
                        wave: index,
                        task: first.task.clone(),
                        reason: first.reason.clone(),
                    }
                    .into());
                }
            }

            for (name, update) in wave_updates {
                snapshot.state.merge(update);
                snapshot.failures.remove(&name);
                snapshot.completed.insert(name.clone());
                executed.push(name);
            }
            for failure in wave_failures {
                failed_this_run.insert(failure.task.clone());
                snapshot
                    .failures
                    .insert(failure.task.clone(), failure.clone());
                failures.push(failure);
            }

            snapshot.updated_at = chrono::Utc::now();
            self.store.save(&snapshot).await?;
            log::debug!(
                "Session {}: checkpoint saved after wave {}",
                request.session_key,
                index
            );
        }

        // A satisfied run still refreshes the requested history
        if waves.is_empty() {
            snapshot.updated_at = chrono::Utc::now();
            self.store.save(&snapshot).await?;
        }

        log::info!(
            "Session {}: run finished, {} executed, {} skipped, {} failed",
            request.session_key,
            executed.len(),
            skipped.len(),
            failures.len()
        );

        Ok(RunReport {
            session_key: request.session_key,
            state: snapshot.state,
            waves,
            executed,
            skipped,
            failures,
        })
    }

    /// Run one wave against a fixed state; results come back in wave order
    async fn run_wave(
        &self,
        wave: &Wave,
        state: &SharedState,
        failed: &HashSet<String>,
        observer: &dyn ProgressObserver,
    ) -> Vec<(String, Outcome)> {
        let deadline = self.config.wave_timeout.map(|t| Instant::now() + t);
        let mut outcomes: HashMap<String, Outcome> = HashMap::new();
        let mut running = FuturesUnordered::new();

        for name in wave {
            let Some(spec) = self.table.get(name) else {
                continue;
            };

            if let Some(prerequisite) = spec.prerequisites.iter().find(|p| failed.contains(*p)) {
                let failure = TaskFailure::new(
                    name,
                    FailureKind::UnresolvedDependency,
                    format!("prerequisite '{}' failed", prerequisite),
                );
                log::warn!("Task {} blocked: {}", name, failure.reason);
                observer.on_task_finished(name, Some(&failure));
                outcomes.insert(name.clone(), Outcome::Failed(failure));
                continue;
            }

            let missing: Vec<&str> = spec
                .requires
                .iter()
                .filter(|f| !state.contains(f))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                let failure = TaskFailure::new(
                    name,
                    FailureKind::UnresolvedDependency,
                    format!("missing required field(s): {}", missing.join(", ")),
                );
                log::warn!("Task {} blocked: {}", name, failure.reason);
                observer.on_task_finished(name, Some(&failure));
                outcomes.insert(name.clone(), Outcome::Failed(failure));
                continue;
            }

            let Some(task) = self.registry.get(name).await else {
                let failure = TaskFailure::new(
                    name,
                    FailureKind::TaskFailure,
                    "no implementation registered",
                );
                log::error!("Task {} has no implementation", name);
                observer.on_task_finished(name, Some(&failure));
                outcomes.insert(name.clone(), Outcome::Failed(failure));
                continue;
            };

            let view = state.view(&spec.requires);
            let name = name.clone();
            running.push(async move {
                // Own task so a panic stays inside it
                let mut handle = tokio::spawn(async move { task.run(&view).await });
                let joined = match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
                        Ok(joined) => Some(joined),
                        Err(_) => {
                            handle.abort();
                            None
                        }
                    },
                    None => Some(handle.await),
                };
                (name, joined)
            });
        }

        while let Some((name, joined)) = running.next().await {
            let outcome = match joined {
                None => Outcome::Failed(TaskFailure::new(
                    &name,
                    FailureKind::TimedOut,
                    "wave deadline exceeded",
                )),
                Some(Err(e)) => Outcome::Failed(TaskFailure::new(
                    &name,
                    FailureKind::TaskFailure,
                    if e.is_panic() { "task panicked" } else { "task cancelled" },
                )),
                Some(Ok(Err(e))) => Outcome::Failed(TaskFailure::from_error(&name, &e)),
                Some(Ok(Ok(update))) => self.check_update(&name, update),
            };

            match &outcome {
                Outcome::Done(_) => {
                    log::info!("Task {} completed", name);
                    observer.on_task_finished(&name, None);
                }
                Outcome::Failed(failure) => {
                    log::error!("Task {}", failure);
                    observer.on_task_finished(&name, Some(failure));
                }
            }
            outcomes.insert(name, outcome);
        }

        wave.iter()
            .filter_map(|name| outcomes.remove(name).map(|o| (name.clone(), o)))
            .collect()
    }

    /// A task must return exactly its declared fields
    fn check_update(&self, name: &str, update: StateUpdate) -> Outcome {
        let Some(spec) = self.table.get(name) else {
            return Outcome::Done(update);
        };

        let undeclared: Vec<&str> = update
            .keys()
            .filter(|k| !spec.produces.contains(k))
            .map(String::as_str)
            .collect();
        if !undeclared.is_empty() {
            return Outcome::Failed(TaskFailure::new(
                name,
                FailureKind::TaskFailure,
                format!("wrote undeclared field(s): {}", undeclared.join(", ")),
            ));
        }

        let missing: Vec<&str> = spec
            .produces
            .iter()
            .filter(|f| update.get(*f).map_or(true, |v| v.is_null()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Outcome::Failed(TaskFailure::new(
                name,
                FailureKind::TaskFailure,
                format!("did not produce: {}", missing.join(", ")),
            ));
        }

        Outcome::Done(update)
    }
}
