// SPDX-License-Identifier: MIT

//! Asynchronous job tracking
//!
//! A job is one detached scheduler run. Its snapshot lives in a `watch`
//! channel so callers can poll it or follow it as a stream; progress moves
//! forward each time a task finishes.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use uuid::Uuid;

use crate::backend::error::{CasefileError, PipelineError};
use crate::casefile::workflow::graph::{ProgressObserver, RunRequest, Scheduler};
use crate::casefile::workflow::task::TaskFailure;

/// Progress once setup is done
const PROGRESS_STARTED: u8 = 10;
/// Share of progress spread over task completions
const PROGRESS_TASK_SPAN: usize = 85;
/// Ceiling while the run is still in flight
const PROGRESS_CEILING: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a poller sees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub session_key: String,
    pub status: JobStatus,
    /// 0-100, never decreases
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Session holding the result, set once the run completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(default)]
    pub failed_tasks: Vec<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    fn new(id: String, session_key: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_key,
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            result_ref: None,
            failed_tasks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

type JobChannel = Arc<watch::Sender<JobSnapshot>>;

/// Apply a status change if it is a legal transition
fn transition(tx: &watch::Sender<JobSnapshot>, next: JobStatus, apply: impl FnOnce(&mut JobSnapshot)) {
    tx.send_if_modified(|job| {
        if !job.status.can_transition_to(next) {
            log::warn!("Job {}: ignoring {} -> {}", job.id, job.status, next);
            return false;
        }
        log::info!("Job {}: {} -> {}", job.id, job.status, next);
        job.status = next;
        apply(job);
        job.updated_at = Utc::now();
        true
    });
}

/// Feeds per-task completions into the job's progress
struct JobProgress {
    tx: JobChannel,
    total: AtomicUsize,
    done: AtomicUsize,
}

impl JobProgress {
    fn progress_for(done: usize, total: usize) -> u8 {
        if total == 0 {
            return PROGRESS_STARTED;
        }
        let pct = PROGRESS_STARTED as usize + done.min(total) * PROGRESS_TASK_SPAN / total;
        pct.min(PROGRESS_CEILING as usize) as u8
    }
}

impl ProgressObserver for JobProgress {
    fn on_planned(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
    }

    fn on_task_finished(&self, _task: &str, failure: Option<&TaskFailure>) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let progress = Self::progress_for(done, self.total.load(Ordering::SeqCst));
        self.tx.send_if_modified(|job| {
            let mut changed = false;
            if progress > job.progress {
                job.progress = progress;
                changed = true;
            }
            if let Some(failure) = failure {
                job.failed_tasks.push(failure.clone());
                changed = true;
            }
            if changed {
                job.updated_at = Utc::now();
            }
            changed
        });
    }
}

/// Marks a session as having work in flight until dropped
pub struct SessionClaim {
    active: Arc<Mutex<HashSet<String>>>,
    session_key: String,
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.session_key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct JobTracker {
    scheduler: Arc<Scheduler>,
    jobs: Arc<Mutex<HashMap<String, JobChannel>>>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl JobTracker {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Reserve a session; fails if it already has work in flight
    pub fn claim(&self, session_key: &str) -> Result<SessionClaim, PipelineError> {
        let mut active = lock(&self.active);
        if !active.insert(session_key.to_string()) {
            return Err(PipelineError::SessionBusy(session_key.to_string()));
        }
        Ok(SessionClaim {
            active: self.active.clone(),
            session_key: session_key.to_string(),
        })
    }

    pub fn is_busy(&self, session_key: &str) -> bool {
        lock(&self.active).contains(session_key)
    }

    pub fn active_sessions(&self) -> HashSet<String> {
        lock(&self.active).clone()
    }

    /// Start a run in the background and return its job id.
    ///
    /// Unknown task names and sessions with a job in flight are rejected
    /// before anything is spawned.
    pub fn submit(&self, request: RunRequest) -> Result<String, PipelineError> {
        let table = self.scheduler.table();
        if let Some(unknown) = request.tasks.iter().find(|t| !table.contains(t)) {
            return Err(PipelineError::UnknownTask(unknown.clone()));
        }

        let claim = self.claim(&request.session_key)?;
        let id = Uuid::new_v4().to_string();
        let (tx, _rx) = watch::channel(JobSnapshot::new(id.clone(), request.session_key.clone()));
        let tx = Arc::new(tx);
        lock(&self.jobs).insert(id.clone(), tx.clone());

        log::info!(
            "Job {} submitted for session {}: {:?}",
            id,
            request.session_key,
            request.tasks
        );

        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            transition(&tx, JobStatus::Running, |job| job.progress = PROGRESS_STARTED);

            let observer = JobProgress {
                tx: tx.clone(),
                total: AtomicUsize::new(0),
                done: AtomicUsize::new(0),
            };
            let session_key = request.session_key.clone();

            let outcome = AssertUnwindSafe(scheduler.run(request, &observer))
                .catch_unwind()
                .await;
            // Free the session before anyone can observe a terminal status
            drop(claim);

            match outcome {
                Ok(Ok(report)) => transition(&tx, JobStatus::Completed, |job| {
                    job.progress = 100;
                    job.result_ref = Some(session_key);
                    job.failed_tasks = report.failures;
                }),
                Ok(Err(e)) => {
                    log::error!("Job failed: {}", e);
                    transition(&tx, JobStatus::Failed, |job| job.error = Some(e.to_string()))
                }
                Err(_) => {
                    log::error!("Job for session {} panicked", session_key);
                    transition(&tx, JobStatus::Failed, |job| {
                        job.error = Some("run panicked".to_string())
                    })
                }
            }
        });

        Ok(id)
    }

    pub fn poll(&self, id: &str) -> Option<JobSnapshot> {
        lock(&self.jobs).get(id).map(|tx| tx.borrow().clone())
    }

    /// Snapshots of a job as it changes, ending after a terminal status
    pub fn updates(&self, id: &str) -> Option<impl Stream<Item = JobSnapshot> + Send + 'static> {
        let rx = lock(&self.jobs).get(id)?.subscribe();
        Some(stream::unfold(Some((rx, true)), |state| async move {
            let (mut rx, first) = state?;
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let snapshot = rx.borrow_and_update().clone();
            let next = if snapshot.status.is_terminal() {
                None
            } else {
                Some((rx, false))
            };
            Some((snapshot, next))
        }))
    }

    /// Reset a session unless a job is running on it
    pub async fn reset_session(&self, session_key: &str) -> Result<bool, CasefileError> {
        let _claim = self.claim(session_key)?;
        self.scheduler.reset(session_key).await
    }

    /// Drop finished jobs last updated before `older_than`
    pub fn forget_finished(&self, older_than: DateTime<Utc>) -> usize {
        let mut jobs = lock(&self.jobs);
        let before = jobs.len();
        jobs.retain(|_, tx| {
            let job = tx.borrow();
            !(job.status.is_terminal() && job.updated_at < older_than)
        });
        before - jobs.len()
    }
}
