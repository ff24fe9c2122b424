// SPDX-License-Identifier: MIT

//! Session checkpoints
//!
//! A [`CheckpointStore`] holds at most one [`SessionSnapshot`] per session
//! key. `save` replaces the whole snapshot; merging is the scheduler's job.
//!
//! File layout for [`FileCheckpointStore`]:
//!
//! ```text
//! checkpoints/
//! ├── <base64url(session key)>.json
//! └── <base64url(session key)>.json
//! ```

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::store::SharedState;
use crate::backend::error::PipelineError;
use crate::casefile::workflow::task::TaskFailure;

/// Everything persisted for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_key: String,
    pub state: SharedState,
    /// Tasks that have produced their outputs
    #[serde(default)]
    pub completed: BTreeSet<String>,
    /// Latest failure per task; cleared when the task later succeeds
    #[serde(default)]
    pub failures: BTreeMap<String, TaskFailure>,
    /// Every task ever requested for this session
    #[serde(default)]
    pub requested: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            state: SharedState::empty(),
            completed: BTreeSet::new(),
            failures: BTreeMap::new(),
            requested: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// Drop all derived data, keeping only the session identity
    pub fn clear(&mut self) {
        self.state = SharedState::empty();
        self.completed.clear();
        self.failures.clear();
        self.requested.clear();
        self.updated_at = Utc::now();
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, session_key: &str) -> Result<Option<SessionSnapshot>, PipelineError>;

    /// Replace the stored snapshot
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PipelineError>;

    /// Forget a session; returns whether anything was stored
    async fn reset(&self, session_key: &str) -> Result<bool, PipelineError>;

    /// Drop sessions last updated before `older_than`, except those in `keep`.
    /// Returns the evicted keys.
    async fn expire(
        &self,
        older_than: DateTime<Utc>,
        keep: &HashSet<String>,
    ) -> Result<Vec<String>, PipelineError>;
}

/// Process-local store
#[derive(Default)]
pub struct MemoryCheckpointStore {
    sessions: RwLock<HashMap<String, SessionSnapshot>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, session_key: &str) -> Result<Option<SessionSnapshot>, PipelineError> {
        Ok(self.sessions.read().await.get(session_key).cloned())
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PipelineError> {
        self.sessions
            .write()
            .await
            .insert(snapshot.session_key.clone(), snapshot.clone());
        Ok(())
    }

    async fn reset(&self, session_key: &str) -> Result<bool, PipelineError> {
        Ok(self.sessions.write().await.remove(session_key).is_some())
    }

    async fn expire(
        &self,
        older_than: DateTime<Utc>,
        keep: &HashSet<String>,
    ) -> Result<Vec<String>, PipelineError> {
        let mut sessions = self.sessions.write().await;
        let stale: Vec<String> = sessions
            .values()
            .filter(|s| s.updated_at < older_than && !keep.contains(&s.session_key))
            .map(|s| s.session_key.clone())
            .collect();
        for key in &stale {
            sessions.remove(key);
        }
        Ok(stale)
    }
}

/// One JSON file per session, written atomically via temp file + rename
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, session_key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(session_key)))
    }

    fn temp_path_for(&self, session_key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.tmp", URL_SAFE_NO_PAD.encode(session_key)))
    }

    async fn read_snapshot(path: &PathBuf) -> Result<Option<SessionSnapshot>, PipelineError> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PipelineError::Checkpoint(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_slice(&data).map(Some).map_err(|e| {
            PipelineError::Checkpoint(format!("Corrupt checkpoint {}: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, session_key: &str) -> Result<Option<SessionSnapshot>, PipelineError> {
        Self::read_snapshot(&self.path_for(session_key)).await
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PipelineError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PipelineError::Checkpoint(format!("Failed to create directory: {}", e)))?;

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| PipelineError::Checkpoint(format!("Serialization failed: {}", e)))?;

        let temp_path = self.temp_path_for(&snapshot.session_key);
        let final_path = self.path_for(&snapshot.session_key);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| PipelineError::Checkpoint(format!("Failed to create temp file: {}", e)))?;
        file.write_all(&json)
            .await
            .map_err(|e| PipelineError::Checkpoint(format!("Failed to write data: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| PipelineError::Checkpoint(format!("Failed to sync file: {}", e)))?;

        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| PipelineError::Checkpoint(format!("Failed to rename file: {}", e)))?;

        Ok(())
    }

    async fn reset(&self, session_key: &str) -> Result<bool, PipelineError> {
        match fs::remove_file(self.path_for(session_key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PipelineError::Checkpoint(format!(
                "Failed to remove checkpoint: {}",
                e
            ))),
        }
    }

    async fn expire(
        &self,
        older_than: DateTime<Utc>,
        keep: &HashSet<String>,
    ) -> Result<Vec<String>, PipelineError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PipelineError::Checkpoint(format!(
                    "Failed to read directory: {}",
                    e
                )))
            }
        };

        let mut evicted = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::Checkpoint(format!("Failed to read entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let snapshot = match Self::read_snapshot(&path).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Skipping unreadable checkpoint: {}", e);
                    continue;
                }
            };
            if snapshot.updated_at < older_than && !keep.contains(&snapshot.session_key) {
                self.reset(&snapshot.session_key).await?;
                evicted.push(snapshot.session_key);
            }
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn snapshot(key: &str, age_hours: i64) -> SessionSnapshot {
        let mut s = SessionSnapshot::new(key);
        s.state.insert("document_text", json!("FIR"));
        s.completed.insert("fact_extraction".into());
        s.updated_at = Utc::now() - Duration::hours(age_hours);
        s
    }

    #[tokio::test]
    async fn test_memory_round_trip_and_reset() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load("s1").await.unwrap().is_none());

        let s = snapshot("s1", 0);
        store.save(&s).await.unwrap();
        assert_eq!(store.load("s1").await.unwrap(), Some(s));
        assert!(store.load("s2").await.unwrap().is_none());

        assert!(store.reset("s1").await.unwrap());
        assert!(!store.reset("s1").await.unwrap());
        assert!(store.load("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_expire_skips_kept_sessions() {
        let store = MemoryCheckpointStore::new();
        store.save(&snapshot("old", 48)).await.unwrap();
        store.save(&snapshot("busy", 48)).await.unwrap();
        store.save(&snapshot("fresh", 1)).await.unwrap();

        let keep = HashSet::from(["busy".to_string()]);
        let evicted = store
            .expire(Utc::now() - Duration::hours(24), &keep)
            .await
            .unwrap();

        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(store.load("busy").await.unwrap().is_some());
        assert!(store.load("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));

        let s = snapshot("user/42:case", 0);
        store.save(&s).await.unwrap();

        let loaded = store.load("user/42:case").await.unwrap().unwrap();
        assert_eq!(loaded, s);

        // Full replace, not merge
        let mut replaced = SessionSnapshot::new("user/42:case");
        replaced.state.insert("other", json!(true));
        store.save(&replaced).await.unwrap();
        let loaded = store.load("user/42:case").await.unwrap().unwrap();
        assert!(loaded.state.get("document_text").is_none());
        assert!(loaded.completed.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_expire_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        store.save(&snapshot("old", 30)).await.unwrap();
        store.save(&snapshot("new", 0)).await.unwrap();

        let evicted = store
            .expire(Utc::now() - Duration::hours(24), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(store.load("old").await.unwrap().is_none());

        assert!(store.reset("new").await.unwrap());
        assert!(store.load("new").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        std::fs::write(store.path_for("bad"), b"{not json").unwrap();

        let err = store.load("bad").await.unwrap_err();
        assert!(matches!(err, PipelineError::Checkpoint(_)));
    }
}
