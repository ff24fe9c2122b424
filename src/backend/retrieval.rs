// SPDX-License-Identifier: MIT

//! Vector retrieval over prebuilt indices
//!
//! Each index lives at `<index_dir>/<name>/chunks.json` as an array of
//! `{content, metadata, embedding}` records. Indices are read-only and
//! loaded at most once per process: the first query for a name loads it
//! while concurrent callers wait on the same cell.

use crate::backend::error::BackendError;
use crate::backend::model::Embedder;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// One chunk returned by a retrieval query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedChunk {
    pub content: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Value,
}

#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    /// Top `k` chunks of `index` for `query`, best first
    async fn search(
        &self,
        index: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, BackendError>;
}

#[derive(Debug, Deserialize)]
struct StoredChunk {
    content: String,
    #[serde(default)]
    metadata: Value,
    embedding: Vec<f32>,
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// In-memory index with unit-length embeddings
#[derive(Debug)]
pub struct VectorIndex {
    chunks: Vec<StoredChunk>,
}

impl VectorIndex {
    fn from_json(raw: &str) -> Result<Self, BackendError> {
        let mut chunks: Vec<StoredChunk> = serde_json::from_str(raw)?;
        for chunk in &mut chunks {
            normalize(&mut chunk.embedding);
        }
        Ok(Self { chunks })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Cosine top-k against an arbitrary query vector
    pub fn top_k(&self, query: &[f32], k: usize) -> Vec<RetrievedChunk> {
        let mut query = query.to_vec();
        normalize(&mut query);

        let mut scored: Vec<(f32, &StoredChunk)> = self
            .chunks
            .iter()
            .filter(|c| c.embedding.len() == query.len())
            .map(|c| {
                let dot = c.embedding.iter().zip(&query).map(|(a, b)| a * b).sum();
                (dot, c)
            })
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored
            .into_iter()
            .take(k)
            .map(|(score, c)| RetrievedChunk {
                content: c.content.clone(),
                score,
                metadata: c.metadata.clone(),
            })
            .collect()
    }
}

/// Lazily loaded set of named indices under one directory
pub struct IndexCatalog {
    dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<VectorIndex>>>>>,
}

impl IndexCatalog {
    pub fn new(dir: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            dir: dir.into(),
            embedder,
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn cell(&self, name: &str) -> Arc<OnceCell<Arc<VectorIndex>>> {
        let mut cells = match self.cells.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cells.entry(name.to_string()).or_default().clone()
    }

    /// Get an index, loading it on first use
    pub async fn index(&self, name: &str) -> Result<Arc<VectorIndex>, BackendError> {
        let cell = self.cell(name);
        let index = cell
            .get_or_try_init(|| async {
                let path = self.dir.join(name).join("chunks.json");
                let raw = match tokio::fs::read_to_string(&path).await {
                    Ok(raw) => raw,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(BackendError::IndexNotFound(name.to_string()));
                    }
                    Err(e) => return Err(e.into()),
                };
                let index = VectorIndex::from_json(&raw)?;
                log::info!("Loaded retrieval index '{}' ({} chunks)", name, index.len());
                Ok(Arc::new(index))
            })
            .await?;
        Ok(index.clone())
    }
}

#[async_trait]
impl RetrievalBackend for IndexCatalog {
    async fn search(
        &self,
        index: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, BackendError> {
        let index = self.index(index).await?;
        let embedding = self.embedder.embed(query).await?;
        Ok(index.top_k(&embedding, k))
    }
}
