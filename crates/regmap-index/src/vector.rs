//! Vector store seam and an in-process flat index.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// An embedding stored for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub section_id: String,
    pub vector: Vec<f32>,
}

/// A nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    /// Cosine similarity (higher is better)
    pub score: f32,
}

/// Nearest-neighbour store keyed by chunk id.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace records.
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;

    /// Top `limit` chunks by similarity to `embedding`, best first.
    async fn search(&self, embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>>;

    /// Number of stored vectors.
    async fn count(&self) -> Result<usize>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Cosine similarity; 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Records plus a chunk id -> position lookup.
#[derive(Debug, Default)]
struct FlatRecords {
    records: Vec<VectorRecord>,
    positions: HashMap<String, usize>,
}

impl FlatRecords {
    fn insert(&mut self, record: VectorRecord) {
        match self.positions.get(&record.chunk_id) {
            Some(&position) => self.records[position] = record,
            None => {
                self.positions.insert(record.chunk_id.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    fn dimensions(&self) -> Option<usize> {
        self.records.first().map(|r| r.vector.len())
    }
}

/// Brute-force cosine index, persisted as JSON next to the lexical index.
#[derive(Debug, Default)]
pub struct FlatVectorIndex {
    inner: RwLock<FlatRecords>,
}

impl FlatVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from records; a repeated chunk id keeps the last record.
    pub fn from_records(records: Vec<VectorRecord>) -> Self {
        let mut inner = FlatRecords::default();
        for record in records {
            inner.insert(record);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Save all records to a file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read().await;
        let json = serde_json::to_string(&inner.records)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write vectors: {:?}", path))?;
        debug!("Saved {} vectors to {:?}", inner.records.len(), path);
        Ok(())
    }

    /// Load records from a file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading vectors from: {:?}", path);
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read vectors: {:?}", path))?;
        let records: Vec<VectorRecord> =
            serde_json::from_str(&json).context("Failed to parse vectors")?;
        Ok(Self::from_records(records))
    }
}

#[async_trait]
impl VectorStore for FlatVectorIndex {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        let mut inner = self.inner.write().await;
        for record in records {
            if let Some(dims) = inner.dimensions() {
                if dims != record.vector.len() {
                    bail!(
                        "Vector for {} has {} dimensions, index holds {}",
                        record.chunk_id,
                        record.vector.len(),
                        dims
                    );
                }
            }
            inner.insert(record);
        }
        Ok(())
    }

    async fn search(&self, embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        let inner = self.inner.read().await;
        if let Some(dims) = inner.dimensions() {
            if dims != embedding.len() {
                bail!(
                    "Query embedding has {} dimensions, index holds {}",
                    embedding.len(),
                    dims
                );
            }
        }

        let mut hits: Vec<VectorHit> = inner
            .records
            .iter()
            .map(|r| VectorHit {
                chunk_id: r.chunk_id.clone(),
                score: cosine_similarity(embedding, &r.vector),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.inner.read().await.records.len())
    }

    fn name(&self) -> &str {
        "flat"
    }
}
