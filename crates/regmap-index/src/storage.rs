//! Persistence for built indexes.
//!
//! An index directory holds:
//! - `lexical_index.json`: chunks and their tokens
//! - `graph.json`: a checksummed graph snapshot
//! - `graph_stats.json`: graph counts, for inspection
//! - `vectors.json`: flat vector index (only when embeddings were computed locally)
//!
//! Every file is written to a temporary path and renamed into place, so a
//! crashed write never leaves a half-written snapshot behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::graph::{EntityGraph, GraphStats};
use crate::search::BM25Index;
use crate::vector::FlatVectorIndex;

/// Default index directory.
pub const DEFAULT_INDEX_DIR: &str = "data/indexes";

pub const LEXICAL_FILE: &str = "lexical_index.json";
pub const GRAPH_FILE: &str = "graph.json";
pub const GRAPH_STATS_FILE: &str = "graph_stats.json";
pub const VECTORS_FILE: &str = "vectors.json";

/// Graph snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk graph snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub version: u32,
    /// Unix seconds
    pub created_at: u64,
    /// SHA-256 of the serialized graph, hex encoded
    pub checksum: String,
    pub stats: GraphStats,
    pub graph: EntityGraph,
}

impl GraphSnapshot {
    pub fn new(graph: EntityGraph) -> Result<Self> {
        let checksum = graph_checksum(&graph)?;
        Ok(Self {
            version: SNAPSHOT_VERSION,
            created_at: now(),
            checksum,
            stats: graph.stats(),
            graph,
        })
    }

    /// Check version, checksum and derived indexes.
    pub fn verify(&self) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            bail!(
                "Unsupported graph snapshot version {} (expected {})",
                self.version,
                SNAPSHOT_VERSION
            );
        }
        let actual = graph_checksum(&self.graph)?;
        if actual != self.checksum {
            bail!(
                "Graph snapshot checksum mismatch: stored {}, computed {}",
                self.checksum,
                actual
            );
        }
        self.graph
            .verify_indexes()
            .context("Graph snapshot failed index verification")?;
        Ok(())
    }
}

fn graph_checksum(graph: &EntityGraph) -> Result<String> {
    let bytes = serde_json::to_vec(graph).context("Failed to serialize graph")?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Reads and writes the files of one index directory.
#[derive(Debug, Clone)]
pub struct IndexStore {
    dir: PathBuf,
}

impl IndexStore {
    /// Use `dir`, creating it if needed.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create index directory: {:?}", dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    pub fn has_lexical(&self) -> bool {
        self.path(LEXICAL_FILE).exists()
    }

    pub fn has_graph(&self) -> bool {
        self.path(GRAPH_FILE).exists()
    }

    pub fn has_vectors(&self) -> bool {
        self.path(VECTORS_FILE).exists()
    }

    pub fn save_lexical(&self, index: &BM25Index) -> Result<()> {
        let tmp = temp_path(&self.path(LEXICAL_FILE));
        index.save(&tmp)?;
        commit(&tmp, &self.path(LEXICAL_FILE))?;
        info!("Saved lexical index: {} chunks", index.len());
        Ok(())
    }

    pub fn load_lexical(&self) -> Result<BM25Index> {
        BM25Index::load(&self.path(LEXICAL_FILE))
    }

    /// Write the graph snapshot and its stats file.
    pub fn save_graph(&self, graph: &EntityGraph) -> Result<GraphStats> {
        let snapshot = GraphSnapshot::new(graph.clone())?;
        let stats = snapshot.stats.clone();

        write_json(&self.path(GRAPH_FILE), &snapshot)?;
        write_json(&self.path(GRAPH_STATS_FILE), &stats)?;

        info!(
            "Saved graph: {} nodes, {} edges",
            stats.total_nodes, stats.total_edges
        );
        Ok(stats)
    }

    /// Load and verify the graph snapshot. `None` if no graph was saved.
    pub fn load_graph(&self) -> Result<Option<EntityGraph>> {
        let path = self.path(GRAPH_FILE);
        if !path.exists() {
            debug!("No graph snapshot at {:?}", path);
            return Ok(None);
        }

        info!("Loading graph from: {:?}", path);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read graph file: {:?}", path))?;
        let snapshot: GraphSnapshot =
            serde_json::from_str(&content).context("Failed to parse graph JSON")?;
        snapshot.verify()?;

        Ok(Some(snapshot.graph))
    }

    /// Stats written alongside the last graph snapshot.
    pub fn load_graph_stats(&self) -> Result<Option<GraphStats>> {
        let path = self.path(GRAPH_STATS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read graph stats: {:?}", path))?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub async fn save_vectors(&self, vectors: &FlatVectorIndex) -> Result<()> {
        let tmp = temp_path(&self.path(VECTORS_FILE));
        vectors.save(&tmp).await?;
        commit(&tmp, &self.path(VECTORS_FILE))
    }

    /// Load the flat vector index. `None` if none was saved.
    pub fn load_vectors(&self) -> Result<Option<FlatVectorIndex>> {
        let path = self.path(VECTORS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        FlatVectorIndex::load(&path).map(Some)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn commit(tmp: &Path, path: &Path) -> Result<()> {
    fs::rename(tmp, path).with_context(|| format!("Failed to move {:?} into place", path))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = temp_path(path);
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
    commit(&tmp, path)
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::EntityKind;
    use tempfile::tempdir;

    fn graph() -> EntityGraph {
        let mut graph = EntityGraph::new();
        let doc = graph.add_document("ACP", "Access Control Policy");
        let section = graph.add_section("ACP-1", "Remote Access", "ACP");
        graph.contain(doc, section);
        let mfa = graph.add_entity(EntityKind::Control, "MFA");
        let ciso = graph.add_entity(EntityKind::Role, "CISO");
        graph.link_section_entity(section, mfa);
        graph.link_section_entity(section, ciso);
        graph.add_co_occurrence(mfa, ciso, 3);
        graph
    }

    #[test]
    fn test_graph_roundtrip() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        assert!(store.load_graph().unwrap().is_none());

        let original = graph();
        let stats = store.save_graph(&original).unwrap();
        assert_eq!(stats.total_nodes, 5);
        assert!(store.has_graph());
        assert!(!dir.path().join("graph.json.tmp").exists());

        let loaded = store.load_graph().unwrap().unwrap();
        assert_eq!(loaded.canonical_form(), original.canonical_form());
        assert_eq!(loaded.co_occurrence_weight("control:mfa", "role:ciso"), Some(3));
        assert_eq!(store.load_graph_stats().unwrap().unwrap(), stats);
    }

    #[test]
    fn test_tampered_snapshot_is_rejected() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        store.save_graph(&graph()).unwrap();

        let path = dir.path().join(GRAPH_FILE);
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("Remote Access", "Remote Acces")).unwrap();

        let err = store.load_graph().unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut snapshot = GraphSnapshot::new(graph()).unwrap();
        snapshot.version = 99;
        assert!(snapshot.verify().is_err());
    }

    #[test]
    fn test_lexical_roundtrip() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("nested")).unwrap();
        assert!(!store.has_lexical());

        let index = BM25Index::build(Vec::new());
        store.save_lexical(&index).unwrap();
        assert!(store.has_lexical());
        assert!(store.load_lexical().unwrap().is_built());
    }

    #[tokio::test]
    async fn test_vectors_roundtrip() {
        use crate::vector::{VectorRecord, VectorStore};

        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path()).unwrap();
        assert!(store.load_vectors().unwrap().is_none());

        let vectors = FlatVectorIndex::from_records(vec![VectorRecord {
            chunk_id: "c".to_string(),
            document_id: "d".to_string(),
            section_id: "s".to_string(),
            vector: vec![1.0, 0.0],
        }]);
        store.save_vectors(&vectors).await.unwrap();

        let loaded = store.load_vectors().unwrap().unwrap();
        assert_eq!(loaded.count().await.unwrap(), 1);
    }

    #[test]
    fn test_temp_path() {
        assert_eq!(
            temp_path(Path::new("/x/graph.json")),
            PathBuf::from("/x/graph.json.tmp")
        );
    }
}
