//! Offline ingestion pipeline.
//!
//! The Indexer turns a provided corpus into the lexical index and entity
//! graph, and optionally embeds every chunk into a vector store.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::chunk::{create_chunks, Chunk, DEFAULT_MIN_CHUNK_CHARS};
use crate::embeddings::EmbeddingProvider;
use crate::graph::EntityGraph;
use crate::graph_builder::GraphBuilder;
use crate::provider::{ProvidedCorpus, SectionProvider};
use crate::search::BM25Index;
use crate::storage::IndexStore;
use crate::vector::{VectorRecord, VectorStore};

/// Configuration for the indexer.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Sections shorter than this are not indexed
    pub min_chunk_chars: usize,
    /// Compute embeddings when an embedder and vector store are present
    pub embed: bool,
    /// Build per-document graphs on the rayon pool and merge them
    pub parallel_graph: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            min_chunk_chars: DEFAULT_MIN_CHUNK_CHARS,
            embed: true,
            parallel_graph: true,
        }
    }
}

/// Statistics about an indexing run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub sections: usize,
    pub chunks: usize,
    /// Documents dropped as inconsistent
    pub skipped_documents: usize,
    pub graph_nodes: usize,
    pub graph_edges: usize,
    pub embedded_chunks: usize,
    /// Total time in milliseconds
    pub duration_ms: u64,
}

/// Output of an indexing run.
#[derive(Debug)]
pub struct BuiltIndexes {
    pub lexical: BM25Index,
    pub graph: EntityGraph,
    pub stats: IndexStats,
}

/// Builds every index from a corpus.
pub struct Indexer {
    config: IndexerConfig,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
    vectors: Option<Arc<dyn VectorStore>>,
}

impl Indexer {
    pub fn new(config: IndexerConfig) -> Self {
        Self {
            config,
            embeddings: None,
            vectors: None,
        }
    }

    /// Embed chunks with `embeddings` and upsert them into `vectors`.
    pub fn with_embeddings(
        mut self,
        embeddings: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        self.embeddings = Some(embeddings);
        self.vectors = Some(vectors);
        self
    }

    /// Load from `provider`, build, and persist into `store`.
    pub async fn index(
        &self,
        provider: &dyn SectionProvider,
        store: &IndexStore,
    ) -> Result<BuiltIndexes> {
        let corpus = provider.load()?;
        let built = self.build(corpus).await?;

        store.save_lexical(&built.lexical)?;
        store.save_graph(&built.graph)?;
        Ok(built)
    }

    /// Build the lexical index and graph, embedding chunks if configured.
    pub async fn build(&self, corpus: ProvidedCorpus) -> Result<BuiltIndexes> {
        let start = Instant::now();
        let mut stats = IndexStats {
            documents: corpus.documents.len(),
            sections: corpus.section_count(),
            skipped_documents: corpus.skipped.len(),
            ..IndexStats::default()
        };
        info!(
            "Indexing {} documents ({} sections, {} skipped)",
            stats.documents, stats.sections, stats.skipped_documents
        );

        let chunks = create_chunks(&corpus.documents, self.config.min_chunk_chars);
        stats.chunks = chunks.len();

        if self.config.embed {
            stats.embedded_chunks = self.embed_and_upsert(&chunks).await?;
        }

        let graph = if self.config.parallel_graph {
            GraphBuilder::build_parallel(&corpus.documents)
        } else {
            GraphBuilder::build(&corpus.documents)
        };
        stats.graph_nodes = graph.node_count();
        stats.graph_edges = graph.edge_count();

        let lexical = BM25Index::build(chunks);

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!("Indexing complete: {:?}", stats);

        Ok(BuiltIndexes {
            lexical,
            graph,
            stats,
        })
    }

    /// Generate embeddings for chunks and upsert them. Returns the number embedded.
    async fn embed_and_upsert(&self, chunks: &[Chunk]) -> Result<usize> {
        let (Some(embeddings), Some(vectors)) = (&self.embeddings, &self.vectors) else {
            debug!("No embedding provider configured, skipping embeddings");
            return Ok(0);
        };
        if chunks.is_empty() {
            return Ok(0);
        }

        let batch_size = embeddings.max_batch_size().max(1);
        let mut embedded = 0;

        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.embedding_text.clone()).collect();
            let batch_embeddings = embeddings.embed_batch(&texts).await?;
            if batch_embeddings.len() != batch.len() {
                bail!(
                    "Embedding provider returned {} vectors for {} texts",
                    batch_embeddings.len(),
                    batch.len()
                );
            }

            let records: Vec<VectorRecord> = batch
                .iter()
                .zip(batch_embeddings)
                .map(|(chunk, vector)| VectorRecord {
                    chunk_id: chunk.id.clone(),
                    document_id: chunk.document_id.clone(),
                    section_id: chunk.section_id.clone(),
                    vector,
                })
                .collect();

            vectors.upsert(records).await?;
            embedded += batch.len();
            debug!("Embedded {}/{} chunks", embedded, chunks.len());
        }

        info!(
            "Embedded {} chunks with {} into {}",
            embedded,
            embeddings.model_name(),
            vectors.name()
        );
        Ok(embedded)
    }
}
