//! Hybrid retrieval for mapping regulatory requirements to policy sections.
//!
//! This crate provides:
//! - A normalized section/entity model and section providers (annotated markdown, JSON)
//! - BM25 lexical search over section chunks
//! - Vector search over externally computed embeddings (flat index or Qdrant)
//! - An entity knowledge graph over documents, sections and entities
//! - Multi-hop graph expansion seeded from first-pass results
//! - Reciprocal Rank Fusion and the hybrid retriever that drives it
//! - Snapshot persistence for the lexical index and the graph

pub mod chunk;
pub mod embeddings;
pub mod error;
pub mod expander;
pub mod generation;
pub mod graph;
pub mod graph_builder;
pub mod indexer;
pub mod provider;
pub mod qdrant;
pub mod retriever;
pub mod search;
pub mod section;
pub mod storage;
pub mod vector;

// Re-exports
pub use chunk::{create_chunks, Chunk, DEFAULT_MIN_CHUNK_CHARS};
pub use embeddings::{EmbeddingProvider, HttpEmbeddings};
pub use error::{ParseInconsistency, RetrievalError};
pub use expander::{ExpansionCandidate, ExpansionConfig, GraphExpander};
pub use generation::{ChatPassageGenerator, PassageGenerator};
pub use graph::{Edge, EdgeKind, EntityContext, EntityGraph, GraphError, GraphStats, Node, NodeId, NodeKind};
pub use graph_builder::GraphBuilder;
pub use indexer::{BuiltIndexes, Indexer, IndexerConfig, IndexStats};
pub use provider::{JsonCorpusProvider, MarkdownProvider, ProvidedCorpus, SectionProvider};
pub use retriever::{HybridRetriever, RetrievalResult, SearchOptions, SearchOutcome};
pub use search::{reciprocal_rank_fusion, BM25Index, FusedHit, RankedList, RetrievalSource, DEFAULT_RRF_K};
pub use section::{normalize_key, ComplianceRelevance, Document, DocumentReference, EntityKind, EntityRef, Section};
pub use storage::{IndexStore, GraphSnapshot, DEFAULT_INDEX_DIR};
pub use vector::{FlatVectorIndex, VectorHit, VectorRecord, VectorStore};

/// Default number of results fetched from each retriever before fusion.
pub const DEFAULT_PER_RETRIEVER_K: usize = 20;

/// Default maximum hop count for graph expansion.
pub const DEFAULT_GRAPH_MAX_HOPS: usize = 2;
