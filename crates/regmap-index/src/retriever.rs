//! Hybrid retriever combining lexical, vector, HyDE and graph signals.
//!
//! A query runs through up to four sources:
//! - **Lexical**: BM25 over chunk text
//! - **Vector**: embedding similarity of the query
//! - **HyDE**: embedding similarity of a generated policy passage
//! - **Graph**: sections reached by expanding the first-pass hits through
//!   the entity graph
//!
//! The first three are fused with RRF, the graph list is built from that
//! first pass, and everything is fused again. Any optional source that is
//! missing, failing or slow is dropped for the query; only an unbuilt
//! lexical index is an error.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chunk::Chunk;
use crate::embeddings::EmbeddingProvider;
use crate::error::RetrievalError;
use crate::expander::{ExpansionCandidate, GraphExpander};
use crate::generation::PassageGenerator;
use crate::graph::EntityGraph;
use crate::search::{reciprocal_rank_fusion, BM25Index, FusedHit, RankedList, RetrievalSource, DEFAULT_RRF_K};
use crate::section::{ComplianceRelevance, EntityKind};
use crate::vector::VectorStore;
use crate::{DEFAULT_GRAPH_MAX_HOPS, DEFAULT_PER_RETRIEVER_K};

/// Divisor mapping expansion scores into `[0, 1]`.
pub const DEFAULT_GRAPH_SCORE_SCALE: f64 = 3.0;

/// Per-query retrieval options.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub use_lexical: bool,
    pub use_vector: bool,
    pub use_hyde: bool,
    pub use_graph: bool,
    /// Results fetched from each source before fusion
    pub per_retriever_k: usize,
    pub graph_max_hops: usize,
    pub rrf_k: f64,
    pub graph_score_scale: f64,
    pub embed_timeout: Duration,
    pub generate_timeout: Duration,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            use_lexical: true,
            use_vector: true,
            use_hyde: true,
            use_graph: true,
            per_retriever_k: DEFAULT_PER_RETRIEVER_K,
            graph_max_hops: DEFAULT_GRAPH_MAX_HOPS,
            rrf_k: DEFAULT_RRF_K,
            graph_score_scale: DEFAULT_GRAPH_SCORE_SCALE,
            embed_timeout: Duration::from_secs(30),
            generate_timeout: Duration::from_secs(60),
        }
    }
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// BM25 only.
    pub fn lexical_only() -> Self {
        Self {
            use_vector: false,
            use_hyde: false,
            use_graph: false,
            ..Self::default()
        }
    }

    pub fn with_lexical(mut self, enabled: bool) -> Self {
        self.use_lexical = enabled;
        self
    }

    pub fn with_vector(mut self, enabled: bool) -> Self {
        self.use_vector = enabled;
        self
    }

    pub fn with_hyde(mut self, enabled: bool) -> Self {
        self.use_hyde = enabled;
        self
    }

    pub fn with_graph(mut self, enabled: bool) -> Self {
        self.use_graph = enabled;
        self
    }

    pub fn with_per_retriever_k(mut self, k: usize) -> Self {
        self.per_retriever_k = k;
        self
    }

    pub fn with_graph_max_hops(mut self, hops: usize) -> Self {
        self.graph_max_hops = hops;
        self
    }

    pub fn with_rrf_k(mut self, k: f64) -> Self {
        self.rrf_k = k;
        self
    }

    pub fn with_graph_score_scale(mut self, scale: f64) -> Self {
        self.graph_score_scale = scale;
        self
    }

    pub fn with_timeouts(mut self, embed: Duration, generate: Duration) -> Self {
        self.embed_timeout = embed;
        self.generate_timeout = generate;
        self
    }
}

/// A retrieved section with its fused score and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub document_id: String,
    pub document_title: String,
    pub section_id: String,
    pub section_title: String,
    pub section_path: String,
    /// Heading level, 1 for `#`
    pub level: u8,
    pub content: String,
    pub relevance: Option<ComplianceRelevance>,
    pub topics: Vec<String>,
    pub entities: BTreeMap<EntityKind, Vec<String>>,
    /// Fused RRF score
    pub score: f64,
    pub sources: Vec<RetrievalSource>,
    /// Native score from each contributing source
    pub source_scores: BTreeMap<RetrievalSource, f64>,
}

impl RetrievalResult {
    fn from_hit(chunk: &Chunk, hit: &FusedHit) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            document_title: chunk.document_title.clone(),
            section_id: chunk.section_id.clone(),
            section_title: chunk.section_title.clone(),
            section_path: chunk.section_path.clone(),
            level: chunk.level,
            content: chunk.content.clone(),
            relevance: chunk.relevance,
            topics: chunk.topics.clone(),
            entities: chunk.entities.clone(),
            score: hit.score,
            sources: hit.sources.clone(),
            source_scores: hit.source_scores.clone(),
        }
    }

    pub fn found_by(&self, source: RetrievalSource) -> bool {
        self.sources.contains(&source)
    }
}

/// Results plus what was dropped along the way.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub results: Vec<RetrievalResult>,
    /// Sources that were requested but did not contribute
    pub skipped: Vec<RetrievalError>,
    /// Raw graph expansion output, before chunk mapping
    pub graph_candidates: Vec<ExpansionCandidate>,
}

impl SearchOutcome {
    pub fn was_skipped(&self, source: RetrievalSource) -> bool {
        self.skipped.iter().any(|e| e.retriever() == Some(source))
    }
}

/// Read-only query engine over built indexes.
///
/// Cheap to clone; every component sits behind an `Arc`.
#[derive(Clone)]
pub struct HybridRetriever {
    lexical: Arc<BM25Index>,
    vectors: Option<Arc<dyn VectorStore>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    generator: Option<Arc<dyn PassageGenerator>>,
    graph: Option<Arc<EntityGraph>>,
}

impl HybridRetriever {
    pub fn new(lexical: Arc<BM25Index>) -> Self {
        Self {
            lexical,
            vectors: None,
            embedder: None,
            generator: None,
            graph: None,
        }
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vectors = Some(store);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn PassageGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_graph(mut self, graph: Arc<EntityGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn lexical(&self) -> &BM25Index {
        &self.lexical
    }

    pub fn graph(&self) -> Option<&EntityGraph> {
        self.graph.as_deref()
    }

    /// Top `top_k` results for `query`.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        options: &SearchOptions,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        Ok(self.search_detailed(query, top_k, options).await?.results)
    }

    /// Like [`search`](Self::search), also reporting skipped sources.
    pub async fn search_detailed(
        &self,
        query: &str,
        top_k: usize,
        options: &SearchOptions,
    ) -> Result<SearchOutcome, RetrievalError> {
        if !self.lexical.is_built() {
            return Err(RetrievalError::NotBuilt("lexical index".to_string()));
        }

        let k = options.per_retriever_k;
        let mut lists = Vec::new();
        let mut skipped = Vec::new();

        if options.use_lexical {
            let entries = self.lexical.search(query, k)?;
            debug!("Lexical search: {} hits", entries.len());
            lists.push(RankedList::new(RetrievalSource::Lexical, entries));
        }

        let (vector, hyde) = tokio::join!(
            async {
                if options.use_vector {
                    Some(self.vector_search(query, options).await)
                } else {
                    None
                }
            },
            async {
                if options.use_hyde {
                    Some(self.hyde_search(query, options).await)
                } else {
                    None
                }
            }
        );
        for outcome in [vector, hyde].into_iter().flatten() {
            match outcome {
                Ok(list) => lists.push(list),
                Err(err) => record_skip(err, &mut skipped),
            }
        }

        let mut fused = reciprocal_rank_fusion(&lists, options.rrf_k);
        let mut graph_candidates = Vec::new();

        if options.use_graph {
            match self.graph_search(query, &fused, options) {
                Ok((list, candidates)) => {
                    graph_candidates = candidates;
                    if !list.is_empty() {
                        lists.push(list);
                        fused = reciprocal_rank_fusion(&lists, options.rrf_k);
                    }
                }
                Err(err) => record_skip(err, &mut skipped),
            }
        }

        let results: Vec<RetrievalResult> = fused
            .iter()
            .filter_map(|hit| {
                self.lexical
                    .chunk(&hit.id)
                    .map(|chunk| RetrievalResult::from_hit(chunk, hit))
            })
            .take(top_k)
            .collect();

        debug!(
            sources = lists.len(),
            skipped = skipped.len(),
            results = results.len(),
            "Hybrid search complete"
        );

        Ok(SearchOutcome {
            results,
            skipped,
            graph_candidates,
        })
    }

    async fn vector_search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<RankedList, RetrievalError> {
        let source = RetrievalSource::Vector;
        let (embedder, store) = self.vector_collaborators(source)?;

        let embedding = with_timeout(
            source,
            "query embedding",
            options.embed_timeout,
            embedder.embed(query),
        )
        .await?;
        self.nearest(source, store, &embedding, options).await
    }

    async fn hyde_search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<RankedList, RetrievalError> {
        let source = RetrievalSource::Hyde;
        let generator = self.generator.as_ref().ok_or_else(|| RetrievalError::Configuration {
            retriever: source,
            reason: "no passage generator configured".to_string(),
        })?;
        let (embedder, store) = self.vector_collaborators(source)?;

        let passage = with_timeout(
            source,
            "passage generation",
            options.generate_timeout,
            generator.generate(query),
        )
        .await?;
        debug!("HyDE passage: {} chars", passage.len());

        let embedding = with_timeout(
            source,
            "passage embedding",
            options.embed_timeout,
            embedder.embed(&passage),
        )
        .await?;
        self.nearest(source, store, &embedding, options).await
    }

    fn vector_collaborators(
        &self,
        source: RetrievalSource,
    ) -> Result<(&Arc<dyn EmbeddingProvider>, &Arc<dyn VectorStore>), RetrievalError> {
        let embedder = self.embedder.as_ref().ok_or_else(|| RetrievalError::Configuration {
            retriever: source,
            reason: "no embedding provider configured".to_string(),
        })?;
        let store = self.vectors.as_ref().ok_or_else(|| RetrievalError::Configuration {
            retriever: source,
            reason: "no vector store configured".to_string(),
        })?;
        Ok((embedder, store))
    }

    async fn nearest(
        &self,
        source: RetrievalSource,
        store: &Arc<dyn VectorStore>,
        embedding: &[f32],
        options: &SearchOptions,
    ) -> Result<RankedList, RetrievalError> {
        let hits = with_timeout(
            source,
            "vector search",
            options.embed_timeout,
            store.search(embedding, options.per_retriever_k),
        )
        .await?;
        debug!("{} search: {} hits from {}", source, hits.len(), store.name());

        let entries = hits
            .into_iter()
            .map(|hit| (hit.chunk_id, hit.score as f64))
            .collect();
        Ok(RankedList::new(source, entries))
    }

    fn graph_search(
        &self,
        query: &str,
        first_pass: &[FusedHit],
        options: &SearchOptions,
    ) -> Result<(RankedList, Vec<ExpansionCandidate>), RetrievalError> {
        let graph = self.graph.as_deref().ok_or_else(|| RetrievalError::Configuration {
            retriever: RetrievalSource::Graph,
            reason: "no entity graph loaded".to_string(),
        })?;

        let mut seen = HashSet::new();
        let seed_sections: Vec<String> = first_pass
            .iter()
            .take(options.per_retriever_k)
            .filter_map(|hit| self.lexical.chunk(&hit.id))
            .map(|chunk| chunk.section_id.clone())
            .filter(|section_id| seen.insert(section_id.clone()))
            .collect();

        let candidates = GraphExpander::new(graph)
            .with_max_hops(options.graph_max_hops)
            .with_max_results(options.per_retriever_k)
            .expand(&seed_sections, query);

        let entries = candidates
            .iter()
            .filter_map(|candidate| {
                self.lexical
                    .chunk_for_section(&candidate.section_id)
                    .map(|chunk| {
                        (
                            chunk.id.clone(),
                            graph_score(candidate.score, options.graph_score_scale),
                        )
                    })
            })
            .collect::<Vec<_>>();
        debug!(
            "Graph expansion: {} seed sections, {} candidates, {} indexed",
            seed_sections.len(),
            candidates.len(),
            entries.len()
        );

        Ok((RankedList::new(RetrievalSource::Graph, entries), candidates))
    }
}

/// Scale an expansion score into `[0, 1]`.
fn graph_score(score: f64, scale: f64) -> f64 {
    if scale > 0.0 {
        (score / scale).min(1.0)
    } else {
        score.min(1.0)
    }
}

fn record_skip(err: RetrievalError, skipped: &mut Vec<RetrievalError>) {
    match &err {
        RetrievalError::Transient { .. } => warn!("{}", err),
        _ => debug!("{}", err),
    }
    skipped.push(err);
}

async fn with_timeout<T, F>(
    source: RetrievalSource,
    what: &str,
    limit: Duration,
    call: F,
) -> Result<T, RetrievalError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RetrievalError::Transient {
            retriever: source,
            reason: format!("{} failed: {:#}", what, e),
        }),
        Err(_) => Err(RetrievalError::Transient {
            retriever: source,
            reason: format!("{} timed out after {:?}", what, limit),
        }),
    }
}
