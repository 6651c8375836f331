//! BM25 keyword search over section chunks.
//!
//! The index also serves as the chunk catalog: retrieval hydrates results
//! from here and resolves chunk ids to their sections.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::chunk::Chunk;
use crate::error::RetrievalError;

/// BM25 parameters
const K1: f64 = 1.2; // Term frequency saturation
const B: f64 = 0.75; // Length normalization

/// What gets written to disk. Statistics are recomputed on load.
#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    chunks: Vec<Chunk>,
    tokenized_corpus: Vec<Vec<String>>,
}

/// BM25 search index
#[derive(Debug, Clone, Default)]
pub struct BM25Index {
    /// Indexed chunks, in corpus order
    chunks: Vec<Chunk>,
    /// Tokens per chunk, parallel to `chunks`
    tokenized_corpus: Vec<Vec<String>>,
    /// Term counts per chunk
    term_freqs: Vec<HashMap<String, usize>>,
    /// Number of chunks containing each term
    doc_freqs: HashMap<String, usize>,
    /// Average chunk length (in tokens)
    avg_doc_length: f64,
    /// Chunk id -> position
    positions: HashMap<String, usize>,
    /// Section id -> position of its first chunk
    section_positions: HashMap<String, usize>,
    built: bool,
}

impl BM25Index {
    /// Create a new empty, unbuilt index
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the index over a set of chunks.
    pub fn build(chunks: Vec<Chunk>) -> Self {
        let tokenized_corpus = chunks.iter().map(|c| Self::tokenize(&c.content)).collect();
        Self::from_parts(chunks, tokenized_corpus)
    }

    fn from_parts(chunks: Vec<Chunk>, tokenized_corpus: Vec<Vec<String>>) -> Self {
        let mut term_freqs = Vec::with_capacity(tokenized_corpus.len());
        let mut doc_freqs: HashMap<String, usize> = HashMap::new();

        for tokens in &tokenized_corpus {
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for token in tokens {
                *freqs.entry(token.clone()).or_insert(0) += 1;
            }
            let unique_terms: HashSet<_> = tokens.iter().collect();
            for term in unique_terms {
                *doc_freqs.entry(term.clone()).or_insert(0) += 1;
            }
            term_freqs.push(freqs);
        }

        let total_length: usize = tokenized_corpus.iter().map(Vec::len).sum();
        let avg_doc_length = if tokenized_corpus.is_empty() {
            0.0
        } else {
            total_length as f64 / tokenized_corpus.len() as f64
        };

        let mut positions = HashMap::with_capacity(chunks.len());
        let mut section_positions = HashMap::new();
        for (position, chunk) in chunks.iter().enumerate() {
            positions.insert(chunk.id.clone(), position);
            section_positions
                .entry(chunk.section_id.clone())
                .or_insert(position);
        }

        Self {
            chunks,
            tokenized_corpus,
            term_freqs,
            doc_freqs,
            avg_doc_length,
            positions,
            section_positions,
            built: true,
        }
    }

    /// Tokenize text into terms
    pub fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|s| !s.is_empty() && s.chars().count() > 1)
            .map(String::from)
            .collect()
    }

    /// Calculate IDF for a term
    fn calculate_idf(&self, term: &str) -> f64 {
        let doc_freq = self.doc_freqs.get(term).copied().unwrap_or(0) as f64;
        if doc_freq == 0.0 {
            return 0.0;
        }

        let n = self.chunks.len() as f64;
        ((n - doc_freq + 0.5) / (doc_freq + 0.5) + 1.0).ln()
    }

    /// Calculate BM25 score for a chunk given a query
    fn score_position(&self, position: usize, query_terms: &[String]) -> f64 {
        let term_freqs = &self.term_freqs[position];
        let doc_length = self.tokenized_corpus[position].len() as f64;

        let mut score = 0.0;

        for term in query_terms {
            let tf = term_freqs.get(term.as_str()).copied().unwrap_or(0) as f64;

            if tf > 0.0 {
                let idf = self.calculate_idf(term);
                let numerator = tf * (K1 + 1.0);
                let denominator = tf + K1 * (1.0 - B + B * (doc_length / self.avg_doc_length));
                score += idf * (numerator / denominator);
            }
        }

        score
    }

    /// Search the index and return `(chunk_id, score)` ranked by score.
    ///
    /// Only positive scores are returned. Equal scores keep corpus order.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<(String, f64)>, RetrievalError> {
        if !self.built {
            return Err(RetrievalError::NotBuilt("lexical index".to_string()));
        }

        let query_terms = Self::tokenize(query);
        if query_terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut scores: Vec<(usize, f64)> = (0..self.chunks.len())
            .map(|position| (position, self.score_position(position, &query_terms)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        // Stable sort, score descending
        scores.sort_by(|a, b| b.1.total_cmp(&a.1));
        scores.truncate(limit);

        Ok(scores
            .into_iter()
            .map(|(position, score)| (self.chunks[position].id.clone(), score))
            .collect())
    }

    /// Whether the index has been built or loaded.
    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Look up a chunk by id
    pub fn chunk(&self, id: &str) -> Option<&Chunk> {
        self.positions.get(id).map(|&position| &self.chunks[position])
    }

    /// First chunk of a section, if the section was indexed.
    pub fn chunk_for_section(&self, section_id: &str) -> Option<&Chunk> {
        self.section_positions
            .get(section_id)
            .map(|&position| &self.chunks[position])
    }

    /// All chunks in corpus order
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Get the number of chunks in the index
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of distinct terms
    pub fn vocabulary_size(&self) -> usize {
        self.doc_freqs.len()
    }

    /// Save the index to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let persisted = PersistedIndex {
            chunks: self.chunks.clone(),
            tokenized_corpus: self.tokenized_corpus.clone(),
        };
        let json = serde_json::to_string(&persisted)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write lexical index: {:?}", path))?;
        Ok(())
    }

    /// Load the index from a file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading lexical index from: {:?}", path);
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read lexical index: {:?}", path))?;
        let persisted: PersistedIndex =
            serde_json::from_str(&json).context("Failed to parse lexical index")?;

        if persisted.chunks.len() != persisted.tokenized_corpus.len() {
            anyhow::bail!(
                "Lexical index is corrupt: {} chunks but {} token lists",
                persisted.chunks.len(),
                persisted.tokenized_corpus.len()
            );
        }

        Ok(Self::from_parts(persisted.chunks, persisted.tokenized_corpus))
    }
}
