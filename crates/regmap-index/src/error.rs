//! Error types shared by ingestion and retrieval.

use thiserror::Error;

use crate::search::RetrievalSource;

/// Errors raised while answering a query.
///
/// Only [`RetrievalError::NotBuilt`] is ever returned from
/// [`HybridRetriever::search`](crate::retriever::HybridRetriever::search).
/// The other variants describe a retrieval source that was dropped for the
/// current query and are reported through
/// [`SearchOutcome::skipped`](crate::retriever::SearchOutcome).
#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    /// A requested source has no collaborator to run with.
    #[error("{retriever} retrieval unavailable: {reason}")]
    Configuration {
        retriever: RetrievalSource,
        reason: String,
    },

    /// An index was searched before it was built or loaded.
    #[error("index not built: {0}")]
    NotBuilt(String),

    /// An external call failed or timed out.
    #[error("{retriever} retrieval failed: {reason}")]
    Transient {
        retriever: RetrievalSource,
        reason: String,
    },
}

impl RetrievalError {
    /// The source this error dropped, if it concerns a single source.
    pub fn retriever(&self) -> Option<RetrievalSource> {
        match self {
            RetrievalError::Configuration { retriever, .. }
            | RetrievalError::Transient { retriever, .. } => Some(*retriever),
            RetrievalError::NotBuilt(_) => None,
        }
    }

    /// Whether the caller can keep going without the affected source.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, RetrievalError::NotBuilt(_))
    }
}

/// A malformed input document. The document is skipped; ingestion continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("skipping document {document}: {reason}")]
pub struct ParseInconsistency {
    /// Document id, or the file name when no id could be read.
    pub document: String,
    pub reason: String,
}

impl ParseInconsistency {
    pub fn new(document: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            reason: reason.into(),
        }
    }
}
