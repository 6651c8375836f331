//! Retrieval units derived from sections.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::section::{ComplianceRelevance, Document, EntityKind};

/// Sections whose full text is shorter than this (after trimming) are not indexed.
pub const DEFAULT_MIN_CHUNK_CHARS: usize = 50;

/// One section as seen by the lexical and vector indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `{document_id}_{section_id}`, suffixed on collision
    pub id: String,
    pub document_id: String,
    pub document_title: String,
    pub section_id: String,
    pub section_title: String,
    pub section_path: String,
    pub level: u8,
    /// Title and body, as lexically indexed
    pub content: String,
    /// Markup-free text sent to the embedding provider
    pub embedding_text: String,
    pub relevance: Option<ComplianceRelevance>,
    pub topics: Vec<String>,
    pub entities: BTreeMap<EntityKind, Vec<String>>,
}

/// Turn documents into chunks, one per sufficiently long section.
pub fn create_chunks(documents: &[Document], min_chars: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut id_counts: HashMap<String, usize> = HashMap::new();

    for document in documents {
        for section in &document.sections {
            let content = section.full_text();
            if content.trim().chars().count() < min_chars {
                debug!("Skipping short section {}", section.id);
                continue;
            }

            let base_id = format!("{}_{}", document.id, section.id);
            let count = id_counts.entry(base_id.clone()).or_insert(0);
            let id = if *count == 0 {
                base_id.clone()
            } else {
                format!("{}_{}", base_id, count)
            };
            *count += 1;

            chunks.push(Chunk {
                id,
                document_id: document.id.clone(),
                document_title: document.title.clone(),
                section_id: section.id.clone(),
                section_title: section.title.clone(),
                section_path: section.path.clone(),
                level: section.level,
                content,
                embedding_text: section.embedding_text(),
                relevance: section.relevance,
                topics: section.topics.clone(),
                entities: section.entity_groups(),
            });
        }
    }

    debug!("Created {} chunks from {} documents", chunks.len(), documents.len());
    chunks
}
