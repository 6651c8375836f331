//! Rank fusion across retrieval sources.
//!
//! Each retriever produces a ranked list of chunk ids. Reciprocal Rank
//! Fusion (RRF) merges any number of such lists using ranks only, so raw
//! scores from different retrievers never have to be comparable.

pub mod bm25;

pub use bm25::BM25Index;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default RRF smoothing constant.
pub const DEFAULT_RRF_K: f64 = 60.0;

/// Origin of a ranked list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSource {
    Lexical,
    Vector,
    Hyde,
    Graph,
}

impl RetrievalSource {
    pub fn label(&self) -> &'static str {
        match self {
            RetrievalSource::Lexical => "lexical",
            RetrievalSource::Vector => "vector",
            RetrievalSource::Hyde => "hyde",
            RetrievalSource::Graph => "graph",
        }
    }
}

impl fmt::Display for RetrievalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One retriever's output: `(id, score)` pairs, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedList {
    pub source: RetrievalSource,
    pub entries: Vec<(String, f64)>,
}

impl RankedList {
    pub fn new(source: RetrievalSource, entries: Vec<(String, f64)>) -> Self {
        Self { source, entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A fused entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedHit {
    pub id: String,
    /// Sum of RRF contributions
    pub score: f64,
    /// Sources that ranked this id, in first-seen order
    pub sources: Vec<RetrievalSource>,
    /// Original score per source
    pub source_scores: BTreeMap<RetrievalSource, f64>,
}

/// Reciprocal Rank Fusion over any number of ranked lists.
///
/// Each entry at 0-based rank `r` adds `1 / (k + r + 1)` to its id. Output
/// is sorted by fused score, descending; equal scores keep the order in
/// which ids first appeared across the input lists. Pure: the same input
/// always produces the same output.
pub fn reciprocal_rank_fusion(lists: &[RankedList], k: f64) -> Vec<FusedHit> {
    let mut fused: Vec<FusedHit> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for list in lists {
        for (rank, (id, original_score)) in list.entries.iter().enumerate() {
            let contribution = 1.0 / (k + rank as f64 + 1.0);

            let position = *positions.entry(id.as_str()).or_insert_with(|| {
                fused.push(FusedHit {
                    id: id.clone(),
                    score: 0.0,
                    sources: Vec::new(),
                    source_scores: BTreeMap::new(),
                });
                fused.len() - 1
            });

            let hit = &mut fused[position];
            hit.score += contribution;
            if !hit.sources.contains(&list.source) {
                hit.sources.push(list.source);
            }
            hit.source_scores.entry(list.source).or_insert(*original_score);
        }
    }

    // Stable sort keeps first-appearance order among ties
    fused.sort_by(|a, b| b.score.total_cmp(&a.score));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(source: RetrievalSource, ids: &[&str]) -> RankedList {
        RankedList::new(
            source,
            ids.iter()
                .enumerate()
                .map(|(i, id)| (id.to_string(), 1.0 / (i as f64 + 1.0)))
                .collect(),
        )
    }

    #[test]
    fn test_rrf_basic() {
        let fused = reciprocal_rank_fusion(
            &[
                list(RetrievalSource::Lexical, &["a", "b", "c"]),
                list(RetrievalSource::Vector, &["b", "c", "d"]),
            ],
            DEFAULT_RRF_K,
        );

        let ids: Vec<_> = fused.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a", "d"]);
        assert!((fused[0].score - (1.0 / 61.0 + 1.0 / 62.0)).abs() < 1e-12);
        assert_eq!(
            fused[0].sources,
            vec![RetrievalSource::Lexical, RetrievalSource::Vector]
        );
    }

    #[test]
    fn test_rrf_single_source() {
        let fused = reciprocal_rank_fusion(&[list(RetrievalSource::Vector, &["doc1", "doc2"])], 60.0);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].id, "doc1");
    }

    #[test]
    fn test_rrf_empty_inputs() {
        assert!(reciprocal_rank_fusion(&[], 60.0).is_empty());
        assert!(reciprocal_rank_fusion(&[list(RetrievalSource::Lexical, &[])], 60.0).is_empty());
    }

    #[test]
    fn test_rrf_ties_keep_first_appearance() {
        let fused = reciprocal_rank_fusion(
            &[
                list(RetrievalSource::Lexical, &["x"]),
                list(RetrievalSource::Vector, &["y"]),
            ],
            60.0,
        );
        assert_eq!(fused[0].id, "x");
        assert_eq!(fused[1].id, "y");
        assert!((fused[0].score - fused[1].score).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rrf_source_scores_keep_first_occurrence() {
        let repeated = RankedList::new(
            RetrievalSource::Graph,
            vec![("a".to_string(), 0.9), ("a".to_string(), 0.1)],
        );
        let fused = reciprocal_rank_fusion(&[repeated], 60.0);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].source_scores[&RetrievalSource::Graph], 0.9);
        assert_eq!(fused[0].sources, vec![RetrievalSource::Graph]);
        assert!((fused[0].score - (1.0 / 61.0 + 1.0 / 62.0)).abs() < 1e-12);
    }

    #[test]
    fn test_rrf_k_parameter_effect() {
        let input = [list(RetrievalSource::Lexical, &["doc1", "doc2"])];

        let low = reciprocal_rank_fusion(&input, 10.0);
        let high = reciprocal_rank_fusion(&input, 100.0);

        assert!(low[0].score - low[1].score > high[0].score - high[1].score);
    }

    #[test]
    fn test_rrf_ordering_stability() {
        let input = [
            list(RetrievalSource::Lexical, &["a", "b", "c"]),
            list(RetrievalSource::Hyde, &["c", "b", "a"]),
        ];

        let first = reciprocal_rank_fusion(&input, 60.0);
        let second = reciprocal_rank_fusion(&input, 60.0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_source_labels() {
        assert_eq!(RetrievalSource::Hyde.to_string(), "hyde");
        assert_eq!(
            serde_json::to_string(&RetrievalSource::Graph).unwrap(),
            "\"graph\""
        );
    }
}
