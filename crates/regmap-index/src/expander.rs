//! Multi-hop graph expansion.
//!
//! Starting from the sections found by a first retrieval pass, the expander
//! collects their entities plus any entities recognized in the query text,
//! walks the entity subgraph up to a hop limit and proposes other sections
//! that mention the entities it reached.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::graph::EntityGraph;
use crate::section::{entity_node_id, EntityKind};

/// Weight of an indirect (hop-reached) entity match.
const INDIRECT_WEIGHT: f64 = 0.5;

/// Score deducted per hop of each indirect match.
const HOP_PENALTY: f64 = 0.1;

/// Compliance vocabulary recognized in free-text queries.
static QUERY_VOCABULARY: Lazy<Vec<(EntityKind, Regex)>> = Lazy::new(|| {
    let patterns: [(EntityKind, &str); 5] = [
        (
            EntityKind::Role,
            r"\b(CISO|CTO|CEO|IT\s+Manager|Security\s+Officer|Administrator|Information\s+Security\s+Team|Security\s+Team|IT\s+Team)\b",
        ),
        (
            EntityKind::Control,
            r"\b(MFA|multi-factor\s+authentication|two-factor|2FA|encryption|firewall|IDS|IPS|antivirus|anti-malware|access\s+control|password|authentication|authorization|backup|disaster\s+recovery|incident\s+response|vulnerability\s+assessment|penetration\s+testing|security\s+audit)\b",
        ),
        (
            EntityKind::Asset,
            r"\b(server|database|network|application|system|endpoint|workstation|laptop|mobile\s+device)\b",
        ),
        (
            EntityKind::Process,
            r"\b(risk\s+assessment|incident\s+management|change\s+management|access\s+review|security\s+monitoring|log\s+review)\b",
        ),
        (
            EntityKind::Framework,
            r"\b(ISO\s*27001|SEBI|CSCRF|CERT-IN|NIST|SOC\s*2)\b",
        ),
    ];
    patterns
        .into_iter()
        .map(|(kind, pattern)| (kind, Regex::new(&format!("(?i){}", pattern)).unwrap()))
        .collect()
});

/// Configuration for graph expansion.
#[derive(Debug, Clone)]
pub struct ExpansionConfig {
    /// Maximum BFS depth from each seed entity
    pub max_hops: usize,
    /// Maximum number of candidates returned
    pub max_results: usize,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            max_hops: crate::DEFAULT_GRAPH_MAX_HOPS,
            max_results: 10,
        }
    }
}

impl ExpansionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_hops(mut self, hops: usize) -> Self {
        self.max_hops = hops;
        self
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = max;
        self
    }
}

/// A section proposed by graph expansion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpansionCandidate {
    pub section_id: String,
    /// Seed or related entities linking to this section, sorted
    pub source_entities: Vec<String>,
    /// 0 if any entity is a seed, else the closest related entity's hop count
    pub hop_distance: usize,
    pub score: f64,
    pub direct_matches: usize,
    pub indirect_matches: usize,
}

/// Expands seed sections through the entity graph.
pub struct GraphExpander<'g> {
    graph: &'g EntityGraph,
    config: ExpansionConfig,
}

impl<'g> GraphExpander<'g> {
    pub fn new(graph: &'g EntityGraph) -> Self {
        Self {
            graph,
            config: ExpansionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExpansionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_max_hops(mut self, hops: usize) -> Self {
        self.config.max_hops = hops;
        self
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.config.max_results = max;
        self
    }

    /// Entity node ids recognized in free text that exist in the graph.
    pub fn query_entities(&self, query: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        for (kind, pattern) in QUERY_VOCABULARY.iter() {
            for capture in pattern.captures_iter(query) {
                if let Some(value) = capture.get(1) {
                    let id = entity_node_id(*kind, value.as_str());
                    if self.graph.contains_node(&id) {
                        found.insert(id);
                    }
                }
            }
        }
        found
    }

    /// Entities reachable from the seeds within `max_hops`, with their
    /// minimum hop distance. Only entity nodes are traversed; seeds
    /// themselves are not included.
    pub fn related_entities(&self, seeds: &BTreeSet<String>) -> BTreeMap<String, usize> {
        let mut related: BTreeMap<String, usize> = BTreeMap::new();

        for seed in seeds {
            let Some(start) = self.graph.node_id(seed) else {
                continue;
            };

            let mut visited = HashSet::from([start]);
            let mut queue = VecDeque::from([(start, 0usize)]);

            while let Some((current, depth)) = queue.pop_front() {
                if depth >= self.config.max_hops {
                    continue;
                }
                for neighbor in self.graph.neighbors(current) {
                    let Some(node) = self.graph.get(neighbor) else {
                        continue;
                    };
                    if !node.kind.is_entity() || !visited.insert(neighbor) {
                        continue;
                    }
                    let distance = depth + 1;
                    related
                        .entry(node.id.clone())
                        .and_modify(|d| *d = (*d).min(distance))
                        .or_insert(distance);
                    queue.push_back((neighbor, distance));
                }
            }
        }

        for seed in seeds {
            related.remove(seed);
        }
        related
    }

    /// Expand from the sections already retrieved and the query text.
    pub fn expand(&self, seed_sections: &[String], query: &str) -> Vec<ExpansionCandidate> {
        let mut seeds = self.query_entities(query);
        for section_id in seed_sections {
            if let Some(entities) = self.graph.entities_for_section(section_id) {
                seeds.extend(entities.iter().cloned());
            }
        }

        let exclude: HashSet<&str> = seed_sections.iter().map(String::as_str).collect();
        self.expand_entities(&seeds, &exclude)
    }

    /// Expand from an explicit set of seed entities, never proposing
    /// sections in `exclude`.
    pub fn expand_entities(
        &self,
        seeds: &BTreeSet<String>,
        exclude: &HashSet<&str>,
    ) -> Vec<ExpansionCandidate> {
        if seeds.is_empty() {
            return Vec::new();
        }

        let related = self.related_entities(seeds);
        debug!(
            seeds = seeds.len(),
            related = related.len(),
            "Expanding through entity graph"
        );

        // Section -> linking entities (sorted, distinct)
        let mut candidates: HashMap<String, BTreeSet<&str>> = HashMap::new();
        for entity in seeds.iter().chain(related.keys()) {
            let Some(sections) = self.graph.sections_for_entity(entity) else {
                continue;
            };
            for section_id in sections {
                if exclude.contains(section_id.as_str()) {
                    continue;
                }
                candidates
                    .entry(section_id.clone())
                    .or_default()
                    .insert(entity.as_str());
            }
        }

        let mut results: Vec<ExpansionCandidate> = candidates
            .into_iter()
            .map(|(section_id, entities)| {
                let mut direct_matches = 0;
                let mut indirect_matches = 0;
                let mut hop_sum = 0usize;
                let mut min_hops = usize::MAX;

                for entity in &entities {
                    if seeds.contains(*entity) {
                        direct_matches += 1;
                    } else if let Some(&hops) = related.get(*entity) {
                        indirect_matches += 1;
                        hop_sum += hops;
                        min_hops = min_hops.min(hops);
                    }
                }

                let score = direct_matches as f64 + INDIRECT_WEIGHT * indirect_matches as f64
                    - HOP_PENALTY * hop_sum as f64;
                let hop_distance = if direct_matches > 0 { 0 } else { min_hops };

                ExpansionCandidate {
                    section_id,
                    source_entities: entities.into_iter().map(String::from).collect(),
                    hop_distance,
                    score,
                    direct_matches,
                    indirect_matches,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.section_id.cmp(&b.section_id))
        });
        results.truncate(self.config.max_results);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sections: S1 {mfa, ciso}, S2 {mfa}, S3 {ciso, vpn}, S4 {vpn}
    fn graph() -> EntityGraph {
        let mut graph = EntityGraph::new();
        let doc = graph.add_document("D", "Doc");
        let mfa = graph.add_entity(EntityKind::Control, "MFA");
        let ciso = graph.add_entity(EntityKind::Role, "CISO");
        let vpn = graph.add_entity(EntityKind::Asset, "VPN");

        let sections: [(&str, Vec<_>); 4] = [
            ("S1", vec![mfa, ciso]),
            ("S2", vec![mfa]),
            ("S3", vec![ciso, vpn]),
            ("S4", vec![vpn]),
        ];
        for (id, entities) in sections {
            let section = graph.add_section(id, id, "D");
            graph.contain(doc, section);
            for &entity in &entities {
                graph.link_section_entity(section, entity);
            }
            for (i, &a) in entities.iter().enumerate() {
                for &b in &entities[i + 1..] {
                    graph.add_co_occurrence(a, b, 1);
                }
            }
        }
        graph
    }

    fn seeds(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_query_entities() {
        let graph = graph();
        let expander = GraphExpander::new(&graph);
        let found = expander.query_entities("The ciso must enforce MFA on every VPN");
        assert_eq!(found, seeds(&["control:mfa", "role:ciso"]));

        // Recognized but absent from the graph
        assert!(expander.query_entities("Encryption at rest").is_empty());
    }

    #[test]
    fn test_related_entities_hops() {
        let graph = graph();
        let expander = GraphExpander::new(&graph);

        let related = expander.related_entities(&seeds(&["control:mfa"]));
        assert_eq!(related.get("role:ciso"), Some(&1));
        assert_eq!(related.get("asset:vpn"), Some(&2));
        assert!(!related.contains_key("control:mfa"));

        let one_hop = GraphExpander::new(&graph)
            .with_max_hops(1)
            .related_entities(&seeds(&["control:mfa"]));
        assert!(!one_hop.contains_key("asset:vpn"));
    }

    #[test]
    fn test_sections_do_not_bridge_entities() {
        let mut graph = EntityGraph::new();
        let a = graph.add_entity(EntityKind::Control, "A");
        let b = graph.add_entity(EntityKind::Control, "B");
        let section = graph.add_section("S", "S", "D");
        graph.link_section_entity(section, a);
        graph.link_section_entity(section, b);

        let related = GraphExpander::new(&graph).related_entities(&seeds(&["control:a"]));
        assert!(related.is_empty());
    }

    #[test]
    fn test_zero_hops_only_direct_matches() {
        let graph = graph();
        let results = GraphExpander::new(&graph)
            .with_max_hops(0)
            .expand_entities(&seeds(&["control:mfa"]), &HashSet::new());

        let ids: Vec<_> = results.iter().map(|c| c.section_id.as_str()).collect();
        assert_eq!(ids, vec!["S1", "S2"]);
        assert!(results.iter().all(|c| c.indirect_matches == 0 && c.hop_distance == 0));
    }

    #[test]
    fn test_expand_scoring_and_order() {
        let graph = graph();
        let expander = GraphExpander::new(&graph);
        let results = expander.expand_entities(&seeds(&["control:mfa"]), &HashSet::new());

        // S1: direct mfa + indirect ciso(1) = 1 + 0.5 - 0.1 = 1.4
        // S2: direct mfa = 1.0
        // S3: indirect ciso(1) + vpn(2) = 1.0 - 0.3 = 0.7
        // S4: indirect vpn(2) = 0.5 - 0.2 = 0.3
        let ids: Vec<_> = results.iter().map(|c| c.section_id.as_str()).collect();
        assert_eq!(ids, vec!["S1", "S2", "S3", "S4"]);
        assert!((results[0].score - 1.4).abs() < 1e-9);
        assert_eq!(results[0].hop_distance, 0);
        assert_eq!((results[0].direct_matches, results[0].indirect_matches), (1, 1));
        assert!((results[2].score - 0.7).abs() < 1e-9);
        assert_eq!(results[2].hop_distance, 1);
        assert_eq!(results[3].hop_distance, 2);
        assert_eq!(results[2].source_entities, vec!["asset:vpn", "role:ciso"]);
    }

    #[test]
    fn test_distant_matches_keep_negative_scores() {
        // Chain E0 - E1 - ... - E7, each entity in its own section.
        let mut graph = EntityGraph::new();
        let entities: Vec<_> = (0..8)
            .map(|i| graph.add_entity(EntityKind::Control, &format!("E{}", i)))
            .collect();
        for (i, &entity) in entities.iter().enumerate() {
            let id = format!("S{}", i);
            let section = graph.add_section(&id, &id, "D");
            graph.link_section_entity(section, entity);
        }
        for pair in entities.windows(2) {
            graph.add_co_occurrence(pair[0], pair[1], 1);
        }

        let results = GraphExpander::new(&graph)
            .with_max_hops(10)
            .expand_entities(&seeds(&["control:e0"]), &HashSet::new());

        // S7 is 7 hops away: 0.5 - 0.7 = -0.2
        assert_eq!(results.len(), 8);
        let last = results.last().unwrap();
        assert_eq!(last.section_id, "S7");
        assert_eq!(last.hop_distance, 7);
        assert!((last.score + 0.2).abs() < 1e-9);
        assert!(results.iter().filter(|c| c.score < 0.0).count() >= 2);
    }

    #[test]
    fn test_query_entities_allow_whitespace_runs() {
        let mut graph = EntityGraph::new();
        graph.add_entity(EntityKind::Control, "multi-factor authentication");
        graph.add_entity(EntityKind::Role, "IT Manager");
        graph.add_entity(EntityKind::Framework, "ISO27001");
        graph.add_entity(EntityKind::Asset, "server");
        let expander = GraphExpander::new(&graph);

        let found = expander.query_entities("use multi-factor \n authentication per the IT  Manager");
        assert_eq!(
            found,
            seeds(&["control:multifactor_authentication", "role:it_manager"])
        );
        assert_eq!(expander.query_entities("ISO27001 audit"), seeds(&["framework:iso27001"]));
        assert!(expander.query_entities("all servers").is_empty());
        assert_eq!(expander.query_entities("the server"), seeds(&["asset:server"]));
    }

    #[test]
    fn test_expand_excludes_seed_sections() {
        let graph = graph();
        let expander = GraphExpander::new(&graph).with_max_results(2);
        let results = expander.expand(&["S1".to_string()], "");

        // Seeds come from S1: mfa and ciso. Related: vpn at 1 hop.
        assert!(results.iter().all(|c| c.section_id != "S1"));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].section_id, "S3");
    }

    #[test]
    fn test_ties_break_by_section_id() {
        let mut graph = EntityGraph::new();
        let mfa = graph.add_entity(EntityKind::Control, "MFA");
        for id in ["Z-1", "A-1", "M-1"] {
            let section = graph.add_section(id, id, "D");
            graph.link_section_entity(section, mfa);
        }

        let results = GraphExpander::new(&graph).expand_entities(&seeds(&["control:mfa"]), &HashSet::new());
        let ids: Vec<_> = results.iter().map(|c| c.section_id.as_str()).collect();
        assert_eq!(ids, vec!["A-1", "M-1", "Z-1"]);
    }

    #[test]
    fn test_no_seeds_no_candidates() {
        let graph = graph();
        let expander = GraphExpander::new(&graph);
        assert!(expander.expand(&[], "nothing recognizable here").is_empty());
        assert!(expander.expand(&["unknown".to_string()], "").is_empty());
    }
}
