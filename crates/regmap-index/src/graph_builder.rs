//! Graph builder for constructing an [`EntityGraph`] from documents.
//!
//! Each document contributes its own nodes and edges independently, so
//! documents can be processed in parallel and the partial graphs merged.
//! The merged graph is the same whatever the document order.

use rayon::prelude::*;
use tracing::{debug, info};

use crate::graph::{EdgeKind, EntityGraph};
use crate::section::{Document, EntityKind};

/// Accumulates documents into an entity graph.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: EntityGraph,
    documents: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document, its sections and all entity relations.
    pub fn add_document(&mut self, document: &Document) {
        let graph = &mut self.graph;
        let doc = graph.add_document(&document.id, &document.title);

        for entity in &document.entities {
            let node = graph.add_entity(entity.kind, &entity.value);
            graph.add_edge(doc, node, EdgeKind::Mentions);
        }

        for framework in &document.frameworks {
            let node = graph.add_entity(EntityKind::Framework, framework);
            graph.add_edge(doc, node, EdgeKind::GovernedBy);
        }

        for reference in &document.references {
            if reference.document_id == document.id {
                continue;
            }
            let title = reference
                .title
                .as_deref()
                .unwrap_or(reference.document_id.as_str());
            let target = graph.add_document_placeholder(&reference.document_id, title);
            graph.add_reference(doc, target, &reference.relationship);
        }

        for section in &document.sections {
            let section_node = graph.add_section(&section.id, &section.title, &document.id);
            graph.contain(doc, section_node);

            // Distinct entities in first-seen order
            let mut entity_nodes = Vec::new();
            for entity in &section.entities {
                let node = graph.add_entity(entity.kind, &entity.value);
                if !entity_nodes.contains(&node) {
                    entity_nodes.push(node);
                }
            }

            for &node in &entity_nodes {
                graph.link_section_entity(section_node, node);
            }

            for (i, &a) in entity_nodes.iter().enumerate() {
                for &b in &entity_nodes[i + 1..] {
                    graph.add_co_occurrence(a, b, 1);
                }
            }

            for topic in &section.topics {
                let node = graph.add_entity(EntityKind::Topic, topic);
                graph.add_edge(section_node, node, EdgeKind::MapsTo);
            }
        }

        self.documents += 1;
        debug!(
            "Added document to graph: {} ({} sections)",
            document.id,
            document.sections.len()
        );
    }

    /// Number of documents added so far.
    pub fn document_count(&self) -> usize {
        self.documents
    }

    /// Get a reference to the current graph.
    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    pub fn into_graph(self) -> EntityGraph {
        self.graph
    }

    /// Build a graph from documents one at a time.
    pub fn build(documents: &[Document]) -> EntityGraph {
        let mut builder = Self::new();
        for document in documents {
            builder.add_document(document);
        }
        log_built(&builder.graph, documents.len());
        builder.into_graph()
    }

    /// Build per-document graphs in parallel and merge them.
    pub fn build_parallel(documents: &[Document]) -> EntityGraph {
        let graph = documents
            .par_iter()
            .map(|document| {
                let mut builder = Self::new();
                builder.add_document(document);
                builder.into_graph()
            })
            .reduce(EntityGraph::new, |mut left, right| {
                left.merge(right);
                left
            });
        log_built(&graph, documents.len());
        graph
    }
}

fn log_built(graph: &EntityGraph, documents: usize) {
    info!(
        "Built graph from {} documents: {} nodes, {} edges",
        documents,
        graph.node_count(),
        graph.edge_count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::{DocumentReference, Section};

    fn access_policy() -> Document {
        Document::new("ACP", "Access Control Policy")
            .with_entity(EntityKind::Role, "CISO")
            .with_framework("ISO 27001")
            .with_reference(DocumentReference {
                document_id: "ISP".to_string(),
                title: Some("Information Security Policy".to_string()),
                relationship: "parent".to_string(),
            })
            .with_section(
                Section::new("ACP-1", "Remote Access")
                    .with_entity(EntityKind::Control, "MFA")
                    .with_entity(EntityKind::Role, "CISO")
                    .with_entity(EntityKind::Asset, "VPN")
                    .with_entity(EntityKind::Control, "mfa")
                    .with_topic("PR.AC-7"),
            )
    }

    #[test]
    fn test_build_document() {
        let graph = GraphBuilder::build(&[access_policy()]);

        assert!(graph.contains_node("doc:ACP"));
        assert!(graph.contains_node("section:ACP-1"));
        assert!(graph.contains_node("framework:iso_27001"));
        assert!(graph.contains_node("topic:prac7"));

        let placeholder = graph.node("doc:ISP").unwrap();
        assert!(placeholder.placeholder);
        assert_eq!(placeholder.label, "Information Security Policy");

        let stats = graph.stats();
        assert_eq!(stats.edges_by_type["CONTAINS"], 1);
        assert_eq!(stats.edges_by_type["MENTIONS"], 1);
        assert_eq!(stats.edges_by_type["GOVERNED_BY"], 1);
        assert_eq!(stats.edges_by_type["REFERENCES"], 1);
        assert_eq!(stats.edges_by_type["HAS_ENTITY"], 3);
        assert_eq!(stats.edges_by_type["CO_OCCURS"], 3);
        assert_eq!(stats.edges_by_type["MAPS_TO"], 1);
    }

    #[test]
    fn test_reference_relationship_kept() {
        let graph = GraphBuilder::build(&[access_policy()]);
        let edge = graph
            .edges()
            .iter()
            .find(|e| e.kind == EdgeKind::References)
            .unwrap();
        assert_eq!(edge.relationship.as_deref(), Some("parent"));
    }

    #[test]
    fn test_co_occurrence_accumulates_across_sections() {
        let doc = Document::new("D", "Doc")
            .with_section(
                Section::new("D-1", "One")
                    .with_entity(EntityKind::Control, "MFA")
                    .with_entity(EntityKind::Role, "CISO"),
            )
            .with_section(
                Section::new("D-2", "Two")
                    .with_entity(EntityKind::Role, "CISO")
                    .with_entity(EntityKind::Control, "MFA"),
            );
        let graph = GraphBuilder::build(&[doc]);
        assert_eq!(graph.co_occurrence_weight("control:mfa", "role:ciso"), Some(2));
    }

    #[test]
    fn test_placeholder_upgraded_in_either_order() {
        let isp = Document::new("ISP", "Information Security Policy")
            .with_section(Section::new("ISP-1", "Scope"));

        let forward = GraphBuilder::build(&[access_policy(), isp.clone()]);
        let backward = GraphBuilder::build(&[isp, access_policy()]);

        for graph in [&forward, &backward] {
            let node = graph.node("doc:ISP").unwrap();
            assert!(!node.placeholder);
            assert_eq!(node.label, "Information Security Policy");
        }
        assert_eq!(forward.canonical_form(), backward.canonical_form());
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let docs: Vec<Document> = (0..8)
            .map(|i| {
                Document::new(format!("D{}", i), format!("Doc {}", i)).with_section(
                    Section::new(format!("D{}-1", i), "Section")
                        .with_entity(EntityKind::Control, "MFA")
                        .with_entity(EntityKind::Role, if i % 2 == 0 { "CISO" } else { "CTO" }),
                )
            })
            .collect();

        let sequential = GraphBuilder::build(&docs);
        let parallel = GraphBuilder::build_parallel(&docs);

        assert_eq!(sequential.canonical_form(), parallel.canonical_form());
        assert_eq!(parallel.co_occurrence_weight("control:mfa", "role:ciso"), Some(4));
        assert!(parallel.verify_indexes().is_ok());
    }

    #[test]
    fn test_builder_counts_documents() {
        let mut builder = GraphBuilder::new();
        builder.add_document(&access_policy());
        assert_eq!(builder.document_count(), 1);
        assert_eq!(builder.graph().node_count(), builder.graph().nodes().len());
    }
}
