//! Knowledge graph over policy documents, sections and entities.
//!
//! Nodes live in an arena addressed by [`NodeId`]; every node also has a
//! stable string id (`doc:ACP`, `section:ACP-1`, `control:mfa`) that is used
//! across the rest of the crate and in snapshots.
//!
//! # Architecture
//!
//! - **Document nodes**: one per policy document, possibly a placeholder
//!   when only known through a reference
//! - **Section nodes**: one per section, contained by its document
//! - **Entity nodes**: roles, controls, assets, processes, external parties,
//!   frameworks, topics and referenced documents
//! - **Edges**: directed and unique per `(source, target, kind)`; CO_OCCURS
//!   edges are stored once per unordered pair and carry a weight
//!
//! Two derived indexes (entity -> sections, section -> entities) are kept in
//! sync with HAS_ENTITY edges and are only written by
//! [`EntityGraph::link_section_entity`].
//!
//! # Example
//!
//! ```no_run
//! use regmap_index::graph::EntityGraph;
//! use regmap_index::section::EntityKind;
//!
//! let mut graph = EntityGraph::new();
//! let doc = graph.add_document("ACP", "Access Control Policy");
//! let section = graph.add_section("ACP-1", "Remote Access", "ACP");
//! graph.contain(doc, section);
//!
//! let mfa = graph.add_entity(EntityKind::Control, "MFA");
//! graph.link_section_entity(section, mfa);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::section::{entity_node_id, EntityKind};

/// Errors raised by graph operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Derived index out of sync: {0}")]
    IndexMismatch(String),

    #[error("Edge references missing node handle {0}")]
    DanglingEdge(u32),
}

/// Arena handle for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Node category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Document,
    Section,
    Entity(EntityKind),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Document => "document",
            NodeKind::Section => "section",
            NodeKind::Entity(kind) => kind.label(),
        }
    }

    pub fn is_entity(&self) -> bool {
        matches!(self, NodeKind::Entity(_))
    }
}

/// Relationship type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    /// Document -> section
    Contains,
    /// Document -> entity
    Mentions,
    /// Document -> framework entity
    GovernedBy,
    /// Document -> document
    References,
    /// Section -> entity
    HasEntity,
    /// Entity <-> entity, weighted
    CoOccurs,
    /// Section -> topic entity
    MapsTo,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 7] = [
        EdgeKind::Contains,
        EdgeKind::Mentions,
        EdgeKind::GovernedBy,
        EdgeKind::References,
        EdgeKind::HasEntity,
        EdgeKind::CoOccurs,
        EdgeKind::MapsTo,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            EdgeKind::Contains => "CONTAINS",
            EdgeKind::Mentions => "MENTIONS",
            EdgeKind::GovernedBy => "GOVERNED_BY",
            EdgeKind::References => "REFERENCES",
            EdgeKind::HasEntity => "HAS_ENTITY",
            EdgeKind::CoOccurs => "CO_OCCURS",
            EdgeKind::MapsTo => "MAPS_TO",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A graph node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Stable string id
    pub id: String,
    pub kind: NodeKind,
    /// Display label (title or entity value)
    pub label: String,
    /// Owning document, for section nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Document only known through a reference
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
    /// Co-occurrence count, CO_OCCURS only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    /// Relationship label, REFERENCES only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
}

/// Counts by type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub nodes_by_type: BTreeMap<String, usize>,
    pub edges_by_type: BTreeMap<String, usize>,
    pub entities_with_sections: usize,
    pub sections_with_entities: usize,
}

/// Neighbourhood summary of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityContext {
    pub entity_id: String,
    pub label: String,
    pub kind: NodeKind,
    /// Sections that mention the entity, sorted
    pub sections: Vec<String>,
    /// `(entity id, weight)`, heaviest first
    pub co_occurring: Vec<(String, u32)>,
}

/// Serialized form: nodes, edges and both derived indexes.
#[derive(Serialize, Deserialize)]
struct GraphParts {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    entity_to_sections: BTreeMap<String, BTreeSet<String>>,
    section_to_entities: BTreeMap<String, BTreeSet<String>>,
}

/// Directed multi-relational graph of documents, sections and entities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "GraphParts", into = "GraphParts")]
pub struct EntityGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    /// String id -> handle
    node_index: HashMap<String, NodeId>,
    /// Edge positions by source handle
    outgoing: Vec<Vec<usize>>,
    /// Edge positions by target handle
    incoming: Vec<Vec<usize>>,
    /// (source, target, kind) -> edge position
    edge_index: HashMap<(NodeId, NodeId, EdgeKind), usize>,
    entity_to_sections: BTreeMap<String, BTreeSet<String>>,
    section_to_entities: BTreeMap<String, BTreeSet<String>>,
}

impl From<GraphParts> for EntityGraph {
    fn from(parts: GraphParts) -> Self {
        let mut graph = EntityGraph {
            entity_to_sections: parts.entity_to_sections,
            section_to_entities: parts.section_to_entities,
            ..Default::default()
        };
        for node in parts.nodes {
            graph.push_node(node);
        }
        for edge in parts.edges {
            // Dangling handles are dropped here and reported by verify_indexes
            if edge.source.index() < graph.nodes.len() && edge.target.index() < graph.nodes.len() {
                graph.push_edge(edge);
            }
        }
        graph
    }
}

impl From<EntityGraph> for GraphParts {
    fn from(graph: EntityGraph) -> Self {
        GraphParts {
            nodes: graph.nodes,
            edges: graph.edges,
            entity_to_sections: graph.entity_to_sections,
            section_to_entities: graph.section_to_entities,
        }
    }
}

/// Node id of a document.
pub fn document_node_id(document_id: &str) -> String {
    format!("doc:{}", document_id)
}

/// Node id of a section.
pub fn section_node_id(section_id: &str) -> String {
    format!("section:{}", section_id)
}

impl EntityGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if graph is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn push_node(&mut self, node: Node) -> NodeId {
        let handle = NodeId(self.nodes.len() as u32);
        self.node_index.insert(node.id.clone(), handle);
        self.nodes.push(node);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        handle
    }

    fn push_edge(&mut self, edge: Edge) -> usize {
        let position = self.edges.len();
        self.outgoing[edge.source.index()].push(position);
        self.incoming[edge.target.index()].push(position);
        self.edge_index
            .insert((edge.source, edge.target, edge.kind), position);
        self.edges.push(edge);
        position
    }

    /// Add a document node, upgrading a placeholder if one exists.
    pub fn add_document(&mut self, document_id: &str, title: &str) -> NodeId {
        let id = document_node_id(document_id);
        if let Some(&handle) = self.node_index.get(&id) {
            let node = &mut self.nodes[handle.index()];
            if node.placeholder {
                node.placeholder = false;
                node.label = title.to_string();
            }
            return handle;
        }
        self.push_node(Node {
            id,
            kind: NodeKind::Document,
            label: title.to_string(),
            document_id: None,
            placeholder: false,
        })
    }

    /// Add a document node known only through a reference.
    pub fn add_document_placeholder(&mut self, document_id: &str, title: &str) -> NodeId {
        let id = document_node_id(document_id);
        if let Some(&handle) = self.node_index.get(&id) {
            let node = &mut self.nodes[handle.index()];
            if node.placeholder && title < node.label.as_str() {
                node.label = title.to_string();
            }
            return handle;
        }
        self.push_node(Node {
            id,
            kind: NodeKind::Document,
            label: title.to_string(),
            document_id: None,
            placeholder: true,
        })
    }

    /// Add a section node.
    pub fn add_section(&mut self, section_id: &str, title: &str, document_id: &str) -> NodeId {
        let id = section_node_id(section_id);
        if let Some(&handle) = self.node_index.get(&id) {
            return handle;
        }
        self.push_node(Node {
            id,
            kind: NodeKind::Section,
            label: title.to_string(),
            document_id: Some(document_id.to_string()),
            placeholder: false,
        })
    }

    /// Add an entity node. The same normalized value always maps to one node;
    /// when spellings differ the lexicographically smallest becomes the label.
    pub fn add_entity(&mut self, kind: EntityKind, value: &str) -> NodeId {
        let id = entity_node_id(kind, value);
        let value = value.trim();
        if let Some(&handle) = self.node_index.get(&id) {
            let node = &mut self.nodes[handle.index()];
            if value < node.label.as_str() {
                node.label = value.to_string();
            }
            return handle;
        }
        self.push_node(Node {
            id,
            kind: NodeKind::Entity(kind),
            label: value.to_string(),
            document_id: None,
            placeholder: false,
        })
    }

    /// Insert an edge if `(source, target, kind)` is new. Returns its position.
    pub fn add_edge(&mut self, source: NodeId, target: NodeId, kind: EdgeKind) -> usize {
        if let Some(&position) = self.edge_index.get(&(source, target, kind)) {
            return position;
        }
        self.push_edge(Edge {
            source,
            target,
            kind,
            weight: None,
            relationship: None,
        })
    }

    /// Document contains section.
    pub fn contain(&mut self, document: NodeId, section: NodeId) {
        self.add_edge(document, section, EdgeKind::Contains);
    }

    /// Document-to-document reference with a relationship label.
    pub fn add_reference(&mut self, source: NodeId, target: NodeId, relationship: &str) {
        let position = self.add_edge(source, target, EdgeKind::References);
        let edge = &mut self.edges[position];
        let keep = matches!(&edge.relationship, Some(existing) if existing.as_str() <= relationship);
        if !keep {
            edge.relationship = Some(relationship.to_string());
        }
    }

    /// Section has entity. The only writer of the derived indexes.
    pub fn link_section_entity(&mut self, section: NodeId, entity: NodeId) {
        self.add_edge(section, entity, EdgeKind::HasEntity);

        let section_id = self.section_key(section);
        let entity_id = self.nodes[entity.index()].id.clone();
        self.entity_to_sections
            .entry(entity_id.clone())
            .or_default()
            .insert(section_id.clone());
        self.section_to_entities
            .entry(section_id)
            .or_default()
            .insert(entity_id);
    }

    /// Record one co-occurrence of two entities, adding `count` to the weight.
    ///
    /// The pair is stored once, oriented from the smaller to the larger
    /// string id, so the result does not depend on argument order.
    pub fn add_co_occurrence(&mut self, a: NodeId, b: NodeId, count: u32) {
        if a == b {
            return;
        }
        let (source, target) = if self.nodes[a.index()].id <= self.nodes[b.index()].id {
            (a, b)
        } else {
            (b, a)
        };
        let position = self.add_edge(source, target, EdgeKind::CoOccurs);
        let weight = self.edges[position].weight.get_or_insert(0);
        *weight += count;
    }

    /// Section id as stored in the derived indexes (without the `section:` prefix).
    fn section_key(&self, section: NodeId) -> String {
        let id = &self.nodes[section.index()].id;
        id.strip_prefix("section:").unwrap_or(id).to_string()
    }

    /// Look up a node by string id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_index.get(id).map(|handle| &self.nodes[handle.index()])
    }

    /// Handle for a string id.
    pub fn node_id(&self, id: &str) -> Option<NodeId> {
        self.node_index.get(id).copied()
    }

    /// Node by handle.
    pub fn get(&self, handle: NodeId) -> Option<&Node> {
        self.nodes.get(handle.index())
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.node_index.contains_key(id)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outgoing edges of a node.
    pub fn outgoing(&self, handle: NodeId) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(handle.index())
            .into_iter()
            .flatten()
            .map(move |&position| &self.edges[position])
    }

    /// Incoming edges of a node.
    pub fn incoming(&self, handle: NodeId) -> impl Iterator<Item = &Edge> {
        self.incoming
            .get(handle.index())
            .into_iter()
            .flatten()
            .map(move |&position| &self.edges[position])
    }

    /// Successors and predecessors of a node, regardless of edge kind.
    pub fn neighbors(&self, handle: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.outgoing(handle)
            .map(|edge| edge.target)
            .chain(self.incoming(handle).map(|edge| edge.source))
    }

    /// Sections that mention an entity.
    pub fn sections_for_entity(&self, entity_id: &str) -> Option<&BTreeSet<String>> {
        self.entity_to_sections.get(entity_id)
    }

    /// Entities mentioned by a section.
    pub fn entities_for_section(&self, section_id: &str) -> Option<&BTreeSet<String>> {
        self.section_to_entities.get(section_id)
    }

    /// Weight of the CO_OCCURS edge between two entities, in either order.
    pub fn co_occurrence_weight(&self, a: &str, b: &str) -> Option<u32> {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let source = self.node_id(first)?;
        let target = self.node_id(second)?;
        self.edge_index
            .get(&(source, target, EdgeKind::CoOccurs))
            .and_then(|&position| self.edges[position].weight)
    }

    /// Sections, co-occurring entities and metadata of an entity.
    pub fn entity_context(&self, entity_id: &str) -> Option<EntityContext> {
        let handle = self.node_id(entity_id)?;
        let node = &self.nodes[handle.index()];
        if !node.kind.is_entity() {
            return None;
        }

        let sections = self
            .sections_for_entity(entity_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut co_occurring: Vec<(String, u32)> = self
            .outgoing(handle)
            .chain(self.incoming(handle))
            .filter(|edge| edge.kind == EdgeKind::CoOccurs)
            .map(|edge| {
                let other = if edge.source == handle { edge.target } else { edge.source };
                (self.nodes[other.index()].id.clone(), edge.weight.unwrap_or(0))
            })
            .collect();
        co_occurring.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        Some(EntityContext {
            entity_id: node.id.clone(),
            label: node.label.clone(),
            kind: node.kind,
            sections,
            co_occurring,
        })
    }

    /// Counts by node and edge type.
    pub fn stats(&self) -> GraphStats {
        let mut nodes_by_type = BTreeMap::new();
        for node in &self.nodes {
            *nodes_by_type.entry(node.kind.label().to_string()).or_insert(0) += 1;
        }
        let mut edges_by_type = BTreeMap::new();
        for edge in &self.edges {
            *edges_by_type.entry(edge.kind.label().to_string()).or_insert(0) += 1;
        }
        GraphStats {
            total_nodes: self.nodes.len(),
            total_edges: self.edges.len(),
            nodes_by_type,
            edges_by_type,
            entities_with_sections: self.entity_to_sections.len(),
            sections_with_entities: self.section_to_entities.len(),
        }
    }

    /// Union another graph into this one.
    ///
    /// Nodes are matched by string id, CO_OCCURS weights are summed and
    /// placeholders are upgraded when the real document is present on
    /// either side, so the result does not depend on merge order.
    pub fn merge(&mut self, other: EntityGraph) {
        let mut mapping = Vec::with_capacity(other.nodes.len());
        for node in &other.nodes {
            let handle = match node.kind {
                NodeKind::Document => {
                    let document_id = node.id.strip_prefix("doc:").unwrap_or(&node.id);
                    if node.placeholder {
                        self.add_document_placeholder(document_id, &node.label)
                    } else {
                        self.add_document(document_id, &node.label)
                    }
                }
                NodeKind::Section => {
                    let section_id = node.id.strip_prefix("section:").unwrap_or(&node.id);
                    self.add_section(
                        section_id,
                        &node.label,
                        node.document_id.as_deref().unwrap_or_default(),
                    )
                }
                NodeKind::Entity(kind) => self.add_entity(kind, &node.label),
            };
            mapping.push(handle);
        }

        for edge in other.edges {
            let source = mapping[edge.source.index()];
            let target = mapping[edge.target.index()];
            match edge.kind {
                EdgeKind::CoOccurs => {
                    self.add_co_occurrence(source, target, edge.weight.unwrap_or(1))
                }
                EdgeKind::HasEntity => self.link_section_entity(source, target),
                EdgeKind::References => self.add_reference(
                    source,
                    target,
                    edge.relationship.as_deref().unwrap_or("related"),
                ),
                kind => {
                    self.add_edge(source, target, kind);
                }
            }
        }
    }

    /// Check that the derived indexes match the HAS_ENTITY edges exactly.
    pub fn verify_indexes(&self) -> Result<(), GraphError> {
        let mut entity_to_sections: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut section_to_entities: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for edge in &self.edges {
            for handle in [edge.source, edge.target] {
                if handle.index() >= self.nodes.len() {
                    return Err(GraphError::DanglingEdge(handle.0));
                }
            }
            if edge.kind != EdgeKind::HasEntity {
                continue;
            }
            let section_id = self.section_key(edge.source);
            let entity_id = self.nodes[edge.target.index()].id.clone();
            entity_to_sections
                .entry(entity_id.clone())
                .or_default()
                .insert(section_id.clone());
            section_to_entities
                .entry(section_id)
                .or_default()
                .insert(entity_id);
        }

        if entity_to_sections != self.entity_to_sections {
            return Err(GraphError::IndexMismatch(
                "entity -> sections index differs from HAS_ENTITY edges".to_string(),
            ));
        }
        if section_to_entities != self.section_to_entities {
            return Err(GraphError::IndexMismatch(
                "section -> entities index differs from HAS_ENTITY edges".to_string(),
            ));
        }
        Ok(())
    }

    /// Nodes as `(id, type)` and edges as `(source id, target id, kind, weight)`,
    /// both sorted. Equal for graphs built from the same documents in any order.
    pub fn canonical_form(&self) -> (Vec<(String, String)>, Vec<(String, String, EdgeKind, Option<u32>)>) {
        let mut nodes: Vec<(String, String)> = self
            .nodes
            .iter()
            .map(|node| (node.id.clone(), node.kind.label().to_string()))
            .collect();
        nodes.sort();

        let mut edges: Vec<(String, String, EdgeKind, Option<u32>)> = self
            .edges
            .iter()
            .map(|edge| {
                (
                    self.nodes[edge.source.index()].id.clone(),
                    self.nodes[edge.target.index()].id.clone(),
                    edge.kind,
                    edge.weight,
                )
            })
            .collect();
        edges.sort();

        (nodes, edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_graph() -> EntityGraph {
        let mut graph = EntityGraph::new();
        let doc = graph.add_document("ACP", "Access Control Policy");
        let s1 = graph.add_section("ACP-1", "Remote Access", "ACP");
        let s2 = graph.add_section("ACP-2", "Privileged Access", "ACP");
        graph.contain(doc, s1);
        graph.contain(doc, s2);

        let mfa = graph.add_entity(EntityKind::Control, "MFA");
        let ciso = graph.add_entity(EntityKind::Role, "CISO");
        graph.link_section_entity(s1, mfa);
        graph.link_section_entity(s1, ciso);
        graph.link_section_entity(s2, mfa);
        graph.add_co_occurrence(mfa, ciso, 1);
        graph
    }

    #[test]
    fn test_node_ids() {
        let graph = small_graph();
        assert!(graph.contains_node("doc:ACP"));
        assert!(graph.contains_node("section:ACP-1"));
        assert!(graph.contains_node("control:mfa"));
        assert!(graph.contains_node("role:ciso"));
        assert_eq!(graph.node_count(), 5);
    }

    #[test]
    fn test_entity_dedup_and_label() {
        let mut graph = EntityGraph::new();
        let a = graph.add_entity(EntityKind::Control, "Multi-Factor Authentication");
        let b = graph.add_entity(EntityKind::Control, "multi-factor authentication");
        assert_eq!(a, b);
        assert_eq!(graph.node_count(), 1);
        assert_eq!(
            graph.node("control:multifactor_authentication").unwrap().label,
            "Multi-Factor Authentication"
        );
    }

    #[test]
    fn test_edges_unique_per_kind() {
        let mut graph = small_graph();
        let before = graph.edge_count();
        let doc = graph.node_id("doc:ACP").unwrap();
        let s1 = graph.node_id("section:ACP-1").unwrap();
        graph.contain(doc, s1);
        assert_eq!(graph.edge_count(), before);
    }

    #[test]
    fn test_co_occurrence_is_symmetric_and_weighted() {
        let mut graph = small_graph();
        let mfa = graph.node_id("control:mfa").unwrap();
        let ciso = graph.node_id("role:ciso").unwrap();
        graph.add_co_occurrence(ciso, mfa, 1);

        assert_eq!(graph.co_occurrence_weight("control:mfa", "role:ciso"), Some(2));
        assert_eq!(graph.co_occurrence_weight("role:ciso", "control:mfa"), Some(2));
        let co_edges = graph
            .edges()
            .iter()
            .filter(|e| e.kind == EdgeKind::CoOccurs)
            .count();
        assert_eq!(co_edges, 1);
    }

    #[test]
    fn test_self_co_occurrence_ignored() {
        let mut graph = EntityGraph::new();
        let mfa = graph.add_entity(EntityKind::Control, "MFA");
        graph.add_co_occurrence(mfa, mfa, 1);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_derived_indexes() {
        let graph = small_graph();
        let sections = graph.sections_for_entity("control:mfa").unwrap();
        assert_eq!(
            sections.iter().cloned().collect::<Vec<_>>(),
            vec!["ACP-1".to_string(), "ACP-2".to_string()]
        );
        assert!(graph.entities_for_section("ACP-1").unwrap().contains("role:ciso"));
        assert!(graph.verify_indexes().is_ok());
    }

    #[test]
    fn test_verify_indexes_detects_drift() {
        let mut graph = small_graph();
        graph
            .entity_to_sections
            .entry("control:mfa".to_string())
            .or_default()
            .insert("ACP-9".to_string());
        assert!(matches!(graph.verify_indexes(), Err(GraphError::IndexMismatch(_))));
    }

    #[test]
    fn test_placeholder_upgrade() {
        let mut graph = EntityGraph::new();
        graph.add_document_placeholder("ISP", "ISP");
        assert!(graph.node("doc:ISP").unwrap().placeholder);

        graph.add_document("ISP", "Information Security Policy");
        let node = graph.node("doc:ISP").unwrap();
        assert!(!node.placeholder);
        assert_eq!(node.label, "Information Security Policy");

        // A later reference does not downgrade the real document
        graph.add_document_placeholder("ISP", "Another Title");
        assert_eq!(graph.node("doc:ISP").unwrap().label, "Information Security Policy");
    }

    #[test]
    fn test_neighbors_both_directions() {
        let graph = small_graph();
        let mfa = graph.node_id("control:mfa").unwrap();
        let neighbors: BTreeSet<String> = graph
            .neighbors(mfa)
            .map(|h| graph.get(h).unwrap().id.clone())
            .collect();
        assert!(neighbors.contains("section:ACP-1"));
        assert!(neighbors.contains("section:ACP-2"));
        assert!(neighbors.contains("role:ciso"));
    }

    #[test]
    fn test_entity_context() {
        let graph = small_graph();
        let context = graph.entity_context("control:mfa").unwrap();
        assert_eq!(context.label, "MFA");
        assert_eq!(context.sections, vec!["ACP-1", "ACP-2"]);
        assert_eq!(context.co_occurring, vec![("role:ciso".to_string(), 1)]);

        assert!(graph.entity_context("section:ACP-1").is_none());
        assert!(graph.entity_context("control:nothing").is_none());
    }

    #[test]
    fn test_stats() {
        let stats = small_graph().stats();
        assert_eq!(stats.total_nodes, 5);
        assert_eq!(stats.nodes_by_type["section"], 2);
        assert_eq!(stats.nodes_by_type["control"], 1);
        assert_eq!(stats.edges_by_type["HAS_ENTITY"], 3);
        assert_eq!(stats.edges_by_type["CO_OCCURS"], 1);
        assert_eq!(stats.entities_with_sections, 2);
    }

    #[test]
    fn test_merge_sums_weights_and_upgrades_placeholders() {
        let mut left = small_graph();
        let placeholder_doc = left.node_id("doc:ACP").unwrap();
        let isp = left.add_document_placeholder("ISP", "ISP");
        left.add_reference(placeholder_doc, isp, "parent");

        let mut right = EntityGraph::new();
        right.add_document("ISP", "Information Security Policy");
        let s = right.add_section("ISP-1", "Scope", "ISP");
        let mfa = right.add_entity(EntityKind::Control, "MFA");
        let ciso = right.add_entity(EntityKind::Role, "CISO");
        right.link_section_entity(s, mfa);
        right.add_co_occurrence(mfa, ciso, 1);

        left.merge(right);

        assert_eq!(left.co_occurrence_weight("control:mfa", "role:ciso"), Some(2));
        assert!(!left.node("doc:ISP").unwrap().placeholder);
        assert_eq!(left.sections_for_entity("control:mfa").unwrap().len(), 3);
        assert!(left.verify_indexes().is_ok());
    }

    #[test]
    fn test_serde_roundtrip_rebuilds_lookups() {
        let graph = small_graph();
        let json = serde_json::to_string(&graph).unwrap();
        let restored: EntityGraph = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.canonical_form(), graph.canonical_form());
        assert!(restored.node_id("control:mfa").is_some());
        assert_eq!(restored.co_occurrence_weight("role:ciso", "control:mfa"), Some(1));
        assert!(restored.verify_indexes().is_ok());
    }

    #[test]
    fn test_edge_kind_labels() {
        assert_eq!(EdgeKind::HasEntity.label(), "HAS_ENTITY");
        assert_eq!(
            serde_json::to_string(&EdgeKind::GovernedBy).unwrap(),
            "\"GOVERNED_BY\""
        );
    }
}
