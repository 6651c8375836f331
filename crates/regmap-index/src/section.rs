//! Normalized policy documents, sections and entity references.
//!
//! Every section provider produces [`Document`]s. Downstream indexes only see
//! this model, never the source format.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ParseInconsistency;

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w]").unwrap());
static ENTITY_MARKUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\[(?:role|control|asset|process|external|doc|document|framework):([^\]]+)\]\]")
        .unwrap()
});
static HTML_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static REQUIREMENT_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*\[(?:MANDATORY|RECOMMENDED)\]\*\*\s*").unwrap());

/// Normalize an entity value into its graph key.
///
/// Lowercases, trims, turns whitespace runs into `_` and drops anything
/// that is not a word character. Idempotent.
pub fn normalize_key(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let joined = WHITESPACE_RUN.replace_all(&lowered, "_");
    NON_WORD.replace_all(&joined, "").into_owned()
}

/// Build the graph node id for an entity value.
pub fn entity_node_id(kind: EntityKind, value: &str) -> String {
    format!("{}:{}", kind.label(), normalize_key(value))
}

/// Type of entity mentioned by policy text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Role,
    Control,
    Asset,
    Process,
    External,
    Framework,
    Topic,
    Document,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Role,
        EntityKind::Control,
        EntityKind::Asset,
        EntityKind::Process,
        EntityKind::External,
        EntityKind::Framework,
        EntityKind::Topic,
        EntityKind::Document,
    ];

    /// Prefix used in node ids.
    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Role => "role",
            EntityKind::Control => "control",
            EntityKind::Asset => "asset",
            EntityKind::Process => "process",
            EntityKind::External => "external",
            EntityKind::Framework => "framework",
            EntityKind::Topic => "topic",
            EntityKind::Document => "document",
        }
    }

    /// Resolve a metadata key such as `roles` or `external_parties`.
    pub fn from_group_key(key: &str) -> Option<Self> {
        match key.trim().to_lowercase().as_str() {
            "roles" => Some(EntityKind::Role),
            "controls" => Some(EntityKind::Control),
            "assets" => Some(EntityKind::Asset),
            "processes" => Some(EntityKind::Process),
            "external" | "external_parties" => Some(EntityKind::External),
            "frameworks" => Some(EntityKind::Framework),
            "topics" => Some(EntityKind::Topic),
            "documents" | "docs" => Some(EntityKind::Document),
            other => other.parse().ok(),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "role" => Ok(EntityKind::Role),
            "control" => Ok(EntityKind::Control),
            "asset" => Ok(EntityKind::Asset),
            "process" => Ok(EntityKind::Process),
            "external" => Ok(EntityKind::External),
            "framework" => Ok(EntityKind::Framework),
            "topic" => Ok(EntityKind::Topic),
            "doc" | "document" => Ok(EntityKind::Document),
            other => Err(format!("unknown entity type: {}", other)),
        }
    }
}

/// A typed entity mention as written in the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub value: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into().trim().to_string(),
        }
    }

    /// Normalized key.
    pub fn key(&self) -> String {
        normalize_key(&self.value)
    }

    /// Graph node id (`type:key`).
    pub fn node_id(&self) -> String {
        entity_node_id(self.kind, &self.value)
    }
}

impl FromStr for EntityRef {
    type Err = String;

    /// Parse `type:value`, e.g. `control:MFA`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| format!("expected type:value, got {}", s))?;
        let kind = kind.parse()?;
        if value.trim().is_empty() {
            return Err(format!("empty entity value in {}", s));
        }
        Ok(EntityRef::new(kind, value))
    }
}

/// Compliance relevance tag carried by a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComplianceRelevance {
    High,
    Medium,
    Low,
}

impl FromStr for ComplianceRelevance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "HIGH" => Ok(ComplianceRelevance::High),
            "MEDIUM" => Ok(ComplianceRelevance::Medium),
            "LOW" => Ok(ComplianceRelevance::Low),
            other => Err(format!("unknown compliance relevance: {}", other)),
        }
    }
}

impl fmt::Display for ComplianceRelevance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ComplianceRelevance::High => "HIGH",
            ComplianceRelevance::Medium => "MEDIUM",
            ComplianceRelevance::Low => "LOW",
        };
        f.write_str(label)
    }
}

/// A titled policy section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// Globally unique section id
    pub id: String,
    pub title: String,
    /// Enclosing heading titles joined with `" > "`
    #[serde(default)]
    pub path: String,
    /// Heading depth (1-6)
    #[serde(default = "default_level")]
    pub level: u8,
    /// Body text (may still carry entity markup)
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub entities: Vec<EntityRef>,
    #[serde(default)]
    pub relevance: Option<ComplianceRelevance>,
    /// Control-topic hints (`likely_maps_to`)
    #[serde(default)]
    pub topics: Vec<String>,
}

fn default_level() -> u8 {
    1
}

impl Section {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: id.into(),
            path: title.clone(),
            title,
            level: 1,
            content: String::new(),
            entities: Vec::new(),
            relevance: None,
            topics: Vec::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn with_entity(mut self, kind: EntityKind, value: impl Into<String>) -> Self {
        self.entities.push(EntityRef::new(kind, value));
        self
    }

    pub fn with_relevance(mut self, relevance: ComplianceRelevance) -> Self {
        self.relevance = Some(relevance);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    /// Title and body as indexed for lexical search.
    pub fn full_text(&self) -> String {
        format!("{}\n\n{}", self.title, self.content)
    }

    /// Title and body with markup removed, for embedding.
    pub fn embedding_text(&self) -> String {
        format!("{}\n\n{}", self.title, strip_markup(&self.content))
    }

    /// Entity values grouped by type, deduplicated, in first-seen order.
    pub fn entity_groups(&self) -> BTreeMap<EntityKind, Vec<String>> {
        let mut groups: BTreeMap<EntityKind, Vec<String>> = BTreeMap::new();
        for entity in &self.entities {
            let values = groups.entry(entity.kind).or_default();
            if !values.contains(&entity.value) {
                values.push(entity.value.clone());
            }
        }
        groups
    }
}

/// Remove entity markup, HTML comments and requirement markers.
pub fn strip_markup(text: &str) -> String {
    let text = ENTITY_MARKUP.replace_all(text, "$1");
    let text = HTML_COMMENT.replace_all(&text, "");
    let text = REQUIREMENT_MARKER.replace_all(&text, "");
    text.trim().to_string()
}

/// A declared reference from one document to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentReference {
    pub document_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_relationship")]
    pub relationship: String,
}

fn default_relationship() -> String {
    "related".to_string()
}

/// A policy document and its ordered sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub sections: Vec<Section>,
    /// Document-level entity mentions
    #[serde(default)]
    pub entities: Vec<EntityRef>,
    /// Frameworks the document is governed by
    #[serde(default)]
    pub frameworks: Vec<String>,
    #[serde(default)]
    pub references: Vec<DocumentReference>,
}

impl Document {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            sections: Vec::new(),
            entities: Vec::new(),
            frameworks: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn with_section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    pub fn with_entity(mut self, kind: EntityKind, value: impl Into<String>) -> Self {
        self.entities.push(EntityRef::new(kind, value));
        self
    }

    pub fn with_framework(mut self, framework: impl Into<String>) -> Self {
        self.frameworks.push(framework.into());
        self
    }

    pub fn with_reference(mut self, reference: DocumentReference) -> Self {
        self.references.push(reference);
        self
    }

    /// Check the document is internally consistent.
    pub fn validate(&self) -> Result<(), ParseInconsistency> {
        if self.id.trim().is_empty() {
            return Err(ParseInconsistency::new(&self.title, "missing document id"));
        }

        let mut seen = HashSet::new();
        for section in &self.sections {
            if section.id.trim().is_empty() {
                return Err(ParseInconsistency::new(
                    &self.id,
                    format!("section '{}' has no id", section.title),
                ));
            }
            if !seen.insert(section.id.as_str()) {
                return Err(ParseInconsistency::new(
                    &self.id,
                    format!("duplicate section id {}", section.id),
                ));
            }
        }
        Ok(())
    }
}

/// Validate documents and enforce corpus-wide unique ids.
///
/// Documents are checked in order; a document that reuses an id already
/// claimed by an earlier one is rejected.
pub fn validate_corpus(documents: Vec<Document>) -> (Vec<Document>, Vec<ParseInconsistency>) {
    let mut accepted = Vec::with_capacity(documents.len());
    let mut skipped = Vec::new();
    let mut document_ids = HashSet::new();
    let mut section_ids: HashSet<String> = HashSet::new();

    for document in documents {
        if let Err(err) = document.validate() {
            skipped.push(err);
            continue;
        }
        if document_ids.contains(&document.id) {
            skipped.push(ParseInconsistency::new(&document.id, "duplicate document id"));
            continue;
        }
        if let Some(clash) = document
            .sections
            .iter()
            .find(|section| section_ids.contains(&section.id))
        {
            skipped.push(ParseInconsistency::new(
                &document.id,
                format!("section id {} already used by another document", clash.id),
            ));
            continue;
        }

        document_ids.insert(document.id.clone());
        section_ids.extend(document.sections.iter().map(|s| s.id.clone()));
        accepted.push(document);
    }

    (accepted, skipped)
}
