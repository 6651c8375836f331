//! Section providers.
//!
//! A provider turns some source format into normalized [`Document`]s. Two
//! are included:
//! - [`MarkdownProvider`]: a directory of annotated markdown policies
//! - [`JsonCorpusProvider`]: a JSON array of documents in the normalized model
//!
//! Malformed documents are skipped and reported, never fatal.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::ParseInconsistency;
use crate::section::{validate_corpus, Document, DocumentReference, EntityKind, EntityRef, Section};

static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*$").unwrap());
static SECTION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<!--\s*section_id:\s*([^\s>]+)\s*-->").unwrap());
static RELEVANCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<!--\s*compliance_relevance:\s*(\w+)\s*-->").unwrap());
static MAPS_TO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<!--\s*likely_maps_to:\s*\[([^\]]+)\]\s*-->").unwrap());
static ANNOTATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\[(role|control|asset|process|external|doc|document|framework|topic):([^\]]+)\]\]").unwrap()
});
static SLUG_PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").unwrap());
static SLUG_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Documents produced by a provider plus the ones it had to skip.
#[derive(Debug, Default)]
pub struct ProvidedCorpus {
    pub documents: Vec<Document>,
    pub skipped: Vec<ParseInconsistency>,
}

impl ProvidedCorpus {
    /// Validate documents, moving inconsistent ones to `skipped`.
    pub fn from_documents(documents: Vec<Document>, mut skipped: Vec<ParseInconsistency>) -> Self {
        let (documents, rejected) = validate_corpus(documents);
        for err in &rejected {
            warn!("{}", err);
        }
        skipped.extend(rejected);
        Self { documents, skipped }
    }

    pub fn section_count(&self) -> usize {
        self.documents.iter().map(|d| d.sections.len()).sum()
    }
}

/// Source of normalized documents.
pub trait SectionProvider {
    fn load(&self) -> Result<ProvidedCorpus>;
}

/// Reads `*.md` policy files from a directory (non-recursive, sorted by name).
pub struct MarkdownProvider {
    dir: PathBuf,
}

impl MarkdownProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn markdown_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            anyhow::bail!("Not a directory: {:?}", self.dir);
        }
        let mut files: Vec<PathBuf> = WalkDir::new(&self.dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "md"))
            .collect();
        files.sort();
        Ok(files)
    }
}

impl SectionProvider for MarkdownProvider {
    fn load(&self) -> Result<ProvidedCorpus> {
        let files = self.markdown_files()?;
        info!("Parsing {} markdown files from {:?}", files.len(), self.dir);

        let mut documents = Vec::with_capacity(files.len());
        let mut skipped = Vec::new();

        for path in files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let parsed = fs::read_to_string(&path)
                .map_err(|e| ParseInconsistency::new(&name, format!("unreadable: {}", e)))
                .and_then(|content| parse_markdown(&content, &file_stem(&path)));

            match parsed {
                Ok(document) => {
                    debug!("Parsed {}: {} sections", name, document.sections.len());
                    documents.push(document);
                }
                Err(err) => {
                    warn!("{}", err);
                    skipped.push(err);
                }
            }
        }

        Ok(ProvidedCorpus::from_documents(documents, skipped))
    }
}

/// Reads a JSON array of documents.
pub struct JsonCorpusProvider {
    path: PathBuf,
}

impl JsonCorpusProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SectionProvider for JsonCorpusProvider {
    fn load(&self) -> Result<ProvidedCorpus> {
        info!("Loading corpus from: {:?}", self.path);
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read corpus: {:?}", self.path))?;
        let values: Vec<serde_json::Value> =
            serde_json::from_str(&content).context("Corpus must be a JSON array of documents")?;

        let mut documents = Vec::with_capacity(values.len());
        let mut skipped = Vec::new();
        for (position, value) in values.into_iter().enumerate() {
            let label = value
                .get("id")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| format!("#{}", position));
            match serde_json::from_value::<Document>(value) {
                Ok(document) => documents.push(document),
                Err(e) => {
                    let err = ParseInconsistency::new(label, e.to_string());
                    warn!("{}", err);
                    skipped.push(err);
                }
            }
        }

        Ok(ProvidedCorpus::from_documents(documents, skipped))
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// YAML frontmatter of an annotated policy file.
#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    #[serde(default)]
    document_id: Option<serde_yaml::Value>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    entities: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    regulatory_frameworks: Vec<serde_yaml::Value>,
    #[serde(default)]
    references: Vec<serde_yaml::Value>,
}

/// Split `---\n...\n---\n` frontmatter from the body.
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---\n")?;
    if let Some(end) = rest.find("\n---\n") {
        return Some((&rest[..end], &rest[end + 5..]));
    }
    rest.strip_suffix("\n---").map(|yaml| (yaml, ""))
}

fn yaml_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.trim().to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
    .filter(|s| !s.is_empty())
}

/// Parse one annotated markdown policy.
///
/// `stem` is the file name without extension, used for default ids and titles.
pub fn parse_markdown(content: &str, stem: &str) -> Result<Document, ParseInconsistency> {
    let content = content.replace("\r\n", "\n");
    let (frontmatter, body) = match split_frontmatter(&content) {
        Some((yaml, body)) => {
            let frontmatter = if yaml.trim().is_empty() {
                Frontmatter::default()
            } else {
                serde_yaml::from_str::<Frontmatter>(yaml).map_err(|e| {
                    ParseInconsistency::new(stem, format!("malformed frontmatter: {}", e))
                })?
            };
            (frontmatter, body)
        }
        None => (Frontmatter::default(), content.as_str()),
    };

    let document_id = frontmatter
        .document_id
        .as_ref()
        .and_then(yaml_string)
        .unwrap_or_else(|| stem.chars().take(3).collect::<String>().to_uppercase());
    let title = frontmatter
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| stem.to_string());

    let mut document = Document::new(document_id, title);
    document.entities = frontmatter_entities(&frontmatter.entities);
    document.frameworks = frontmatter
        .regulatory_frameworks
        .iter()
        .filter_map(|fw| match fw {
            serde_yaml::Value::Mapping(_) => fw
                .get("name")
                .and_then(yaml_string)
                .or_else(|| fw.get("id").and_then(yaml_string)),
            other => yaml_string(other),
        })
        .collect();
    document.references = frontmatter
        .references
        .iter()
        .filter_map(|reference| {
            let document_id = reference.get("document_id").and_then(yaml_string)?;
            Some(DocumentReference {
                document_id,
                title: reference.get("title").and_then(yaml_string),
                relationship: reference
                    .get("relationship")
                    .and_then(yaml_string)
                    .unwrap_or_else(|| "related".to_string()),
            })
        })
        .collect();
    document.sections = parse_sections(body, &document.id);

    document.validate()?;
    Ok(document)
}

fn frontmatter_entities(groups: &BTreeMap<String, serde_yaml::Value>) -> Vec<EntityRef> {
    let mut entities = Vec::new();
    for (key, values) in groups {
        let Some(kind) = EntityKind::from_group_key(key) else {
            debug!("Ignoring unknown entity group: {}", key);
            continue;
        };
        let Some(values) = values.as_sequence() else {
            continue;
        };
        for value in values.iter().filter_map(yaml_string) {
            let entity = EntityRef::new(kind, value);
            if !entities.contains(&entity) {
                entities.push(entity);
            }
        }
    }
    entities
}

/// Split a markdown body into heading-delimited sections.
fn parse_sections(body: &str, document_id: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut stack: Vec<(u8, String)> = Vec::new();
    let mut current: Option<(u8, String, String)> = None;
    let mut lines: Vec<&str> = Vec::new();

    for line in body.lines() {
        if let Some(captures) = HEADING.captures(line) {
            if let Some((level, title, path)) = current.take() {
                sections.push(build_section(level, title, path, &lines));
            }
            lines.clear();

            let level = captures[1].len() as u8;
            let title = captures[2].trim().to_string();
            while stack.last().map_or(false, |(l, _)| *l >= level) {
                stack.pop();
            }
            stack.push((level, title.clone()));
            let path = stack
                .iter()
                .map(|(_, t)| t.as_str())
                .collect::<Vec<_>>()
                .join(" > ");
            current = Some((level, title, path));
        } else if current.is_some() {
            lines.push(line);
        }
    }

    if let Some((level, title, path)) = current.take() {
        sections.push(build_section(level, title, path, &lines));
    }

    assign_generated_ids(document_id, sections)
}

/// Give sections without an explicit id a `{doc}-{slug}` id, suffixed `-2`, `-3`...
/// when the slug is already taken. Explicit ids are left as written.
fn assign_generated_ids(document_id: &str, sections: Vec<(Section, bool)>) -> Vec<Section> {
    let mut taken: HashSet<String> = sections
        .iter()
        .filter(|(_, explicit)| *explicit)
        .map(|(section, _)| section.id.clone())
        .collect();

    sections
        .into_iter()
        .map(|(mut section, explicit)| {
            if !explicit {
                let base = format!("{}-{}", document_id, title_slug(&section.title));
                let mut id = base.clone();
                let mut n = 2;
                while taken.contains(&id) {
                    id = format!("{}-{}", base, n);
                    n += 1;
                }
                taken.insert(id.clone());
                section.id = id;
            }
            section
        })
        .collect()
}

/// Build a section from its heading and body lines. The flag is true when
/// the body carries an explicit `section_id` comment.
fn build_section(level: u8, title: String, path: String, lines: &[&str]) -> (Section, bool) {
    let content = lines.join("\n").trim().to_string();

    let explicit_id = SECTION_ID.captures(&content).map(|c| c[1].to_string());
    let explicit = explicit_id.is_some();
    let id = explicit_id.unwrap_or_default();

    let relevance = RELEVANCE
        .captures(&content)
        .and_then(|c| c[1].parse().ok());

    let topics = MAPS_TO
        .captures(&content)
        .map(|c| {
            c[1].split(',')
                .map(|item| item.trim().trim_matches(|ch| ch == '"' || ch == '\'').to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut entities: Vec<EntityRef> = Vec::new();
    for captures in ANNOTATION.captures_iter(&content) {
        let Ok(kind) = captures[1].parse::<EntityKind>() else {
            continue;
        };
        let value = captures[2].trim();
        if value.is_empty() {
            continue;
        }
        let entity = EntityRef::new(kind, value);
        if !entities.contains(&entity) {
            entities.push(entity);
        }
    }

    let section = Section {
        id,
        path,
        level,
        content,
        entities,
        relevance,
        topics,
        title,
    };
    (section, explicit)
}

/// Lowercase title slug: punctuation dropped, whitespace runs to `-`, at most 20 chars.
fn title_slug(title: &str) -> String {
    let cleaned = SLUG_PUNCTUATION.replace_all(title, "");
    let dashed = SLUG_WHITESPACE.replace_all(cleaned.trim(), "-").to_lowercase();
    dashed.chars().take(20).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::ComplianceRelevance;

    const POLICY: &str = r#"---
document_id: ACP
title: Access Control Policy
entities:
  roles: [CISO, IT Manager]
  controls: [MFA]
  external_parties: [Cloud Vendor]
  gadgets: [Ignored]
regulatory_frameworks:
  - id: CSCRF
    name: SEBI CSCRF
  - id: ISO27001
references:
  - document_id: ISP
    title: Information Security Policy
    relationship: parent
---
# Access Control Policy

Intro text.

## Remote Access
<!-- section_id: ACP-3 -->
<!-- compliance_relevance: HIGH -->
<!-- likely_maps_to: ["PR.AC-3", 'PR.AC-7'] -->
**[MANDATORY]** The [[role:CISO]] shall enforce [[control:MFA]] on the [[asset:VPN]].
The [[control:MFA]] token is mandatory.

### Exceptions
Approved by the [[role:IT Manager]] per [[doc:Exception Procedure]].

## Review & Audit!
Quarterly.
"#;

    #[test]
    fn test_parse_frontmatter_fields() {
        let doc = parse_markdown(POLICY, "access_control").unwrap();
        assert_eq!(doc.id, "ACP");
        assert_eq!(doc.title, "Access Control Policy");
        assert_eq!(doc.frameworks, vec!["SEBI CSCRF", "ISO27001"]);
        assert_eq!(doc.references.len(), 1);
        assert_eq!(doc.references[0].relationship, "parent");

        let kinds: Vec<_> = doc.entities.iter().map(|e| (e.kind, e.value.as_str())).collect();
        assert!(kinds.contains(&(EntityKind::Role, "IT Manager")));
        assert!(kinds.contains(&(EntityKind::External, "Cloud Vendor")));
        assert!(!kinds.iter().any(|(_, v)| *v == "Ignored"));
    }

    #[test]
    fn test_parse_sections_and_paths() {
        let doc = parse_markdown(POLICY, "access_control").unwrap();
        let titles: Vec<_> = doc.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Access Control Policy", "Remote Access", "Exceptions", "Review & Audit!"]
        );
        assert_eq!(
            doc.sections[2].path,
            "Access Control Policy > Remote Access > Exceptions"
        );
        assert_eq!(doc.sections[3].path, "Access Control Policy > Review & Audit!");
        assert_eq!(doc.sections[2].level, 3);
    }

    #[test]
    fn test_section_metadata() {
        let doc = parse_markdown(POLICY, "access_control").unwrap();
        let remote = &doc.sections[1];
        assert_eq!(remote.id, "ACP-3");
        assert_eq!(remote.relevance, Some(ComplianceRelevance::High));
        assert_eq!(remote.topics, vec!["PR.AC-3", "PR.AC-7"]);

        let values: Vec<_> = remote.entities.iter().map(|e| e.node_id()).collect();
        assert_eq!(values, vec!["role:ciso", "control:mfa", "asset:vpn"]);

        let exceptions = &doc.sections[2];
        assert!(exceptions
            .entities
            .iter()
            .any(|e| e.kind == EntityKind::Document && e.value == "Exception Procedure"));
    }

    #[test]
    fn test_generated_section_ids() {
        let doc = parse_markdown(POLICY, "access_control").unwrap();
        assert_eq!(doc.sections[0].id, "ACP-access-control-polic");
        assert_eq!(doc.sections[3].id, "ACP-review-audit");
        assert_eq!(title_slug("A Very Long Section Title Indeed"), "a-very-long-section-");
    }

    #[test]
    fn test_defaults_without_frontmatter() {
        let doc = parse_markdown("# Scope\nApplies to all staff.\n", "incident_response").unwrap();
        assert_eq!(doc.id, "INC");
        assert_eq!(doc.title, "incident_response");
        assert_eq!(doc.sections.len(), 1);
        assert_eq!(doc.sections[0].id, "INC-scope");
    }

    #[test]
    fn test_malformed_frontmatter_is_inconsistency() {
        let err = parse_markdown("---\ntitle: [unclosed\n---\n# A\n", "broken").unwrap_err();
        assert_eq!(err.document, "broken");
        assert!(err.reason.contains("malformed frontmatter"));
    }

    #[test]
    fn test_duplicate_section_ids_rejected() {
        let content = "# One\n<!-- section_id: X-1 -->\n# Two\n<!-- section_id: X-1 -->\n";
        let err = parse_markdown(content, "dup").unwrap_err();
        assert!(err.reason.contains("duplicate section id"));
    }

    #[test]
    fn test_repeated_headings_get_unique_ids() {
        let content = "# Access Control Policy\n\n## Remote Access\n\n### Scope\nVPN users.\n\n\
                       ## Privileged Access\n\n### Scope\nAdministrators.\n";
        let doc = parse_markdown(content, "access_control").unwrap();
        let ids: Vec<&str> = doc.sections.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids[2], "ACC-scope");
        assert_eq!(ids[4], "ACC-scope-2");
        assert_eq!(doc.sections[4].path, "Access Control Policy > Privileged Access > Scope");
    }

    #[test]
    fn test_long_titles_sharing_a_prefix_are_kept() {
        let content = "# Information Security Policy Scope\nAll systems.\n\
                       # Information Security Policy Review\nAnnually.\n";
        let doc = parse_markdown(content, "isp").unwrap();
        assert_eq!(doc.sections[0].id, "ISP-information-security");
        assert_eq!(doc.sections[1].id, "ISP-information-security-2");
    }

    #[test]
    fn test_generated_id_avoids_explicit_id() {
        let content = "# Scope\nFirst.\n# Other\n<!-- section_id: INC-scope -->\nSecond.\n";
        let doc = parse_markdown(content, "incident").unwrap();
        assert_eq!(doc.sections[0].id, "INC-scope-2");
        assert_eq!(doc.sections[1].id, "INC-scope");
    }

    #[test]
    fn test_markdown_provider_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("access.md"), POLICY).unwrap();
        fs::write(dir.path().join("broken.md"), "---\ntitle: [unclosed\n---\n# A\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let corpus = MarkdownProvider::new(dir.path()).load().unwrap();
        assert_eq!(corpus.documents.len(), 1);
        assert_eq!(corpus.skipped.len(), 1);
        assert_eq!(corpus.section_count(), 4);
    }

    #[test]
    fn test_markdown_provider_requires_directory() {
        assert!(MarkdownProvider::new("/nonexistent/policies").load().is_err());
    }

    #[test]
    fn test_json_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.json");
        let json = serde_json::json!([
            {
                "id": "ACP",
                "title": "Access Control Policy",
                "sections": [
                    {
                        "id": "ACP-1",
                        "title": "Remote Access",
                        "content": "MFA is required.",
                        "entities": [{"kind": "control", "value": "MFA"}],
                        "relevance": "HIGH"
                    }
                ]
            },
            {"title": "No id"},
            {"id": "DUP", "title": "Clash", "sections": [{"id": "ACP-1", "title": "Again"}]}
        ]);
        fs::write(&path, json.to_string()).unwrap();

        let corpus = JsonCorpusProvider::new(&path).load().unwrap();
        assert_eq!(corpus.documents.len(), 1);
        assert_eq!(corpus.skipped.len(), 2);
        assert_eq!(
            corpus.documents[0].sections[0].relevance,
            Some(ComplianceRelevance::High)
        );
    }
}
