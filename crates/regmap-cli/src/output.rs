//! Human and JSON rendering of CLI results.

use std::fmt::Write;

use anyhow::Result;
use serde::Serialize;

use regmap_index::graph::section_node_id;
use regmap_index::{EntityContext, EntityGraph, GraphStats, IndexStats, RetrievalResult, SearchOutcome};

const SNIPPET_CHARS: usize = 240;
const TOP_CO_OCCURRING: usize = 10;
const TOP_SECTIONS: usize = 20;

#[derive(Serialize)]
struct JsonOutput<'a> {
    query: &'a str,
    results: &'a [RetrievalResult],
    skipped: Vec<String>,
}

pub fn format_json(query: &str, outcome: &SearchOutcome) -> Result<String> {
    let output = JsonOutput {
        query,
        results: &outcome.results,
        skipped: outcome.skipped.iter().map(|e| e.to_string()).collect(),
    };
    Ok(serde_json::to_string_pretty(&output)?)
}

pub fn format_human(query: &str, outcome: &SearchOutcome) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Query: {}", query);
    for skipped in &outcome.skipped {
        let _ = writeln!(out, "  (skipped: {})", skipped);
    }

    if outcome.results.is_empty() {
        let _ = writeln!(out, "\nNo matching sections.");
        return out;
    }

    for (i, result) in outcome.results.iter().enumerate() {
        let sources: Vec<&str> = result.sources.iter().map(|s| s.label()).collect();
        let _ = writeln!(
            out,
            "\n{}. [{}] {} ({:.4})",
            i + 1,
            result.section_id,
            result.section_path,
            result.score
        );
        let _ = writeln!(
            out,
            "   {} | via {}",
            result.document_title,
            sources.join(", ")
        );
        if let Some(relevance) = result.relevance {
            let _ = writeln!(out, "   relevance: {}", relevance);
        }
        let _ = writeln!(out, "   {}", snippet(&result.content));
    }
    out
}

fn snippet(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SNIPPET_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(SNIPPET_CHARS).collect();
    format!("{}...", cut.trim_end())
}

pub fn format_index_stats(stats: &IndexStats) -> String {
    format!(
        "Indexed {} documents: {} sections, {} chunks, {} embedded, {} skipped\n\
         Graph: {} nodes, {} edges ({} ms)",
        stats.documents,
        stats.sections,
        stats.chunks,
        stats.embedded_chunks,
        stats.skipped_documents,
        stats.graph_nodes,
        stats.graph_edges,
        stats.duration_ms
    )
}

pub fn format_graph_stats(stats: &GraphStats, chunks: Option<usize>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Nodes: {}", stats.total_nodes);
    for (kind, count) in &stats.nodes_by_type {
        let _ = writeln!(out, "  {:<12} {}", kind, count);
    }
    let _ = writeln!(out, "Edges: {}", stats.total_edges);
    for (kind, count) in &stats.edges_by_type {
        let _ = writeln!(out, "  {:<12} {}", kind, count);
    }
    let _ = writeln!(out, "Entities linked to sections: {}", stats.entities_with_sections);
    let _ = write!(out, "Sections with entities: {}", stats.sections_with_entities);
    if let Some(chunks) = chunks {
        let _ = write!(out, "\nIndexed chunks: {}", chunks);
    }
    out
}

pub fn format_entity(graph: &EntityGraph, context: &EntityContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} ({})", context.label, context.kind.label());
    let _ = writeln!(out, "id: {}", context.entity_id);

    let _ = writeln!(out, "\nCo-occurring entities:");
    if context.co_occurring.is_empty() {
        let _ = writeln!(out, "  none");
    }
    for (entity, weight) in context.co_occurring.iter().take(TOP_CO_OCCURRING) {
        let label = graph.node(entity).map(|n| n.label.as_str()).unwrap_or(entity);
        let _ = writeln!(out, "  {:<40} {}", label, weight);
    }

    let _ = write!(out, "\nSections ({}):", context.sections.len());
    for section in context.sections.iter().take(TOP_SECTIONS) {
        let title = graph
            .node(&section_node_id(section))
            .map(|n| n.label.as_str())
            .unwrap_or("");
        let _ = write!(out, "\n  {:<24} {}", section, title);
    }
    out
}
