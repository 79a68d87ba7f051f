//! LLM enhancement passes
//!
//! Two jobs, both optional and both degradable:
//!
//! 1. Semantic relationship suggestion: one call per category (semantic
//!    equivalence, business logic, hierarchical, temporal, lookup), each
//!    returning typed edges with confidence and reasoning.
//! 2. Table alias learning: one call per table, returning business-friendly
//!    names that the NL compiler resolves against later.
//!
//! Callers treat `LlmError::Unavailable` as "run rule-based only"; nothing
//! in here is load-bearing for a correct build.

use reconkg_llm::{CompletionRequest, LlmAdapter, LlmError};
use reconkg_model::graph::{KnowledgeGraph, Relationship, RelationshipType};
use reconkg_model::schema::SchemaDescriptor;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

const SEMANTIC_CATEGORIES: &[(&str, RelationshipType)] = &[
    ("semantic equivalence", RelationshipType::SemanticReference),
    ("business logic", RelationshipType::BusinessLogic),
    ("hierarchical containment", RelationshipType::Hierarchical),
    ("temporal ordering", RelationshipType::Temporal),
    ("lookup/reference data", RelationshipType::Lookup),
];

#[derive(Debug, Deserialize)]
struct SuggestedEdges {
    relationships: Vec<SuggestedEdge>,
}

#[derive(Debug, Deserialize)]
struct SuggestedEdge {
    source_table: String,
    target_table: String,
    #[serde(default)]
    source_column: Option<String>,
    #[serde(default)]
    target_column: Option<String>,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct SuggestedAliases {
    aliases: Vec<String>,
}

/// Compact structural summary handed to every enhancement prompt.
fn schema_summary(schemas: &[(String, SchemaDescriptor)]) -> String {
    let mut out = String::new();
    for (name, schema) in schemas {
        for (table, descriptor) in &schema.tables {
            let columns: Vec<&str> = descriptor
                .columns
                .iter()
                .map(|c| c.name.as_str())
                .collect();
            out.push_str(&format!("{name}:{table}({})\n", columns.join(", ")));
        }
    }
    out
}

fn known_edges_summary(kg: &KnowledgeGraph) -> String {
    kg.relationships
        .iter()
        .map(|r| format!("{} -{:?}-> {}", r.source_id, r.rel_type, r.target_id))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolve a table reference from the LLM (`schema:table`, `schema.table`,
/// or bare table name) to a node id in the graph.
fn resolve_table_id(kg: &KnowledgeGraph, reference: &str) -> Option<String> {
    let normalized = reference.replace('.', ":");
    if kg.has_node(&normalized) {
        return Some(normalized);
    }
    kg.table_by_name(reference).map(|n| n.id.clone())
}

/// One call per semantic category; returns the surviving typed edges.
///
/// Edges below `min_confidence` or with unresolvable endpoints are dropped.
/// An `Unavailable` on the first call aborts the whole pass (the provider is
/// down); later per-category failures skip just that category.
pub async fn suggest_semantic_edges(
    llm: &LlmAdapter,
    kg: &KnowledgeGraph,
    schemas: &[(String, SchemaDescriptor)],
    min_confidence: f64,
    deadline: Duration,
) -> Result<Vec<Relationship>, LlmError> {
    let structure = schema_summary(schemas);
    let known = known_edges_summary(kg);
    let mut edges = Vec::new();

    for (index, (category, rel_type)) in SEMANTIC_CATEGORIES.iter().enumerate() {
        let prompt = format!(
            "You are analyzing relational schemas to find {category} relationships \
             between tables.\n\nTables and columns:\n{structure}\n\
             Already-known relationships:\n{known}\n\n\
             Suggest additional {category} relationships NOT already listed. Respond \
             with JSON: {{\"relationships\": [{{\"source_table\": \"schema:table\", \
             \"target_table\": \"schema:table\", \"source_column\": \"col or null\", \
             \"target_column\": \"col or null\", \"confidence\": 0.0, \
             \"reasoning\": \"...\"}}]}}. Only include relationships you are \
             confident about."
        );

        let result: Result<SuggestedEdges, LlmError> = llm
            .complete_json(CompletionRequest::json(prompt), deadline)
            .await;
        let suggested = match result {
            Ok(s) => s,
            Err(e @ LlmError::Unavailable(_)) if index == 0 => return Err(e),
            Err(e) => {
                warn!(category, error = %e, "semantic category call failed, skipping");
                continue;
            }
        };

        for edge in suggested.relationships {
            if edge.confidence < min_confidence {
                continue;
            }
            let (Some(source_id), Some(target_id)) = (
                resolve_table_id(kg, &edge.source_table),
                resolve_table_id(kg, &edge.target_table),
            ) else {
                debug!(
                    source = edge.source_table,
                    target = edge.target_table,
                    "dropping suggested edge with unknown endpoint"
                );
                continue;
            };
            let mut properties = BTreeMap::new();
            if let Some(col) = edge.source_column {
                properties.insert("source_column".to_string(), serde_json::json!(col));
            }
            if let Some(col) = edge.target_column {
                properties.insert("target_column".to_string(), serde_json::json!(col));
            }
            edges.push(Relationship {
                source_id,
                target_id,
                rel_type: *rel_type,
                confidence: edge.confidence.clamp(0.0, 1.0),
                inferred: true,
                reasoning: edge.reasoning,
                properties,
            });
        }
    }

    Ok(edges)
}

/// One call per table: learn business aliases, keyed by node id.
///
/// Aliases case-insensitively equal to the canonical table name are dropped.
/// A failed call leaves that table's alias list empty; the build continues.
pub async fn learn_table_aliases(
    llm: &LlmAdapter,
    schemas: &[(String, SchemaDescriptor)],
    deadline: Duration,
) -> BTreeMap<String, Vec<String>> {
    let mut aliases = BTreeMap::new();
    for (schema_name, schema) in schemas {
        for (table, descriptor) in &schema.tables {
            let columns: Vec<&str> = descriptor
                .columns
                .iter()
                .map(|c| c.name.as_str())
                .collect();
            let prompt = format!(
                "Table `{table}` in schema `{schema_name}` has columns: {}.\n\
                 List short business-friendly names a user might call this table \
                 (abbreviations, product names, spoken forms). Respond with JSON: \
                 {{\"aliases\": [\"...\"]}}.",
                columns.join(", ")
            );
            let result: Result<SuggestedAliases, LlmError> = llm
                .complete_json(CompletionRequest::json(prompt), deadline)
                .await;
            match result {
                Ok(suggested) => {
                    let lower_table = table.to_ascii_lowercase();
                    let kept: Vec<String> = suggested
                        .aliases
                        .into_iter()
                        .filter(|a| !a.trim().is_empty())
                        .filter(|a| a.to_ascii_lowercase() != lower_table)
                        .collect();
                    if !kept.is_empty() {
                        aliases.insert(format!("{schema_name}:{table}"), kept);
                    }
                }
                Err(e) => {
                    warn!(schema = schema_name, table, error = %e,
                          "alias extraction failed for table");
                }
            }
        }
    }
    aliases
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconkg_model::graph::GraphNode;

    #[test]
    fn resolve_accepts_colon_dot_and_bare() {
        let mut kg = KnowledgeGraph::new("t");
        kg.nodes.push(GraphNode::table("s1", "orders"));
        assert_eq!(resolve_table_id(&kg, "s1:orders").as_deref(), Some("s1:orders"));
        assert_eq!(resolve_table_id(&kg, "s1.orders").as_deref(), Some("s1:orders"));
        assert_eq!(resolve_table_id(&kg, "orders").as_deref(), Some("s1:orders"));
        assert_eq!(resolve_table_id(&kg, "ghost"), None);
    }
}
