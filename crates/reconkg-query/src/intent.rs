//! Intent parser
//!
//! Resolves table entities (exact names first, then learned aliases, then an
//! optional LLM suggestion restricted to known tables), extracts filters
//! (LLM when available, rule-based fallback for active/inactive/status/date
//! phrases), and infers join paths through the knowledge graph.

use crate::classify::{Classification, Operation, QueryType};
use crate::QueryError;
use reconkg_graph::store::find_paths;
use reconkg_llm::{CompletionRequest, LlmAdapter};
use reconkg_model::graph::{KnowledgeGraph, NodeLabel, PathStep};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_MAX_HOPS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: String,
    pub value: String,
    /// Node id of the owning table, when resolved.
    #[serde(default)]
    pub table: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdditionalColumn {
    pub column: String,
    pub table_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryIntent {
    pub query_type: QueryType,
    pub operation: Operation,
    /// Table node ids.
    pub source_table: Option<String>,
    pub target_table: Option<String>,
    pub filters: Vec<Filter>,
    pub additional_columns: Vec<AdditionalColumn>,
    /// Source-to-target join path; empty when no path was found.
    pub join_path: Vec<PathStep>,
    /// Paths extending the plan to additional-column tables.
    pub extension_paths: Vec<Vec<PathStep>>,
    /// Grouping column for aggregation queries ("count ... by plant").
    pub group_by: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
    pub warnings: Vec<String>,
}

impl QueryIntent {
    pub fn joined_column_names(&self) -> Vec<String> {
        self.join_path
            .iter()
            .chain(self.extension_paths.iter().flatten())
            .filter_map(|step| {
                Some(format!(
                    "{}={}",
                    step.source_column.as_deref()?,
                    step.target_column.as_deref()?
                ))
            })
            .collect()
    }
}

// ============================================================================
// Entity resolution
// ============================================================================

struct EntityMatch {
    table_id: String,
    position: usize,
    length: usize,
}

fn word_bounded(text: &str, start: usize, len: usize) -> bool {
    let before_ok = start == 0
        || text[..start]
            .chars()
            .last()
            .map_or(true, |c| !c.is_alphanumeric());
    let after_ok = start + len >= text.len()
        || text[start + len..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
    before_ok && after_ok
}

/// All candidate mentions of KG tables in the text, longest-first per spot.
/// Learned aliases take priority over raw table names at the same position.
fn entity_matches(kg: &KnowledgeGraph, definition: &str) -> Vec<EntityMatch> {
    let lower = definition.to_ascii_lowercase();
    let mut matches: Vec<EntityMatch> = Vec::new();

    for node in kg.nodes.iter().filter(|n| n.label == NodeLabel::Table) {
        let mut candidates: Vec<String> = kg
            .table_aliases
            .get(&node.id)
            .map(|aliases| aliases.clone())
            .unwrap_or_default();
        candidates.push(node.name.clone());

        let mut best: Option<(usize, usize)> = None;
        for candidate in &candidates {
            let needle = candidate.to_ascii_lowercase();
            if needle.is_empty() {
                continue;
            }
            let mut from = 0usize;
            while let Some(found) = lower[from..].find(&needle) {
                let position = from + found;
                if word_bounded(&lower, position, needle.len()) {
                    let better = match best {
                        None => true,
                        Some((p, l)) => position < p || (position == p && needle.len() > l),
                    };
                    if better {
                        best = Some((position, needle.len()));
                    }
                    break;
                }
                from = position + needle.len();
            }
        }
        if let Some((position, length)) = best {
            matches.push(EntityMatch {
                table_id: node.id.clone(),
                position,
                length,
            });
        }
    }

    // Earliest first; longer match wins an overlapping spot.
    matches.sort_by(|a, b| a.position.cmp(&b.position).then(b.length.cmp(&a.length)));
    let mut kept: Vec<EntityMatch> = Vec::new();
    for candidate in matches {
        let overlaps = kept.iter().any(|k| {
            candidate.position < k.position + k.length && k.position < candidate.position + candidate.length
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

#[derive(Debug, Deserialize)]
struct LlmEntitySuggestion {
    #[serde(default)]
    source_table: Option<String>,
    #[serde(default)]
    target_table: Option<String>,
}

async fn llm_entity_fallback(
    kg: &KnowledgeGraph,
    definition: &str,
    llm: &LlmAdapter,
    deadline: Duration,
) -> (Option<String>, Option<String>) {
    let known: Vec<&str> = kg
        .nodes
        .iter()
        .filter(|n| n.label == NodeLabel::Table)
        .map(|n| n.id.as_str())
        .collect();
    let prompt = format!(
        "Which tables does this question refer to?\n\n{definition}\n\n\
         Known tables (answer ONLY with these ids):\n{}\n\n\
         Respond with JSON: {{\"source_table\": \"id or null\", \
         \"target_table\": \"id or null\"}}",
        known.join("\n")
    );
    let result: Result<LlmEntitySuggestion, _> = llm
        .complete_json(CompletionRequest::json(prompt), deadline)
        .await;
    match result {
        Ok(suggestion) => {
            let check = |id: Option<String>| id.filter(|i| kg.has_node(i));
            (check(suggestion.source_table), check(suggestion.target_table))
        }
        Err(e) => {
            debug!(error = %e, "LLM entity fallback unavailable");
            (None, None)
        }
    }
}

// ============================================================================
// Filter extraction
// ============================================================================

/// Columns of a table: its COLUMN nodes plus the plain columns attached to
/// the TABLE node.
pub fn table_columns(kg: &KnowledgeGraph, table_id: &str) -> Vec<String> {
    let prefix = format!("{table_id}:");
    let mut columns: Vec<String> = kg
        .nodes
        .iter()
        .filter(|n| n.label == NodeLabel::Column && n.id.starts_with(&prefix))
        .map(|n| n.name.clone())
        .collect();
    if let Some(table) = kg.node(table_id) {
        if let Some(plain) = table.properties.get("columns").and_then(|v| v.as_array()) {
            columns.extend(
                plain
                    .iter()
                    .filter_map(|c| c.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string),
            );
        }
    }
    columns
}

fn status_column(columns: &[String]) -> Option<String> {
    columns
        .iter()
        .find(|c| c.to_ascii_lowercase().contains("active"))
        .or_else(|| {
            columns
                .iter()
                .find(|c| c.to_ascii_lowercase().contains("status"))
        })
        .cloned()
}

fn date_column(columns: &[String]) -> Option<String> {
    columns
        .iter()
        .find(|c| {
            let lower = c.to_ascii_lowercase();
            lower.contains("date") || lower.ends_with("_at") || lower.contains("time")
        })
        .cloned()
}

fn date_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(since|after|before)\s+(\d{4}(?:-\d{2}-\d{2})?)\b")
            .expect("static regex")
    })
}

/// Rule-based filter fallback: active/inactive qualifiers, status phrases,
/// and date ranges, matched against the plan's column names.
///
/// In a two-table plan, qualifier filters attach to the target table.
fn rule_based_filters(
    definition: &str,
    source: Option<(&str, &[String])>,
    target: Option<(&str, &[String])>,
) -> Vec<Filter> {
    let lower = definition.to_ascii_lowercase();
    let mut filters = Vec::new();

    // Target owns qualifier filters when present; source otherwise.
    let owner = target.or(source);

    let inactive = Regex::new(r"(?i)\binactive\b").expect("static regex");
    let active = Regex::new(r"(?i)\bactive\b").expect("static regex");
    if let Some((table_id, columns)) = owner {
        if let Some(column) = status_column(columns) {
            if inactive.is_match(&lower) {
                filters.push(Filter {
                    column,
                    op: "=".to_string(),
                    value: "Inactive".to_string(),
                    table: Some(table_id.to_string()),
                });
            } else if active.is_match(&lower) {
                filters.push(Filter {
                    column,
                    op: "=".to_string(),
                    value: "Active".to_string(),
                    table: Some(table_id.to_string()),
                });
            }
        }
        if let Some(caps) = date_pattern().captures(&lower) {
            if let Some(column) = date_column(columns) {
                let op = match caps.get(1).map(|m| m.as_str()) {
                    Some("before") => "<",
                    _ => ">=",
                };
                filters.push(Filter {
                    column,
                    op: op.to_string(),
                    value: caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string(),
                    table: Some(table_id.to_string()),
                });
            }
        }
    }
    filters
}

#[derive(Debug, Deserialize)]
struct LlmFilters {
    filters: Vec<LlmFilter>,
}

#[derive(Debug, Deserialize)]
struct LlmFilter {
    column: String,
    op: String,
    value: String,
}

async fn llm_filters(
    definition: &str,
    llm: &LlmAdapter,
    deadline: Duration,
    source: Option<(&str, &[String])>,
    target: Option<(&str, &[String])>,
) -> Option<Vec<Filter>> {
    let mut allowed = Vec::new();
    for (table_id, columns) in [source, target].into_iter().flatten() {
        for column in columns {
            allowed.push(format!("{table_id} -> {column}"));
        }
    }
    let prompt = format!(
        "Extract filter predicates from this question:\n\n{definition}\n\n\
         Allowed columns:\n{}\n\n\
         Respond with JSON: {{\"filters\": [{{\"column\": \"...\", \
         \"op\": \"=|!=|<|<=|>|>=|LIKE\", \"value\": \"...\"}}]}}. Use an \
         empty list when there are no filters.",
        allowed.join("\n")
    );
    let result: Result<LlmFilters, _> = llm
        .complete_json(CompletionRequest::json(prompt), deadline)
        .await;
    let parsed = result.ok()?;

    // Attach each filter to the table that owns the referenced column;
    // target wins when both own it.
    let owner_of = |column: &str| {
        for (table_id, columns) in [target, source].into_iter().flatten() {
            if columns.iter().any(|c| c == column) {
                return Some(table_id.to_string());
            }
        }
        None
    };
    Some(
        parsed
            .filters
            .into_iter()
            .filter_map(|f| {
                let table = owner_of(&f.column);
                if table.is_none() {
                    warn!(column = f.column, "LLM filter names an unknown column, dropping");
                    return None;
                }
                Some(Filter {
                    column: f.column,
                    op: f.op,
                    value: f.value,
                    table,
                })
            })
            .collect(),
    )
}

// ============================================================================
// Additional columns
// ============================================================================

/// Columns of non-plan tables mentioned verbatim in the text.
fn additional_columns(
    kg: &KnowledgeGraph,
    definition: &str,
    source: Option<&str>,
    target: Option<&str>,
) -> Vec<AdditionalColumn> {
    let lower = definition.to_ascii_lowercase();
    let mut found = Vec::new();
    for node in kg.nodes.iter().filter(|n| n.label == NodeLabel::Table) {
        if Some(node.id.as_str()) == source || Some(node.id.as_str()) == target {
            continue;
        }
        for column in table_columns(kg, &node.id) {
            let needle = column.to_ascii_lowercase();
            let spoken = needle.replace('_', " ");
            let hit = [&needle, &spoken].into_iter().any(|n| {
                lower
                    .find(n.as_str())
                    .map_or(false, |at| word_bounded(&lower, at, n.len()))
            });
            if hit {
                found.push(AdditionalColumn {
                    column,
                    table_id: node.id.clone(),
                });
            }
        }
    }
    found
}

// ============================================================================
// The parser
// ============================================================================

pub async fn parse_intent(
    kg: &KnowledgeGraph,
    definition: &str,
    classification: &Classification,
    llm: Option<&LlmAdapter>,
    deadline: Duration,
) -> Result<QueryIntent, QueryError> {
    // Entities: exact names and aliases first, LLM fallback second.
    let entities = entity_matches(kg, definition);
    let mut source_table = entities.first().map(|e| e.table_id.clone());
    let mut target_table = entities.get(1).map(|e| e.table_id.clone());

    if source_table.is_none() {
        if let Some(llm) = llm {
            let (suggested_source, suggested_target) =
                llm_entity_fallback(kg, definition, llm, deadline).await;
            source_table = suggested_source;
            if target_table.is_none() {
                target_table = suggested_target;
            }
        }
    }
    let Some(source_id) = source_table.clone() else {
        return Err(QueryError::UnresolvedEntity(definition.to_string()));
    };

    let mut warnings = Vec::new();
    let mut confidence = classification.confidence;

    // Join inference when both endpoints are known.
    let mut join_path = Vec::new();
    if let Some(target_id) = &target_table {
        let mut paths = find_paths(kg, &source_id, target_id, DEFAULT_MAX_HOPS);
        if let Some(best) = paths.drain(..).next() {
            join_path = best;
        } else {
            warnings.push(format!(
                "no join path between `{source_id}` and `{target_id}` within \
                 {DEFAULT_MAX_HOPS} hops"
            ));
            confidence *= 0.7;
        }
    }

    // Filters.
    let source_columns = table_columns(kg, &source_id);
    let target_columns = target_table
        .as_ref()
        .map(|t| table_columns(kg, t))
        .unwrap_or_default();
    let source_ctx = Some((source_id.as_str(), source_columns.as_slice()));
    let target_ctx = target_table
        .as_deref()
        .map(|t| (t, target_columns.as_slice()));

    let mut filters = None;
    if let Some(llm) = llm {
        filters = llm_filters(definition, llm, deadline, source_ctx, target_ctx).await;
    }
    let filters = match filters {
        Some(f) => f,
        None => rule_based_filters(definition, source_ctx, target_ctx),
    };

    // Additional columns drawn from tables outside the plan, with their
    // extension paths. The generator emits one JOIN per hop.
    let extras = additional_columns(
        kg,
        definition,
        Some(source_id.as_str()),
        target_table.as_deref(),
    );
    let mut extension_paths = Vec::new();
    let extension_anchor = target_table.clone().unwrap_or_else(|| source_id.clone());
    let mut kept_extras = Vec::new();
    for extra in extras {
        if extension_paths
            .iter()
            .any(|p: &Vec<PathStep>| p.last().map(|s: &PathStep| s.to_id.as_str()) == Some(extra.table_id.as_str()))
        {
            kept_extras.push(extra);
            continue;
        }
        let mut paths = find_paths(kg, &extension_anchor, &extra.table_id, DEFAULT_MAX_HOPS);
        if let Some(best) = paths.drain(..).next() {
            extension_paths.push(best);
            kept_extras.push(extra);
        } else {
            warnings.push(format!(
                "column `{}` needs table `{}` but no join path reaches it",
                extra.column, extra.table_id
            ));
        }
    }

    // Grouping column, aggregations only: "count ... by <column>".
    let group_by = if classification.query_type == QueryType::AggregationQuery {
        detect_group_by(definition, &target_columns, &source_columns)
    } else {
        None
    };

    Ok(QueryIntent {
        query_type: classification.query_type,
        operation: classification.operation,
        source_table: Some(source_id),
        target_table,
        filters,
        additional_columns: kept_extras,
        join_path,
        extension_paths,
        group_by,
        confidence,
        reasoning: classification.reasoning.clone(),
        warnings,
    })
}

fn detect_group_by(
    definition: &str,
    target_columns: &[String],
    source_columns: &[String],
) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let pattern = RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:grouped\s+by|group\s+by|per|by)\s+([A-Za-z_][A-Za-z0-9_]*)")
            .expect("static regex")
    });
    let token = pattern.captures(definition)?.get(1)?.as_str().to_ascii_lowercase();
    target_columns
        .iter()
        .chain(source_columns)
        .find(|c| c.to_ascii_lowercase() == token)
        .cloned()
}
