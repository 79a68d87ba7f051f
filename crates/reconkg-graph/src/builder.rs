//! Graph builder
//!
//! The unified build entry point. Single-schema and multi-schema requests
//! take the same path; a single-schema build is the N=1 case.
//!
//! Determinism contract: with the LLM disabled, edges are emitted in schema
//! list order, then table order as listed by the descriptor, then column
//! index order, and the persisted graph is byte-stable for identical inputs.

use crate::enhance;
use crate::store::{GraphStore, StoreError};
use reconkg_llm::LlmAdapter;
use reconkg_model::graph::{GraphNode, KnowledgeGraph, Relationship, RelationshipType};
use reconkg_model::prefs::{ExcludedFields, FieldPreference, RelationshipPair};
use reconkg_model::schema::{implied_table, is_important_column, SchemaDescriptor};
use reconkg_schema::{SchemaError, SchemaStore};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("schema `{0}` has zero tables")]
    EmptySchema(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct GraphBuildRequest {
    /// Ordered list of schema names; order drives emission determinism.
    pub schemas: Vec<String>,
    pub kg_name: String,
    pub use_llm: bool,
    pub pairs: Vec<RelationshipPair>,
    pub preferences: Vec<FieldPreference>,
    /// Floor for LLM-suggested edges.
    pub min_confidence: f64,
}

impl GraphBuildRequest {
    pub fn new(schemas: Vec<String>, kg_name: impl Into<String>) -> Self {
        Self {
            schemas,
            kg_name: kg_name.into(),
            use_llm: false,
            pairs: Vec::new(),
            preferences: Vec::new(),
            min_confidence: 0.6,
        }
    }
}

/// What the build produced, alongside the persisted graph.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub kg: KnowledgeGraph,
    pub nodes_count: usize,
    pub relationships_count: usize,
    pub edges_by_type: BTreeMap<String, usize>,
    pub pairs_dropped: usize,
    pub aliases_learned: usize,
    pub content_digest: String,
    /// True when `use_llm` was requested but the provider was unavailable.
    pub llm_degraded: bool,
}

/// A user pair with both endpoints resolved to `(schema, table)`.
struct ResolvedPair {
    source_schema: String,
    source_table: String,
    source_column: String,
    target_schema: String,
    target_table: String,
    target_column: String,
    bidirectional: bool,
}

pub struct GraphBuilder<'a> {
    schemas: &'a SchemaStore,
    store: &'a dyn GraphStore,
    llm: Option<&'a LlmAdapter>,
    excluded: ExcludedFields,
    llm_deadline: Duration,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(schemas: &'a SchemaStore, store: &'a dyn GraphStore) -> Self {
        Self {
            schemas,
            store,
            llm: None,
            excluded: ExcludedFields::builtin(),
            llm_deadline: Duration::from_secs(60),
        }
    }

    pub fn with_llm(mut self, llm: &'a LlmAdapter) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_excluded_fields(mut self, excluded: ExcludedFields) -> Self {
        self.excluded = excluded;
        self
    }

    pub fn with_llm_deadline(mut self, deadline: Duration) -> Self {
        self.llm_deadline = deadline;
        self
    }

    /// Build, persist, and report. Schema load failures and store failures
    /// are fatal; LLM failures degrade to rule-based only.
    pub async fn build(&self, request: &GraphBuildRequest) -> Result<BuildReport, BuildError> {
        // Step 1: load and validate every schema up front.
        let mut loaded: Vec<(String, SchemaDescriptor)> = Vec::new();
        for name in &request.schemas {
            let schema = self.schemas.load(name)?;
            if schema.tables.is_empty() {
                return Err(BuildError::EmptySchema(name.clone()));
            }
            loaded.push((name.clone(), schema));
        }

        // Step 2: excluded-fields filter applies to explicit pairs only.
        let (kept_pairs, pairs_dropped) = self.filter_pairs(&request.pairs);
        if pairs_dropped > 0 {
            info!(
                dropped = pairs_dropped,
                kept = kept_pairs.len(),
                "explicit pairs removed by excluded-fields filter"
            );
        }
        let resolved_pairs = resolve_pairs(&loaded, &kept_pairs);

        let mut kg = KnowledgeGraph::new(&request.kg_name);
        kg.schema_file = request.schemas.join(",");

        // Step 3: nodes. Creating a column node also emits its BELONGS_TO
        // edge, so every important column is anchored to its table.
        let mut edges: Vec<Relationship> = Vec::new();
        let pair_columns = pair_column_index(&resolved_pairs);
        let preference_columns = preference_column_index(&request.preferences);
        for (schema_name, schema) in &loaded {
            create_nodes(
                &mut kg,
                &mut edges,
                schema_name,
                schema,
                &pair_columns,
                &preference_columns,
            );
        }

        // Explicit pairs carry confidence 1.0 and are never inferred.
        for pair in &resolved_pairs {
            edges.extend(explicit_pair_edges(pair));
        }

        // Step 4: within-schema relationships, in deterministic order.
        for (schema_name, schema) in &loaded {
            within_schema_edges(&mut edges, schema_name, schema);
        }

        // Step 5: cross-schema references.
        for (schema_name, schema) in &loaded {
            cross_schema_edges(&mut edges, schema_name, schema, &loaded);
        }

        // Step 6/7: LLM enhancement and alias learning.
        let mut llm_degraded = false;
        if request.use_llm {
            if let Some(llm) = self.llm {
                kg.relationships = dedupe_edges(std::mem::take(&mut edges));
                match enhance::suggest_semantic_edges(
                    llm,
                    &kg,
                    &loaded,
                    request.min_confidence,
                    self.llm_deadline,
                )
                .await
                {
                    Ok(suggested) => {
                        edges = std::mem::take(&mut kg.relationships);
                        edges.extend(suggested);
                    }
                    Err(e) => {
                        warn!(error = %e, "LLM enhancement unavailable, rule-based only");
                        edges = std::mem::take(&mut kg.relationships);
                        llm_degraded = true;
                    }
                }
                if !llm_degraded {
                    kg.table_aliases =
                        enhance::learn_table_aliases(llm, &loaded, self.llm_deadline).await;
                }
            } else {
                llm_degraded = true;
            }
        }

        // Step 8: dedup with higher-confidence-wins, non-inferred on ties.
        kg.relationships = dedupe_edges(edges);

        let mut edges_by_type: BTreeMap<String, usize> = BTreeMap::new();
        for rel in &kg.relationships {
            let key = serde_json::to_value(rel.rel_type)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *edges_by_type.entry(key).or_insert(0) += 1;
        }

        kg.metadata.insert(
            "source_schemas".to_string(),
            serde_json::json!(request.schemas),
        );
        kg.metadata
            .insert("nodes_count".to_string(), serde_json::json!(kg.nodes.len()));
        kg.metadata.insert(
            "relationships_count".to_string(),
            serde_json::json!(kg.relationships.len()),
        );
        kg.metadata
            .insert("pairs_dropped".to_string(), serde_json::json!(pairs_dropped));
        kg.metadata
            .insert("use_llm".to_string(), serde_json::json!(request.use_llm));
        if !request.preferences.is_empty() {
            kg.metadata.insert(
                "field_preferences".to_string(),
                serde_json::to_value(&request.preferences).unwrap_or_default(),
            );
        }
        let content_digest = kg.content_digest();
        kg.metadata.insert(
            "content_digest".to_string(),
            serde_json::json!(content_digest),
        );

        // Step 9: persist. Store failures are fatal.
        self.store.put(&kg)?;

        Ok(BuildReport {
            nodes_count: kg.nodes.len(),
            relationships_count: kg.relationships.len(),
            edges_by_type,
            pairs_dropped,
            aliases_learned: kg.table_aliases.len(),
            content_digest,
            llm_degraded,
            kg,
        })
    }

    fn filter_pairs(&self, pairs: &[RelationshipPair]) -> (Vec<RelationshipPair>, usize) {
        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for pair in pairs {
            if self.excluded.blocks(pair) {
                dropped += 1;
            } else {
                kept.push(pair.clone());
            }
        }
        (kept, dropped)
    }
}

// ============================================================================
// Node creation
// ============================================================================

/// `(schema, table) -> columns referenced by resolved pairs`.
fn pair_column_index(pairs: &[ResolvedPair]) -> HashMap<(String, String), HashSet<String>> {
    let mut index: HashMap<(String, String), HashSet<String>> = HashMap::new();
    for pair in pairs {
        index
            .entry((pair.source_schema.clone(), pair.source_table.clone()))
            .or_default()
            .insert(pair.source_column.clone());
        index
            .entry((pair.target_schema.clone(), pair.target_table.clone()))
            .or_default()
            .insert(pair.target_column.clone());
    }
    index
}

/// `table -> columns referenced by field preferences`.
fn preference_column_index(preferences: &[FieldPreference]) -> HashMap<String, HashSet<String>> {
    let mut index: HashMap<String, HashSet<String>> = HashMap::new();
    for pref in preferences {
        let entry = index.entry(pref.table_name.clone()).or_default();
        entry.extend(pref.priority_fields.iter().cloned());
        entry.extend(pref.excluded_fields.iter().cloned());
        entry.extend(pref.filter_hints.keys().cloned());
    }
    index
}

fn create_nodes(
    kg: &mut KnowledgeGraph,
    edges: &mut Vec<Relationship>,
    schema_name: &str,
    schema: &SchemaDescriptor,
    pair_columns: &HashMap<(String, String), HashSet<String>>,
    preference_columns: &HashMap<String, HashSet<String>>,
) {
    for (table_name, table) in &schema.tables {
        let table_id = format!("{schema_name}:{table_name}");
        let mut table_node = GraphNode::table(schema_name, table_name);
        table_node.properties.insert(
            "database".to_string(),
            serde_json::json!(schema.database),
        );

        let pair_cols = pair_columns.get(&(schema_name.to_string(), table_name.clone()));
        let pref_cols = preference_columns.get(table_name);

        let mut plain_columns = Vec::new();
        for column in &table.columns {
            let important = table.is_primary(&column.name)
                || table.is_foreign(&column.name)
                || is_important_column(&column.name)
                || pair_cols.map_or(false, |s| s.contains(&column.name))
                || pref_cols.map_or(false, |s| s.contains(&column.name));
            if important {
                let mut node = GraphNode::column(schema_name, table_name, &column.name);
                node.properties
                    .insert("data_type".to_string(), serde_json::json!(column.data_type));
                node.properties
                    .insert("nullable".to_string(), serde_json::json!(column.nullable));
                node.properties.insert(
                    "primary_key".to_string(),
                    serde_json::json!(table.is_primary(&column.name)),
                );
                edges.push(Relationship {
                    source_id: node.id.clone(),
                    target_id: table_id.clone(),
                    rel_type: RelationshipType::BelongsTo,
                    confidence: 1.0,
                    inferred: true,
                    reasoning: String::new(),
                    properties: BTreeMap::new(),
                });
                kg.nodes.push(node);
            } else {
                plain_columns.push(serde_json::json!({
                    "name": column.name,
                    "type": column.data_type,
                }));
            }
        }
        table_node
            .properties
            .insert("columns".to_string(), serde_json::Value::Array(plain_columns));
        table_node.properties.insert(
            "column_count".to_string(),
            serde_json::json!(table.columns.len()),
        );
        kg.nodes.push(table_node);
    }
}

// ============================================================================
// Edge passes
// ============================================================================

fn rel_props(entries: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Pick the join column on the referenced side: first declared primary key,
/// else a column of the same name, else none.
fn target_join_column(
    schema: &SchemaDescriptor,
    table: &str,
    source_column: &str,
) -> Option<String> {
    let descriptor = schema.table(table)?;
    if let Some(pk) = descriptor.primary_keys.first() {
        return Some(pk.clone());
    }
    if descriptor.has_column(source_column) {
        return Some(source_column.to_string());
    }
    None
}

fn within_schema_edges(
    edges: &mut Vec<Relationship>,
    schema_name: &str,
    schema: &SchemaDescriptor,
) {
    for (table_name, table) in &schema.tables {
        let table_id = format!("{schema_name}:{table_name}");

        // Declared foreign keys: the only non-inferred pattern edges.
        for fk in &table.foreign_keys {
            if schema.table(&fk.target_table).is_none() {
                warn!(
                    schema = schema_name,
                    table = table_name,
                    target = fk.target_table,
                    "foreign key targets a table missing from the schema"
                );
                continue;
            }
            let mut properties = rel_props(&[
                ("source_schema", serde_json::json!(schema_name)),
                ("target_schema", serde_json::json!(schema_name)),
                ("source_column", serde_json::json!(fk.source_column)),
                ("target_column", serde_json::json!(fk.target_column)),
            ]);
            if let Some(constraint) = &fk.constraint_name {
                properties.insert("constraint_name".to_string(), serde_json::json!(constraint));
            }
            edges.push(Relationship {
                source_id: table_id.clone(),
                target_id: format!("{schema_name}:{}", fk.target_table),
                rel_type: RelationshipType::ForeignKey,
                confidence: 0.95,
                inferred: false,
                reasoning: format!(
                    "declared foreign key {}.{} -> {}.{}",
                    table_name, fk.source_column, fk.target_table, fk.target_column
                ),
                properties,
            });
        }

        // Reference-pattern columns pointing at a sibling table.
        for column in &table.columns {
            let Some(implied) = implied_table(&column.name) else {
                continue;
            };
            let Some(target) = schema
                .tables
                .keys()
                .find(|t| t.to_ascii_lowercase() == implied)
            else {
                continue;
            };
            if target == table_name {
                continue;
            }
            if table
                .foreign_keys
                .iter()
                .any(|fk| fk.source_column == column.name)
            {
                continue; // already covered by the declared constraint
            }
            let mut properties = rel_props(&[
                ("source_schema", serde_json::json!(schema_name)),
                ("target_schema", serde_json::json!(schema_name)),
                ("source_column", serde_json::json!(column.name)),
            ]);
            if let Some(target_col) = target_join_column(schema, target, &column.name) {
                properties.insert("target_column".to_string(), serde_json::json!(target_col));
            }
            edges.push(Relationship {
                source_id: table_id.clone(),
                target_id: format!("{schema_name}:{target}"),
                rel_type: RelationshipType::References,
                confidence: 0.85,
                inferred: true,
                reasoning: format!("column `{}` names table `{target}`", column.name),
                properties,
            });
        }
    }

}

fn cross_schema_edges(
    edges: &mut Vec<Relationship>,
    schema_name: &str,
    schema: &SchemaDescriptor,
    all: &[(String, SchemaDescriptor)],
) {
    for (table_name, table) in &schema.tables {
        let table_id = format!("{schema_name}:{table_name}");
        for column in &table.columns {
            let Some(implied) = implied_table(&column.name) else {
                continue;
            };
            for (other_name, other) in all {
                if other_name == schema_name {
                    continue;
                }
                let Some(target) = other
                    .tables
                    .keys()
                    .find(|t| t.to_ascii_lowercase() == implied)
                else {
                    continue;
                };
                let mut properties = rel_props(&[
                    ("source_schema", serde_json::json!(schema_name)),
                    ("target_schema", serde_json::json!(other_name)),
                    ("column_name", serde_json::json!(column.name)),
                    ("source_column", serde_json::json!(column.name)),
                ]);
                if let Some(target_col) = target_join_column(other, target, &column.name) {
                    properties.insert("target_column".to_string(), serde_json::json!(target_col));
                }
                edges.push(Relationship {
                    source_id: table_id.clone(),
                    target_id: format!("{other_name}:{target}"),
                    rel_type: RelationshipType::CrossSchemaReference,
                    confidence: 0.75,
                    inferred: true,
                    reasoning: format!(
                        "column `{}` matches table `{target}` in schema `{other_name}`",
                        column.name
                    ),
                    properties,
                });
            }
        }
    }
}

// ============================================================================
// Explicit pairs
// ============================================================================

/// Resolve pair table references against the loaded schemas. A reference may
/// be `schema.table`, `schema:table`, or a bare table name searched across
/// schemas in request order. Unresolvable pairs are dropped with a warning.
fn resolve_pairs(
    loaded: &[(String, SchemaDescriptor)],
    pairs: &[RelationshipPair],
) -> Vec<ResolvedPair> {
    let mut resolved = Vec::new();
    for pair in pairs {
        let source = resolve_table_ref(loaded, &pair.source_table);
        let target = resolve_table_ref(loaded, &pair.target_table);
        match (source, target) {
            (Some((ss, st)), Some((ts, tt))) => resolved.push(ResolvedPair {
                source_schema: ss,
                source_table: st,
                source_column: pair.source_column.clone(),
                target_schema: ts,
                target_table: tt,
                target_column: pair.target_column.clone(),
                bidirectional: pair.bidirectional,
            }),
            _ => {
                warn!(
                    source = pair.source_table,
                    target = pair.target_table,
                    "explicit pair references an unknown table, dropping"
                );
            }
        }
    }
    resolved
}

fn resolve_table_ref(
    loaded: &[(String, SchemaDescriptor)],
    reference: &str,
) -> Option<(String, String)> {
    let split = reference
        .split_once(':')
        .or_else(|| reference.split_once('.'));
    if let Some((schema, table)) = split {
        return loaded
            .iter()
            .find(|(name, s)| name == schema && s.table(table).is_some())
            .map(|(name, _)| (name.clone(), table.to_string()));
    }
    loaded
        .iter()
        .find(|(_, s)| s.table(reference).is_some())
        .map(|(name, _)| (name.clone(), reference.to_string()))
}

fn explicit_pair_edges(pair: &ResolvedPair) -> Vec<Relationship> {
    let forward = Relationship {
        source_id: format!("{}:{}", pair.source_schema, pair.source_table),
        target_id: format!("{}:{}", pair.target_schema, pair.target_table),
        rel_type: RelationshipType::ExplicitPair,
        confidence: 1.0,
        inferred: false,
        reasoning: "user-supplied relationship pair".to_string(),
        properties: rel_props(&[
            ("source_schema", serde_json::json!(pair.source_schema)),
            ("target_schema", serde_json::json!(pair.target_schema)),
            ("source_column", serde_json::json!(pair.source_column)),
            ("target_column", serde_json::json!(pair.target_column)),
            ("user_defined", serde_json::json!(true)),
            ("bidirectional", serde_json::json!(pair.bidirectional)),
        ]),
    };
    if !pair.bidirectional {
        return vec![forward];
    }
    let twin = Relationship {
        source_id: forward.target_id.clone(),
        target_id: forward.source_id.clone(),
        properties: rel_props(&[
            ("source_schema", serde_json::json!(pair.target_schema)),
            ("target_schema", serde_json::json!(pair.source_schema)),
            ("source_column", serde_json::json!(pair.target_column)),
            ("target_column", serde_json::json!(pair.source_column)),
            ("user_defined", serde_json::json!(true)),
            ("bidirectional", serde_json::json!(true)),
        ]),
        ..forward.clone()
    };
    vec![forward, twin]
}

// ============================================================================
// Dedup
// ============================================================================

/// Same `(source, target, type)`: higher confidence wins; on ties the
/// non-inferred edge wins. First-emission order is preserved.
fn dedupe_edges(edges: Vec<Relationship>) -> Vec<Relationship> {
    let mut kept: Vec<Relationship> = Vec::with_capacity(edges.len());
    let mut index: HashMap<(String, String, RelationshipType), usize> = HashMap::new();
    for edge in edges {
        let key = edge.dedup_key();
        match index.get(&key) {
            None => {
                index.insert(key, kept.len());
                kept.push(edge);
            }
            Some(&at) => {
                let existing = &kept[at];
                let replace = edge.confidence > existing.confidence
                    || (edge.confidence == existing.confidence
                        && !edge.inferred
                        && existing.inferred);
                if replace {
                    kept[at] = edge;
                }
            }
        }
    }
    kept
}
