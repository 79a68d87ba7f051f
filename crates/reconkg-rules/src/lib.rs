//! Reconciliation rule generation
//!
//! Derives a ruleset from a knowledge graph:
//!
//! 1. Pattern pass (always): declared foreign keys, UID/code reference
//!    edges, explicit pairs, and recognized name-pair patterns.
//! 2. LLM pass (optional): one call per schema pair, seeded with the rules
//!    already found.
//! 3. Multi-table composition: field preferences with priority columns are
//!    stitched into composite join chains.
//! 4. Validation, confidence/type filtering, dedup, canonical ordering.
//!
//! Structurally broken rules are demoted to `INVALID` and kept for audit;
//! they never execute.

pub mod compose;
pub mod store;

use chrono::Utc;
use reconkg_graph::GraphStore;
use reconkg_llm::{CompletionRequest, LlmAdapter, LlmError};
use reconkg_model::graph::{KnowledgeGraph, Relationship, RelationshipType};
use reconkg_model::prefs::FieldPreference;
use reconkg_model::rules::{MatchType, ReconciliationRule, RuleSet, ValidationStatus};
use reconkg_model::schema::{is_important_column, SchemaDescriptor};
use reconkg_schema::{SchemaError, SchemaStore};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use store::{FsRulesetStore, RulesetStore};

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Graph(#[from] reconkg_graph::StoreError),
    #[error("ruleset store failure: {0}")]
    Store(String),
    #[error("no rules survived generation for kg `{0}`")]
    EmptyRuleset(String),
}

#[derive(Debug, Clone)]
pub struct RuleGenerationRequest {
    pub kg_name: String,
    pub ruleset_name: String,
    pub schemas: Vec<String>,
    pub min_confidence: f64,
    pub use_llm: bool,
    /// Empty means all match types are allowed.
    pub match_types: Vec<MatchType>,
    pub preferences: Vec<FieldPreference>,
}

impl RuleGenerationRequest {
    pub fn new(kg_name: impl Into<String>, ruleset_name: impl Into<String>) -> Self {
        Self {
            kg_name: kg_name.into(),
            ruleset_name: ruleset_name.into(),
            schemas: Vec::new(),
            min_confidence: 0.7,
            use_llm: false,
            match_types: Vec::new(),
            preferences: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuleGenerationReport {
    pub ruleset: RuleSet,
    pub generation_ms: u64,
    pub rules_by_match_type: BTreeMap<String, usize>,
    pub rules_by_status: BTreeMap<String, usize>,
    pub invalid_count: usize,
    pub llm_degraded: bool,
}

pub struct RuleGenerator<'a> {
    graphs: &'a dyn GraphStore,
    schemas: &'a SchemaStore,
    rulesets: &'a dyn RulesetStore,
    llm: Option<&'a LlmAdapter>,
    llm_deadline: Duration,
}

impl<'a> RuleGenerator<'a> {
    pub fn new(
        graphs: &'a dyn GraphStore,
        schemas: &'a SchemaStore,
        rulesets: &'a dyn RulesetStore,
    ) -> Self {
        Self {
            graphs,
            schemas,
            rulesets,
            llm: None,
            llm_deadline: Duration::from_secs(60),
        }
    }

    pub fn with_llm(mut self, llm: &'a LlmAdapter) -> Self {
        self.llm = Some(llm);
        self
    }

    pub async fn generate(
        &self,
        request: &RuleGenerationRequest,
    ) -> Result<RuleGenerationReport, RuleError> {
        let started = Instant::now();
        let kg = self.graphs.get(&request.kg_name)?;

        let mut loaded: Vec<(String, SchemaDescriptor)> = Vec::new();
        for name in &request.schemas {
            loaded.push((name.clone(), self.schemas.load(name)?));
        }

        // Step 1: project to edges inside the requested schema set.
        let edges = project_edges(&kg, &request.schemas);

        // Step 2: pattern pass.
        let mut rules = pattern_rules(&edges, &loaded);

        // Step 3: LLM pass, seeded with what we already found.
        let mut llm_degraded = false;
        if request.use_llm {
            match self.llm {
                Some(llm) => {
                    match llm_rules(llm, &loaded, &rules, request.min_confidence, self.llm_deadline)
                        .await
                    {
                        Ok(extra) => rules.extend(extra),
                        Err(e) => {
                            warn!(error = %e, "LLM rule pass unavailable, pattern rules only");
                            llm_degraded = true;
                        }
                    }
                }
                None => llm_degraded = true,
            }
        }

        // Step 4: multi-table composition from field preferences.
        rules.extend(compose::composite_rules(&request.preferences, &loaded));

        // Step 5: structural validation demotes, never removes.
        let mut invalid_count = 0usize;
        for rule in &mut rules {
            if let Err(reason) = validate_rule(rule, &loaded) {
                debug!(rule = %rule.rule_id, reason, "rule demoted to INVALID");
                rule.validation_status = ValidationStatus::Invalid;
                rule.reasoning = format!("{} [invalid: {reason}]", rule.reasoning);
                invalid_count += 1;
            }
        }

        // Step 6: filter valid rules by confidence and allowed match types;
        // INVALID rules are kept for auditing.
        let rules = filter_rules(rules, request.min_confidence, &request.match_types);
        let rules = dedupe_rules(rules);
        if rules.is_empty() {
            return Err(RuleError::EmptyRuleset(request.kg_name.clone()));
        }

        let mut ruleset = RuleSet {
            ruleset_id: Uuid::new_v4().to_string(),
            ruleset_name: request.ruleset_name.clone(),
            schemas: request.schemas.clone(),
            rules,
            generated_from_kg: request.kg_name.clone(),
            created_at: Utc::now(),
        };
        ruleset.sort_rules();

        self.rulesets
            .save(&ruleset)
            .map_err(|e| RuleError::Store(e.to_string()))?;

        let mut rules_by_match_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut rules_by_status: BTreeMap<String, usize> = BTreeMap::new();
        for rule in &ruleset.rules {
            *rules_by_match_type
                .entry(format!("{:?}", rule.match_type).to_uppercase())
                .or_insert(0) += 1;
            *rules_by_status
                .entry(format!("{:?}", rule.validation_status).to_uppercase())
                .or_insert(0) += 1;
        }
        let generation_ms = started.elapsed().as_millis() as u64;
        info!(
            ruleset = %ruleset.ruleset_id,
            rules = ruleset.rules.len(),
            invalid = invalid_count,
            elapsed_ms = generation_ms,
            "ruleset generated"
        );

        Ok(RuleGenerationReport {
            ruleset,
            generation_ms,
            rules_by_match_type,
            rules_by_status,
            invalid_count,
            llm_degraded,
        })
    }
}

// ============================================================================
// Projection
// ============================================================================

/// Table-level edges whose source and target schemas are both requested.
fn project_edges<'kg>(kg: &'kg KnowledgeGraph, schemas: &[String]) -> Vec<&'kg Relationship> {
    kg.relationships
        .iter()
        .filter(|rel| {
            let source_schema = rel
                .property_str("source_schema")
                .or_else(|| schema_of_node(kg, &rel.source_id));
            let target_schema = rel
                .property_str("target_schema")
                .or_else(|| schema_of_node(kg, &rel.target_id));
            match (source_schema, target_schema) {
                (Some(s), Some(t)) => {
                    schemas.iter().any(|x| x == s) && schemas.iter().any(|x| x == t)
                }
                _ => false,
            }
        })
        .collect()
}

fn schema_of_node<'kg>(kg: &'kg KnowledgeGraph, node_id: &str) -> Option<&'kg str> {
    kg.node(node_id).and_then(|n| n.schema())
}

// ============================================================================
// Pattern pass
// ============================================================================

fn split_table_id(id: &str) -> Option<(&str, &str)> {
    let mut parts = id.splitn(2, ':');
    Some((parts.next()?, parts.next()?))
}

fn next_rule_id(counter: &mut usize) -> String {
    *counter += 1;
    format!("rule_{:04}", *counter)
}

fn pattern_rules(
    edges: &[&Relationship],
    loaded: &[(String, SchemaDescriptor)],
) -> Vec<ReconciliationRule> {
    let mut rules = Vec::new();
    let mut counter = 0usize;
    let now = Utc::now();

    for rel in edges {
        let Some((source_schema, source_table)) = split_table_id(&rel.source_id) else {
            continue;
        };
        let Some((target_schema, target_table)) = split_table_id(&rel.target_id) else {
            continue;
        };
        let source_column = rel.property_str("source_column");
        let target_column = rel.property_str("target_column");

        match rel.rel_type {
            RelationshipType::ForeignKey => {
                let (Some(sc), Some(tc)) = (source_column, target_column) else {
                    continue;
                };
                rules.push(ReconciliationRule {
                    rule_id: next_rule_id(&mut counter),
                    rule_name: format!("{source_table}.{sc} = {target_table}.{tc}"),
                    source_schema: source_schema.to_string(),
                    source_table: source_table.to_string(),
                    source_columns: vec![sc.to_string()],
                    target_schema: target_schema.to_string(),
                    target_table: target_table.to_string(),
                    target_columns: vec![tc.to_string()],
                    match_type: MatchType::Exact,
                    transformation: None,
                    confidence: rel.confidence.min(0.95),
                    reasoning: "declared foreign key constraint".to_string(),
                    validation_status: ValidationStatus::Valid,
                    llm_generated: false,
                    created_at: now,
                    join_tables: None,
                    join_conditions: None,
                    join_order: None,
                    join_types: None,
                });
            }
            RelationshipType::ExplicitPair => {
                let (Some(sc), Some(tc)) = (source_column, target_column) else {
                    continue;
                };
                rules.push(ReconciliationRule {
                    rule_id: next_rule_id(&mut counter),
                    rule_name: format!("{source_table}.{sc} = {target_table}.{tc}"),
                    source_schema: source_schema.to_string(),
                    source_table: source_table.to_string(),
                    source_columns: vec![sc.to_string()],
                    target_schema: target_schema.to_string(),
                    target_table: target_table.to_string(),
                    target_columns: vec![tc.to_string()],
                    match_type: MatchType::Exact,
                    transformation: None,
                    confidence: 1.0,
                    reasoning: "user-supplied relationship pair".to_string(),
                    validation_status: ValidationStatus::Valid,
                    llm_generated: false,
                    created_at: now,
                    join_tables: None,
                    join_conditions: None,
                    join_order: None,
                    join_types: None,
                });
            }
            RelationshipType::References | RelationshipType::CrossSchemaReference => {
                let (Some(sc), Some(tc)) = (source_column, target_column) else {
                    continue;
                };
                if !is_important_column(sc) {
                    continue;
                }
                rules.push(ReconciliationRule {
                    rule_id: next_rule_id(&mut counter),
                    rule_name: format!("{source_table}.{sc} = {target_table}.{tc}"),
                    source_schema: source_schema.to_string(),
                    source_table: source_table.to_string(),
                    source_columns: vec![sc.to_string()],
                    target_schema: target_schema.to_string(),
                    target_table: target_table.to_string(),
                    target_columns: vec![tc.to_string()],
                    match_type: MatchType::Exact,
                    transformation: None,
                    confidence: rel.confidence.clamp(0.80, 0.90),
                    reasoning: format!("{:?} edge on identifier column", rel.rel_type),
                    validation_status: ValidationStatus::Likely,
                    llm_generated: false,
                    created_at: now,
                    join_tables: None,
                    join_conditions: None,
                    join_order: None,
                    join_types: None,
                });
            }
            _ => {}
        }
    }

    // Name-pair patterns between already-related tables: code-style columns
    // get a normalizing transformation, name-style columns a fuzzy rule.
    let mut seen_pairs: HashMap<(String, String), ()> = HashMap::new();
    for rel in edges {
        let Some((source_schema, source_table)) = split_table_id(&rel.source_id) else {
            continue;
        };
        let Some((target_schema, target_table)) = split_table_id(&rel.target_id) else {
            continue;
        };
        if source_table == target_table && source_schema == target_schema {
            continue;
        }
        let key = (rel.source_id.clone(), rel.target_id.clone());
        if seen_pairs.insert(key, ()).is_some() {
            continue;
        }
        let (Some(source), Some(target)) = (
            table_of(loaded, source_schema, source_table),
            table_of(loaded, target_schema, target_table),
        ) else {
            continue;
        };

        for source_col in &source.columns {
            for target_col in &target.columns {
                let sl = source_col.name.to_ascii_lowercase();
                let tl = target_col.name.to_ascii_lowercase();
                if sl == tl {
                    continue; // the exact edge passes already cover these
                }
                let code_pair = (sl == "code" && tl.ends_with("_code"))
                    || (tl == "code" && sl.ends_with("_code"));
                let name_pair = sl.contains("name") && tl.contains("name");
                if code_pair {
                    rules.push(ReconciliationRule {
                        rule_id: next_rule_id(&mut counter),
                        rule_name: format!(
                            "{source_table}.{} ~ {target_table}.{}",
                            source_col.name, target_col.name
                        ),
                        source_schema: source_schema.to_string(),
                        source_table: source_table.to_string(),
                        source_columns: vec![source_col.name.clone()],
                        target_schema: target_schema.to_string(),
                        target_table: target_table.to_string(),
                        target_columns: vec![target_col.name.clone()],
                        match_type: MatchType::Transformation,
                        transformation: Some("UPPER(TRIM(x))".to_string()),
                        confidence: 0.75,
                        reasoning: "code-suffix column pair".to_string(),
                        validation_status: ValidationStatus::Likely,
                        llm_generated: false,
                        created_at: now,
                        join_tables: None,
                        join_conditions: None,
                        join_order: None,
                        join_types: None,
                    });
                } else if name_pair {
                    rules.push(ReconciliationRule {
                        rule_id: next_rule_id(&mut counter),
                        rule_name: format!(
                            "{source_table}.{} ~ {target_table}.{}",
                            source_col.name, target_col.name
                        ),
                        source_schema: source_schema.to_string(),
                        source_table: source_table.to_string(),
                        source_columns: vec![source_col.name.clone()],
                        target_schema: target_schema.to_string(),
                        target_table: target_table.to_string(),
                        target_columns: vec![target_col.name.clone()],
                        match_type: MatchType::Fuzzy,
                        transformation: Some("LEVENSHTEIN(a,b) < 3".to_string()),
                        confidence: 0.70,
                        reasoning: "name-style column pair".to_string(),
                        validation_status: ValidationStatus::Uncertain,
                        llm_generated: false,
                        created_at: now,
                        join_tables: None,
                        join_conditions: None,
                        join_order: None,
                        join_types: None,
                    });
                }
            }
        }
    }

    rules
}

fn table_of<'l>(
    loaded: &'l [(String, SchemaDescriptor)],
    schema: &str,
    table: &str,
) -> Option<&'l reconkg_model::schema::TableDescriptor> {
    loaded
        .iter()
        .find(|(name, _)| name == schema)
        .and_then(|(_, s)| s.table(table))
}

// ============================================================================
// LLM pass
// ============================================================================

#[derive(Debug, Deserialize)]
struct SuggestedRules {
    rules: Vec<SuggestedRule>,
}

#[derive(Debug, Deserialize)]
struct SuggestedRule {
    source_table: String,
    source_columns: Vec<String>,
    target_table: String,
    target_columns: Vec<String>,
    match_type: String,
    #[serde(default)]
    transformation: Option<String>,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

fn parse_match_type(s: &str) -> Option<MatchType> {
    match s.to_ascii_uppercase().as_str() {
        "EXACT" => Some(MatchType::Exact),
        "FUZZY" => Some(MatchType::Fuzzy),
        "COMPOSITE" => Some(MatchType::Composite),
        "TRANSFORMATION" => Some(MatchType::Transformation),
        "SEMANTIC" => Some(MatchType::Semantic),
        _ => None,
    }
}

/// One call per pair of schemas, seeded with the rules found so far.
async fn llm_rules(
    llm: &LlmAdapter,
    loaded: &[(String, SchemaDescriptor)],
    found: &[ReconciliationRule],
    min_confidence: f64,
    deadline: Duration,
) -> Result<Vec<ReconciliationRule>, LlmError> {
    let mut rules = Vec::new();
    let mut counter = 10_000usize; // keep LLM rule ids out of the pattern range
    let now = Utc::now();
    let mut first_call = true;

    for i in 0..loaded.len() {
        for j in (i + 1)..loaded.len() {
            let (left_name, left) = &loaded[i];
            let (right_name, right) = &loaded[j];
            let describe = |name: &str, schema: &SchemaDescriptor| {
                schema
                    .tables
                    .iter()
                    .map(|(t, d)| {
                        format!(
                            "{name}.{t}({})",
                            d.columns
                                .iter()
                                .map(|c| c.name.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            let existing = found
                .iter()
                .map(|r| {
                    format!(
                        "{}.{} <-> {}.{}",
                        r.source_table,
                        r.source_columns.join("+"),
                        r.target_table,
                        r.target_columns.join("+")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            let prompt = format!(
                "Find column-matching reconciliation rules between two schemas.\n\n\
                 Schema `{left_name}`:\n{}\n\nSchema `{right_name}`:\n{}\n\n\
                 Rules already found:\n{existing}\n\n\
                 Suggest additional rules NOT already listed. Respond with JSON: \
                 {{\"rules\": [{{\"source_table\": \"...\", \"source_columns\": [\"...\"], \
                 \"target_table\": \"...\", \"target_columns\": [\"...\"], \
                 \"match_type\": \"EXACT|FUZZY|TRANSFORMATION|SEMANTIC\", \
                 \"transformation\": \"SQL fragment or null\", \"confidence\": 0.0, \
                 \"reasoning\": \"...\"}}]}}.",
                describe(left_name, left),
                describe(right_name, right),
            );

            let result: Result<SuggestedRules, LlmError> = llm
                .complete_json(CompletionRequest::json(prompt), deadline)
                .await;
            let suggested = match result {
                Ok(s) => s,
                Err(e @ LlmError::Unavailable(_)) if first_call => return Err(e),
                Err(e) => {
                    warn!(left = left_name, right = right_name, error = %e,
                          "LLM rule call failed for schema pair");
                    continue;
                }
            };
            first_call = false;

            for suggestion in suggested.rules {
                if suggestion.confidence < min_confidence {
                    continue;
                }
                let Some(match_type) = parse_match_type(&suggestion.match_type) else {
                    continue;
                };
                counter += 1;
                rules.push(ReconciliationRule {
                    rule_id: format!("rule_{counter:04}"),
                    rule_name: format!(
                        "{}.{} ~ {}.{}",
                        suggestion.source_table,
                        suggestion.source_columns.join("+"),
                        suggestion.target_table,
                        suggestion.target_columns.join("+")
                    ),
                    source_schema: left_name.clone(),
                    source_table: suggestion.source_table,
                    source_columns: suggestion.source_columns,
                    target_schema: right_name.clone(),
                    target_table: suggestion.target_table,
                    target_columns: suggestion.target_columns,
                    match_type,
                    transformation: suggestion.transformation,
                    confidence: suggestion.confidence.clamp(0.0, 1.0),
                    reasoning: suggestion.reasoning,
                    validation_status: ValidationStatus::Likely,
                    llm_generated: true,
                    created_at: now,
                    join_tables: None,
                    join_conditions: None,
                    join_order: None,
                    join_types: None,
                });
            }
        }
    }
    Ok(rules)
}

// ============================================================================
// Validation / filtering / dedup
// ============================================================================

fn validate_rule(
    rule: &ReconciliationRule,
    loaded: &[(String, SchemaDescriptor)],
) -> Result<(), String> {
    rule.verify_invariants().map_err(|e| e.to_string())?;

    let source = table_of(loaded, &rule.source_schema, &rule.source_table)
        .ok_or_else(|| format!("source table `{}` not in schemas", rule.source_table))?;
    let target = table_of(loaded, &rule.target_schema, &rule.target_table)
        .ok_or_else(|| format!("target table `{}` not in schemas", rule.target_table))?;
    for col in &rule.source_columns {
        if !source.has_column(col) {
            return Err(format!("source column `{col}` missing"));
        }
    }
    for col in &rule.target_columns {
        if !target.has_column(col) {
            return Err(format!("target column `{col}` missing"));
        }
    }
    if let Some(tables) = &rule.join_tables {
        let conditions = rule.join_conditions.as_ref().map_or(0, |c| c.len());
        if tables.len() < 2 || conditions != tables.len() - 1 {
            return Err("composite rule join chain is inconsistent".to_string());
        }
    }
    Ok(())
}

fn filter_rules(
    rules: Vec<ReconciliationRule>,
    min_confidence: f64,
    match_types: &[MatchType],
) -> Vec<ReconciliationRule> {
    rules
        .into_iter()
        .filter(|rule| {
            if rule.validation_status == ValidationStatus::Invalid {
                return true; // kept for audit
            }
            if rule.confidence < min_confidence {
                return false;
            }
            match_types.is_empty() || match_types.contains(&rule.match_type)
        })
        .collect()
}

/// Same source/target/columns/type: keep the higher confidence.
fn dedupe_rules(rules: Vec<ReconciliationRule>) -> Vec<ReconciliationRule> {
    let mut kept: Vec<ReconciliationRule> = Vec::with_capacity(rules.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for rule in rules {
        let key = rule.dedup_key();
        match index.get(&key) {
            None => {
                index.insert(key, kept.len());
                kept.push(rule);
            }
            Some(&at) => {
                if rule.confidence > kept[at].confidence {
                    kept[at] = rule;
                }
            }
        }
    }
    kept
}
