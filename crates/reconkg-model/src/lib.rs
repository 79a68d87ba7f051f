//! Reconkg shared data model
//!
//! Every other crate in the workspace speaks these types:
//!
//! - `schema`: relational schema descriptors as loaded from JSON
//! - `graph`: the knowledge graph (nodes, typed relationships, aliases)
//! - `rules`: reconciliation rules and rulesets derived from a graph
//! - `kpi`: KPI definitions, execution records, and threshold buckets
//! - `prefs`: user-supplied relationship pairs, field preferences, and the
//!   excluded-fields set
//!
//! The crate is deliberately dependency-light: serde types, timestamps, ids,
//! and invariant checks. Anything that talks to a store, a database, or an
//! LLM lives in the crates that own those concerns.

pub mod graph;
pub mod kpi;
pub mod prefs;
pub mod rules;
pub mod schema;

pub use graph::{
    GraphNode, GraphPattern, KnowledgeGraph, NodeLabel, PathStep, Relationship, RelationshipType,
};
pub use kpi::{
    AssessmentStatus, ExecutionStatus, KpiDefinition, KpiExecution, KpiKind, KpiValues,
};
pub use prefs::{ExcludedFields, FieldPreference, RelationshipPair};
pub use rules::{JoinType, MatchType, ReconciliationRule, RuleSet, ValidationStatus};
pub use schema::{
    ColumnDescriptor, ForeignKeyEntry, IndexEntry, SchemaDescriptor, TableDescriptor,
};

/// Breach of a structural invariant (spec'd data-model contracts).
///
/// These are bugs, not user errors: callers log them with full context and
/// surface a 500-class failure.
#[derive(Debug, thiserror::Error)]
pub enum InvariantViolation {
    #[error("relationship endpoint `{node_id}` is not a node of graph `{graph}`")]
    DanglingEndpoint { graph: String, node_id: String },
    #[error("duplicate node id `{node_id}` in graph `{graph}`")]
    DuplicateNodeId { graph: String, node_id: String },
    #[error("confidence {confidence} outside [0,1] on edge {source_id} -> {target_id}")]
    ConfidenceOutOfRange {
        source_id: String,
        target_id: String,
        confidence: f64,
    },
    #[error("rule `{rule_id}` has {source} source columns but {target} target columns")]
    ColumnCountMismatch {
        rule_id: String,
        source: usize,
        target: usize,
    },
    #[error("rule `{rule_id}` has empty column lists")]
    EmptyColumns { rule_id: String },
    #[error("rule `{rule_id}` sets some multi-table fields but not all")]
    PartialMultiTable { rule_id: String },
    #[error("duplicate rule id `{rule_id}` in ruleset `{ruleset}`")]
    DuplicateRuleId { ruleset: String, rule_id: String },
}
