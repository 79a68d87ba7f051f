//! The knowledge graph
//!
//! A named container of typed nodes and directed, confidence-weighted edges
//! over tables and columns, plus the learned table aliases and arbitrary
//! build metadata.
//!
//! Two contracts matter everywhere:
//!
//! 1. Every edge endpoint is a node id present in `nodes`.
//! 2. With the LLM disabled, a rebuild of identical inputs produces a
//!    byte-identical persisted graph. Canonical ordering and the content
//!    digest below exist to make that checkable.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

use crate::InvariantViolation;

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeLabel {
    Table,
    Column,
    Entity,
}

/// A graph node. `id` is stable within a KG name: `schema:table` for tables,
/// `schema:table:column` for columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub label: NodeLabel,
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl GraphNode {
    pub fn table(schema: &str, table: &str) -> Self {
        Self {
            id: format!("{schema}:{table}"),
            label: NodeLabel::Table,
            name: table.to_string(),
            properties: BTreeMap::from([(
                "schema".to_string(),
                serde_json::Value::String(schema.to_string()),
            )]),
        }
    }

    pub fn column(schema: &str, table: &str, column: &str) -> Self {
        Self {
            id: format!("{schema}:{table}:{column}"),
            label: NodeLabel::Column,
            name: column.to_string(),
            properties: BTreeMap::from([
                (
                    "schema".to_string(),
                    serde_json::Value::String(schema.to_string()),
                ),
                (
                    "table".to_string(),
                    serde_json::Value::String(table.to_string()),
                ),
            ]),
        }
    }

    /// Owning schema, when recorded in the node properties.
    pub fn schema(&self) -> Option<&str> {
        self.properties.get("schema").and_then(|v| v.as_str())
    }
}

// ============================================================================
// Relationships
// ============================================================================

/// Closed set of edge types. Pattern passes emit the first group;
/// LLM enhancement emits the semantic group; EXPLICIT_PAIR is user-supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    ForeignKey,
    References,
    BelongsTo,
    Has,
    Contains,
    AssociatesWith,
    InheritsFrom,
    Tracks,
    CrossSchemaReference,
    SemanticReference,
    BusinessLogic,
    Hierarchical,
    Temporal,
    Lookup,
    ExplicitPair,
}

impl RelationshipType {
    /// Types that only the LLM enhancement pass may produce.
    pub fn is_semantic(self) -> bool {
        matches!(
            self,
            Self::SemanticReference
                | Self::BusinessLogic
                | Self::Hierarchical
                | Self::Temporal
                | Self::Lookup
        )
    }

    /// Join-inference priority: lower ranks are preferred path material.
    pub fn path_priority(self) -> u8 {
        match self {
            Self::ForeignKey => 0,
            Self::References => 1,
            Self::CrossSchemaReference => 2,
            Self::ExplicitPair => 3,
            _ => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub rel_type: RelationshipType,
    pub confidence: f64,
    /// False only for user-supplied pairs and declared FK constraints.
    pub inferred: bool,
    #[serde(default)]
    pub reasoning: String,
    /// May carry `source_schema`, `target_schema`, `source_column`,
    /// `target_column`, `user_defined`, `bidirectional`.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Relationship {
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    /// Dedup key: two edges collide when source, target, and type all match.
    pub fn dedup_key(&self) -> (String, String, RelationshipType) {
        (
            self.source_id.clone(),
            self.target_id.clone(),
            self.rel_type,
        )
    }
}

// ============================================================================
// The graph container
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct KnowledgeGraph {
    pub name: String,
    pub nodes: Vec<GraphNode>,
    pub relationships: Vec<Relationship>,
    /// Identifier of the originating schema(s), comma-joined.
    #[serde(default)]
    pub schema_file: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Fully-qualified table name -> ordered business aliases, learned once
    /// by the LLM during build.
    #[serde(default)]
    pub table_aliases: BTreeMap<String, Vec<String>>,
}

impl KnowledgeGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    /// Table node ids, in graph order.
    pub fn table_ids(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.label == NodeLabel::Table)
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Resolve a table node by bare table name (any schema). First match in
    /// graph order wins.
    pub fn table_by_name(&self, table: &str) -> Option<&GraphNode> {
        self.nodes
            .iter()
            .find(|n| n.label == NodeLabel::Table && n.name == table)
    }

    /// Resolve a table through the learned aliases, case-insensitively.
    /// Returns the fully-qualified table key.
    pub fn table_by_alias(&self, candidate: &str) -> Option<String> {
        let lower = candidate.to_ascii_lowercase();
        for (qualified, aliases) in &self.table_aliases {
            if aliases.iter().any(|a| a.to_ascii_lowercase() == lower) {
                return Some(qualified.clone());
            }
        }
        None
    }

    /// All edges touching the node, either direction.
    pub fn edges_of(&self, node_id: &str) -> Vec<&Relationship> {
        self.relationships
            .iter()
            .filter(|r| r.source_id == node_id || r.target_id == node_id)
            .collect()
    }

    /// Structural invariants of the data model. Call before persisting.
    pub fn verify_invariants(&self) -> Result<(), InvariantViolation> {
        let mut ids = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(InvariantViolation::DuplicateNodeId {
                    graph: self.name.clone(),
                    node_id: node.id.clone(),
                });
            }
        }
        for rel in &self.relationships {
            for endpoint in [&rel.source_id, &rel.target_id] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(InvariantViolation::DanglingEndpoint {
                        graph: self.name.clone(),
                        node_id: endpoint.clone(),
                    });
                }
            }
            if !(0.0..=1.0).contains(&rel.confidence) {
                return Err(InvariantViolation::ConfidenceOutOfRange {
                    source_id: rel.source_id.clone(),
                    target_id: rel.target_id.clone(),
                    confidence: rel.confidence,
                });
            }
        }
        Ok(())
    }

    /// Sort nodes and edges into canonical order. Builders emit in a
    /// deterministic order already; this makes persisted output stable even
    /// after merges.
    pub fn canonicalize(&mut self) {
        self.nodes.sort_by(|a, b| a.id.cmp(&b.id));
        self.relationships.sort_by(|a, b| {
            (&a.source_id, &a.target_id, a.rel_type)
                .cmp(&(&b.source_id, &b.target_id, b.rel_type))
        });
    }

    /// Content digest over the canonical JSON serialization. Identical
    /// inputs (LLM disabled) produce identical digests across rebuilds.
    pub fn content_digest(&self) -> String {
        let mut canonical = self.clone();
        canonical.canonicalize();
        // The digest itself must not feed back into the digest.
        canonical.metadata.remove("content_digest");
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("sha256:{:x}", hasher.finalize())
    }
}

// ============================================================================
// Store query patterns
// ============================================================================

/// Best-effort subgraph queries every graph store must answer.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphPattern {
    /// All edges touching a node.
    NeighborsOf { node_id: String },
    /// Edges between two table nodes (either direction), including edges
    /// between their columns.
    EdgesBetween { table_a: String, table_b: String },
    /// Bounded-length paths between two table nodes.
    PathsUpTo {
        source_id: String,
        target_id: String,
        max_hops: usize,
    },
    /// Node/edge counts per label/type.
    Stats,
}

/// One hop of a discovered path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathStep {
    pub from_id: String,
    pub to_id: String,
    pub rel_type: RelationshipType,
    pub confidence: f64,
    /// Join columns on each side, when the edge carries them.
    pub source_column: Option<String>,
    pub target_column: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn small_graph() -> KnowledgeGraph {
        let mut kg = KnowledgeGraph::new("test");
        kg.nodes.push(GraphNode::table("s1", "orders"));
        kg.nodes.push(GraphNode::table("s1", "customers"));
        kg.relationships.push(Relationship {
            source_id: "s1:orders".to_string(),
            target_id: "s1:customers".to_string(),
            rel_type: RelationshipType::ForeignKey,
            confidence: 0.95,
            inferred: false,
            reasoning: "declared constraint".to_string(),
            properties: BTreeMap::new(),
        });
        kg
    }

    #[test]
    fn invariants_hold_on_well_formed_graph() {
        assert!(small_graph().verify_invariants().is_ok());
    }

    #[test]
    fn dangling_endpoint_is_rejected() {
        let mut kg = small_graph();
        kg.relationships[0].target_id = "s1:ghost".to_string();
        assert!(matches!(
            kg.verify_invariants(),
            Err(InvariantViolation::DanglingEndpoint { .. })
        ));
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let mut kg = small_graph();
        kg.relationships[0].confidence = 1.5;
        assert!(matches!(
            kg.verify_invariants(),
            Err(InvariantViolation::ConfidenceOutOfRange { .. })
        ));
    }

    #[test]
    fn digest_is_stable_under_reordering() {
        let kg = small_graph();
        let mut shuffled = kg.clone();
        shuffled.nodes.reverse();
        assert_eq!(kg.content_digest(), shuffled.content_digest());
    }

    #[test]
    fn digest_changes_with_content() {
        let kg = small_graph();
        let mut other = kg.clone();
        other.nodes.push(GraphNode::table("s2", "parts"));
        assert_ne!(kg.content_digest(), other.content_digest());
    }

    #[test]
    fn alias_resolution_is_case_insensitive() {
        let mut kg = small_graph();
        kg.table_aliases.insert(
            "s1:orders".to_string(),
            vec!["Order Book".to_string(), "OB".to_string()],
        );
        assert_eq!(kg.table_by_alias("order book").as_deref(), Some("s1:orders"));
        assert_eq!(kg.table_by_alias("ob").as_deref(), Some("s1:orders"));
        assert_eq!(kg.table_by_alias("nothing"), None);
    }

    proptest! {
        #[test]
        fn canonicalize_preserves_digest(seed in 0u64..1000) {
            let mut kg = small_graph();
            kg.nodes.push(GraphNode::table("s2", &format!("t{seed}")));
            let digest_before = kg.content_digest();
            kg.canonicalize();
            prop_assert_eq!(digest_before, kg.content_digest());
        }
    }
}
