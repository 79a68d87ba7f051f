//! User-supplied build inputs: relationship pairs, field preferences, and
//! the excluded-fields set.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A column-to-column relationship asserted by the user without inference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipPair {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    #[serde(default)]
    pub bidirectional: bool,
}

/// Per-table priority/exclusion hints consumed by rule generation and
/// multi-table join composition. Excluded fields here apply only within rule
/// generation, not in the KG build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FieldPreference {
    pub table_name: String,
    #[serde(default)]
    pub priority_fields: Vec<String>,
    #[serde(default)]
    pub excluded_fields: Vec<String>,
    #[serde(default)]
    pub filter_hints: BTreeMap<String, String>,
}

impl FieldPreference {
    pub fn has_priority(&self, column: &str) -> bool {
        self.priority_fields.iter().any(|f| f == column)
    }
}

/// Administrative field names that must never anchor an explicit
/// relationship pair. Comparison is exact on the supplied string.
const BUILTIN_EXCLUDED_FIELDS: &[&str] = &[
    "Product_Line",
    "product_line",
    "PRODUCT_LINE",
    "Product Line",
    "Business_Unit",
    "business_unit",
    "BUSINESS_UNIT",
    "Business Unit",
    "[Business Unit]",
    "BUSINESS_UNIT_CODE",
    "business unit",
    "[Product Type]",
    "Product Type",
    "product_type",
    "PRODUCT_TYPE",
];

/// The process-wide excluded-fields set. Built-in literals plus an optional
/// deployment override.
#[derive(Debug, Clone)]
pub struct ExcludedFields {
    fields: HashSet<String>,
}

impl Default for ExcludedFields {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ExcludedFields {
    pub fn builtin() -> Self {
        Self {
            fields: BUILTIN_EXCLUDED_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Replace the built-in set entirely (deployment override).
    pub fn from_override<I: IntoIterator<Item = String>>(fields: I) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    /// Whether the pair touches an excluded field on either endpoint.
    pub fn blocks(&self, pair: &RelationshipPair) -> bool {
        self.contains(&pair.source_column) || self.contains(&pair.target_column)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
