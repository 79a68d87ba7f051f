//! Relational schema descriptors
//!
//! The on-disk format is a JSON object per schema:
//!
//! ```json
//! {
//!   "database": "orderMgmt",
//!   "total_tables": 12,
//!   "tables": {
//!     "orders": {
//!       "table_name": "orders",
//!       "columns": [{"name": "order_id", "type": "bigint", "nullable": false,
//!                    "primary_key": true}],
//!       "primary_keys": ["order_id"],
//!       "foreign_keys": [],
//!       "indexes": []
//!     }
//!   }
//! }
//! ```
//!
//! `columns` is an **array** and stays one in memory: column order is
//! significant and lookups iterate the sequence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named schema: its database, and its tables keyed by table name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaDescriptor {
    pub database: String,
    pub total_tables: usize,
    /// BTreeMap so iteration order is stable across builds.
    pub tables: BTreeMap<String, TableDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableDescriptor {
    pub table_name: String,
    /// Ordered column sequence. Never a map.
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyEntry>,
    /// Opaque to everything except the landing manager's index planner.
    #[serde(default)]
    pub indexes: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub primary_key: bool,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForeignKeyEntry {
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    #[serde(default)]
    pub constraint_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl SchemaDescriptor {
    /// Table names in stable (sorted) order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(name)
    }

    /// Structural validation with per-field reasons. An empty vec means valid.
    pub fn validation_errors(&self, schema_name: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.database.is_empty() {
            errors.push(format!("schema `{schema_name}`: `database` is empty"));
        }
        for (key, table) in &self.tables {
            if table.table_name.is_empty() {
                errors.push(format!("table `{key}`: missing `table_name`"));
            } else if table.table_name != *key {
                errors.push(format!(
                    "table `{key}`: `table_name` is `{}`, expected the key",
                    table.table_name
                ));
            }
            if table.columns.is_empty() {
                errors.push(format!("table `{key}`: `columns` is empty"));
            }
            for (idx, col) in table.columns.iter().enumerate() {
                if col.name.is_empty() {
                    errors.push(format!("table `{key}`: column {idx} has an empty name"));
                }
            }
            for pk in &table.primary_keys {
                if !table.has_column(pk) {
                    errors.push(format!(
                        "table `{key}`: primary key `{pk}` is not a declared column"
                    ));
                }
            }
            for fk in &table.foreign_keys {
                if !table.has_column(&fk.source_column) {
                    errors.push(format!(
                        "table `{key}`: foreign key source `{}` is not a declared column",
                        fk.source_column
                    ));
                }
            }
        }
        errors
    }
}

impl TableDescriptor {
    /// A column "exists" iff some element of the sequence has a matching name
    /// (case-sensitive).
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether the column is declared primary either inline or in
    /// `primary_keys`.
    pub fn is_primary(&self, name: &str) -> bool {
        self.primary_keys.iter().any(|pk| pk == name)
            || self.column(name).map(|c| c.primary_key).unwrap_or(false)
    }

    /// Whether the column participates in a declared foreign key.
    pub fn is_foreign(&self, name: &str) -> bool {
        self.foreign_keys.iter().any(|fk| fk.source_column == name)
    }
}

/// Heuristic for columns that get their own graph node: identifiers and
/// reference codes. Everything else rides along as a table property.
pub fn is_important_column(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with("_id")
        || lower == "id"
        || lower.ends_with("_uid")
        || lower.contains("code")
        || lower.contains("key")
        || lower.contains("ref")
}

/// For a reference-shaped column name, the table name it implies.
///
/// `customer_id` -> `customer`, `order_uid` -> `order`, `status_code` ->
/// `status`. Returns `None` for bare `id` and non-reference names.
pub fn implied_table(column_name: &str) -> Option<String> {
    let lower = column_name.to_ascii_lowercase();
    for suffix in ["_id", "_uid", "_code", "_key", "_ref"] {
        if let Some(stem) = lower.strip_suffix(suffix) {
            if !stem.is_empty() {
                return Some(stem.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(columns: &[(&str, bool)]) -> TableDescriptor {
        TableDescriptor {
            table_name: "t".to_string(),
            columns: columns
                .iter()
                .map(|(name, pk)| ColumnDescriptor {
                    name: name.to_string(),
                    data_type: "varchar".to_string(),
                    nullable: true,
                    default: None,
                    primary_key: *pk,
                })
                .collect(),
            primary_keys: vec![],
            foreign_keys: vec![],
            indexes: vec![],
        }
    }

    #[test]
    fn column_lookup_is_case_sensitive() {
        let t = table(&[("Material", false)]);
        assert!(t.has_column("Material"));
        assert!(!t.has_column("material"));
    }

    #[test]
    fn column_order_is_preserved_through_serde() {
        let t = table(&[("z", false), ("a", false), ("m", true)]);
        let json = serde_json::to_string(&t).unwrap();
        let back: TableDescriptor = serde_json::from_str(&json).unwrap();
        let names: Vec<_> = back.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[test]
    fn validation_flags_missing_primary_key_column() {
        let mut t = table(&[("a", false)]);
        t.primary_keys = vec!["missing".to_string()];
        let schema = SchemaDescriptor {
            database: "db".to_string(),
            total_tables: 1,
            tables: BTreeMap::from([("t".to_string(), t)]),
        };
        let errors = schema.validation_errors("s");
        assert!(errors.iter().any(|e| e.contains("primary key `missing`")));
    }

    #[test]
    fn important_column_heuristics() {
        assert!(is_important_column("customer_id"));
        assert!(is_important_column("ITEM_CODE"));
        assert!(is_important_column("part_ref"));
        assert!(!is_important_column("description"));
    }

    #[test]
    fn implied_table_strips_reference_suffixes() {
        assert_eq!(implied_table("customer_id").as_deref(), Some("customer"));
        assert_eq!(implied_table("design_uid").as_deref(), Some("design"));
        assert_eq!(implied_table("id"), None);
        assert_eq!(implied_table("description"), None);
    }
}
