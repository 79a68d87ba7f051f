//! Reconciliation rules and rulesets
//!
//! A rule matches columns of one table against columns of another, optionally
//! through a transformation fragment; a ruleset is the unit of persistence
//! and execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::InvariantViolation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Composite,
    Transformation,
    Semantic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValidationStatus {
    Valid,
    Likely,
    Uncertain,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    pub fn sql_keyword(self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
            Self::Right => "RIGHT JOIN",
            Self::Full => "FULL JOIN",
        }
    }
}

/// One join hop of a composite rule: `(left_alias.col, right_alias.col)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinCondition {
    pub left: String,
    pub right: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationRule {
    pub rule_id: String,
    pub rule_name: String,
    pub source_schema: String,
    pub source_table: String,
    pub source_columns: Vec<String>,
    pub target_schema: String,
    pub target_table: String,
    pub target_columns: Vec<String>,
    pub match_type: MatchType,
    /// Dialect SQL fragment applied before comparison, e.g.
    /// `UPPER(TRIM(x))`.
    #[serde(default)]
    pub transformation: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    pub validation_status: ValidationStatus,
    #[serde(default)]
    pub llm_generated: bool,
    pub created_at: DateTime<Utc>,
    // Multi-table fields: all set or none set.
    #[serde(default)]
    pub join_tables: Option<Vec<String>>,
    #[serde(default)]
    pub join_conditions: Option<Vec<JoinCondition>>,
    #[serde(default)]
    pub join_order: Option<Vec<String>>,
    #[serde(default)]
    pub join_types: Option<Vec<JoinType>>,
}

impl ReconciliationRule {
    pub fn is_composite(&self) -> bool {
        self.join_tables.is_some()
    }

    /// Rules demoted to INVALID stay in the ruleset for auditing but never
    /// execute.
    pub fn is_executable(&self) -> bool {
        self.validation_status != ValidationStatus::Invalid
    }

    pub fn verify_invariants(&self) -> Result<(), InvariantViolation> {
        if self.source_columns.is_empty() || self.target_columns.is_empty() {
            return Err(InvariantViolation::EmptyColumns {
                rule_id: self.rule_id.clone(),
            });
        }
        if self.source_columns.len() != self.target_columns.len() {
            return Err(InvariantViolation::ColumnCountMismatch {
                rule_id: self.rule_id.clone(),
                source: self.source_columns.len(),
                target: self.target_columns.len(),
            });
        }
        let multi = [
            self.join_tables.is_some(),
            self.join_conditions.is_some(),
            self.join_order.is_some(),
            self.join_types.is_some(),
        ];
        if multi.iter().any(|set| *set) && !multi.iter().all(|set| *set) {
            return Err(InvariantViolation::PartialMultiTable {
                rule_id: self.rule_id.clone(),
            });
        }
        Ok(())
    }

    /// Dedup key: same endpoints, columns, and type collapse to one rule.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}|{}:{}:{}|{:?}",
            self.source_schema,
            self.source_table,
            self.source_columns.join(","),
            self.target_schema,
            self.target_table,
            self.target_columns.join(","),
            self.match_type,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSet {
    pub ruleset_id: String,
    pub ruleset_name: String,
    pub schemas: Vec<String>,
    pub rules: Vec<ReconciliationRule>,
    pub generated_from_kg: String,
    pub created_at: DateTime<Utc>,
}

impl RuleSet {
    pub fn verify_invariants(&self) -> Result<(), InvariantViolation> {
        let mut seen = HashSet::with_capacity(self.rules.len());
        for rule in &self.rules {
            rule.verify_invariants()?;
            if !seen.insert(rule.rule_id.as_str()) {
                return Err(InvariantViolation::DuplicateRuleId {
                    ruleset: self.ruleset_id.clone(),
                    rule_id: rule.rule_id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Canonical rule order:
    /// `(source_schema, source_table, target_schema, target_table, rule_id)`.
    pub fn sort_rules(&mut self) {
        self.rules.sort_by(|a, b| {
            (
                &a.source_schema,
                &a.source_table,
                &a.target_schema,
                &a.target_table,
                &a.rule_id,
            )
                .cmp(&(
                    &b.source_schema,
                    &b.source_table,
                    &b.target_schema,
                    &b.target_table,
                    &b.rule_id,
                ))
        });
    }

    pub fn executable_rules(&self) -> impl Iterator<Item = &ReconciliationRule> {
        self.rules.iter().filter(|r| r.is_executable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str) -> ReconciliationRule {
        ReconciliationRule {
            rule_id: id.to_string(),
            rule_name: format!("rule {id}"),
            source_schema: "a".to_string(),
            source_table: "t1".to_string(),
            source_columns: vec!["c1".to_string()],
            target_schema: "b".to_string(),
            target_table: "t2".to_string(),
            target_columns: vec!["c2".to_string()],
            match_type: MatchType::Exact,
            transformation: None,
            confidence: 0.9,
            reasoning: String::new(),
            validation_status: ValidationStatus::Valid,
            llm_generated: false,
            created_at: Utc::now(),
            join_tables: None,
            join_conditions: None,
            join_order: None,
            join_types: None,
        }
    }

    #[test]
    fn column_count_mismatch_is_rejected() {
        let mut r = rule("r1");
        r.target_columns.push("extra".to_string());
        assert!(matches!(
            r.verify_invariants(),
            Err(InvariantViolation::ColumnCountMismatch { .. })
        ));
    }

    #[test]
    fn partial_multi_table_is_rejected() {
        let mut r = rule("r1");
        r.join_tables = Some(vec!["t1".to_string(), "t2".to_string()]);
        assert!(matches!(
            r.verify_invariants(),
            Err(InvariantViolation::PartialMultiTable { .. })
        ));
    }

    #[test]
    fn duplicate_rule_ids_are_rejected() {
        let rs = RuleSet {
            ruleset_id: "rs1".to_string(),
            ruleset_name: "rs".to_string(),
            schemas: vec![],
            rules: vec![rule("r1"), rule("r1")],
            generated_from_kg: "kg".to_string(),
            created_at: Utc::now(),
        };
        assert!(matches!(
            rs.verify_invariants(),
            Err(InvariantViolation::DuplicateRuleId { .. })
        ));
    }

    #[test]
    fn invalid_rules_are_not_executable() {
        let mut r = rule("r1");
        r.validation_status = ValidationStatus::Invalid;
        assert!(!r.is_executable());
    }

    #[test]
    fn sort_orders_by_schema_then_table_then_id() {
        let mut rs = RuleSet {
            ruleset_id: "rs1".to_string(),
            ruleset_name: "rs".to_string(),
            schemas: vec![],
            rules: vec![rule("r2"), rule("r1")],
            generated_from_kg: "kg".to_string(),
            created_at: Utc::now(),
        };
        rs.sort_rules();
        assert_eq!(rs.rules[0].rule_id, "r1");
    }
}
