//! Multi-table rule composition
//!
//! Field preferences with priority columns drive composite join chains:
//! tables sharing a join column are grouped, ordered from priority-rich to
//! enrichment tables, and emitted as one COMPOSITE rule per connected group.
//! Hops where both sides carry priority fields join INNER; terminal
//! enrichment hops join LEFT. Single-pair rules remain alongside.

use chrono::Utc;
use reconkg_model::prefs::FieldPreference;
use reconkg_model::rules::{
    JoinCondition, JoinType, MatchType, ReconciliationRule, ValidationStatus,
};
use reconkg_model::schema::SchemaDescriptor;
use tracing::debug;

/// A candidate table in a join group.
struct Member<'a> {
    pref: &'a FieldPreference,
    schema: String,
    /// Column shared with the previous table in the chain, once ordered.
    priority_count: usize,
}

/// Compose COMPOSITE rules from field preferences. Tables that cannot be
/// joined to any other preferred table are skipped (their single-pair rules
/// still exist from the pattern pass).
pub fn composite_rules(
    preferences: &[FieldPreference],
    loaded: &[(String, SchemaDescriptor)],
) -> Vec<ReconciliationRule> {
    if preferences.len() < 2 {
        return Vec::new();
    }

    // Resolve each preferred table to its owning schema.
    let mut members: Vec<Member> = Vec::new();
    for pref in preferences {
        let Some(schema) = owning_schema(loaded, &pref.table_name) else {
            debug!(table = pref.table_name, "preference table not in schemas, skipping");
            continue;
        };
        members.push(Member {
            pref,
            schema,
            priority_count: pref.priority_fields.len(),
        });
    }
    if members.len() < 2 {
        return Vec::new();
    }

    // Group tables connected through a shared join column.
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut assigned = vec![false; members.len()];
    for i in 0..members.len() {
        if assigned[i] {
            continue;
        }
        let mut group = vec![i];
        assigned[i] = true;
        let mut grew = true;
        while grew {
            grew = false;
            for j in 0..members.len() {
                if assigned[j] {
                    continue;
                }
                let joinable = group.iter().any(|&g| {
                    shared_join_column(&members[g], &members[j], loaded).is_some()
                });
                if joinable {
                    group.push(j);
                    assigned[j] = true;
                    grew = true;
                }
            }
        }
        if group.len() >= 2 {
            groups.push(group);
        }
    }

    let mut rules = Vec::new();
    for (group_index, mut group) in groups.into_iter().enumerate() {
        // Priority-rich tables first; enrichment tables (no priority fields)
        // sink to the end of the chain.
        group.sort_by(|&a, &b| {
            members[b]
                .priority_count
                .cmp(&members[a].priority_count)
                .then_with(|| members[a].pref.table_name.cmp(&members[b].pref.table_name))
        });

        let mut join_tables = Vec::new();
        let mut join_conditions = Vec::new();
        let mut join_types = Vec::new();
        let mut join_columns = Vec::new();

        // Greedy chain: each new table hangs off whichever chained table it
        // actually shares a join column with, so conditions always name real
        // columns on both sides.
        let mut chained: Vec<usize> = vec![group[0]];
        let mut remaining: Vec<usize> = group[1..].to_vec();
        join_tables.push(members[group[0]].pref.table_name.clone());
        while !remaining.is_empty() {
            let mut advanced = false;
            for (pos, &candidate) in remaining.iter().enumerate() {
                let anchor = chained.iter().find_map(|&g| {
                    shared_join_column(&members[g], &members[candidate], loaded)
                        .map(|column| (g, column))
                });
                if let Some((anchor_idx, column)) = anchor {
                    push_hop(
                        &mut join_tables,
                        &mut join_conditions,
                        &mut join_types,
                        &mut join_columns,
                        &members[anchor_idx],
                        &members[candidate],
                        &column,
                    );
                    chained.push(candidate);
                    remaining.remove(pos);
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                break;
            }
        }
        if join_tables.len() < 2 {
            continue;
        }

        let first = &members[chained[0]];
        let last = &members[*chained.last().unwrap()];
        let first_column = join_columns.first().cloned().unwrap_or_default();
        let last_column = join_columns.last().cloned().unwrap_or_default();

        debug!(
            group = group_index,
            tables = join_tables.len(),
            "composite join chain assembled"
        );
        rules.push(ReconciliationRule {
            rule_id: format!("composite_{:02}", group_index + 1),
            rule_name: format!("composite join over {}", join_tables.join(" -> ")),
            source_schema: first.schema.clone(),
            source_table: first.pref.table_name.clone(),
            source_columns: vec![first_column],
            target_schema: last.schema.clone(),
            target_table: last.pref.table_name.clone(),
            target_columns: vec![last_column],
            match_type: MatchType::Composite,
            transformation: None,
            confidence: 0.85,
            reasoning: format!(
                "field preferences connect {} tables through shared join columns",
                join_tables.len()
            ),
            validation_status: ValidationStatus::Likely,
            llm_generated: false,
            created_at: Utc::now(),
            join_tables: Some(join_tables.clone()),
            join_conditions: Some(join_conditions),
            join_order: Some(join_tables),
            join_types: Some(join_types),
        });
    }

    rules
}

fn push_hop(
    join_tables: &mut Vec<String>,
    join_conditions: &mut Vec<JoinCondition>,
    join_types: &mut Vec<JoinType>,
    join_columns: &mut Vec<String>,
    left: &Member<'_>,
    right: &Member<'_>,
    column: &str,
) {
    join_tables.push(right.pref.table_name.clone());
    join_conditions.push(JoinCondition {
        left: format!("{}.{column}", left.pref.table_name),
        right: format!("{}.{column}", right.pref.table_name),
    });
    // INNER while both sides carry priority fields; LEFT once the chain
    // reaches pure enrichment tables.
    let join_type = if left.priority_count > 0 && right.priority_count > 0 {
        JoinType::Inner
    } else {
        JoinType::Left
    };
    join_types.push(join_type);
    join_columns.push(column.to_string());
}

fn owning_schema(loaded: &[(String, SchemaDescriptor)], table: &str) -> Option<String> {
    loaded
        .iter()
        .find(|(_, s)| s.table(table).is_some())
        .map(|(name, _)| name.clone())
}

/// A join column both tables declare: prefer shared priority fields, then
/// any shared column with an identifier shape.
fn shared_join_column(
    a: &Member<'_>,
    b: &Member<'_>,
    loaded: &[(String, SchemaDescriptor)],
) -> Option<String> {
    let table_a = loaded
        .iter()
        .find(|(name, _)| *name == a.schema)?
        .1
        .table(&a.pref.table_name)?;
    let table_b = loaded
        .iter()
        .find(|(name, _)| *name == b.schema)?
        .1
        .table(&b.pref.table_name)?;

    for field in &a.pref.priority_fields {
        if table_b.has_column(field) && table_a.has_column(field) {
            return Some(field.clone());
        }
    }
    for field in &b.pref.priority_fields {
        if table_a.has_column(field) && table_b.has_column(field) {
            return Some(field.clone());
        }
    }
    table_a
        .columns
        .iter()
        .map(|c| &c.name)
        .find(|name| {
            table_b.has_column(name) && reconkg_model::schema::is_important_column(name)
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconkg_model::schema::{ColumnDescriptor, TableDescriptor};
    use std::collections::BTreeMap;

    fn schema_with(tables: &[(&str, &[&str])]) -> SchemaDescriptor {
        SchemaDescriptor {
            database: "db".to_string(),
            total_tables: tables.len(),
            tables: tables
                .iter()
                .map(|(name, cols)| {
                    (
                        name.to_string(),
                        TableDescriptor {
                            table_name: name.to_string(),
                            columns: cols
                                .iter()
                                .map(|c| ColumnDescriptor {
                                    name: c.to_string(),
                                    data_type: "varchar".to_string(),
                                    nullable: true,
                                    default: None,
                                    primary_key: false,
                                })
                                .collect(),
                            primary_keys: vec![],
                            foreign_keys: vec![],
                            indexes: vec![],
                        },
                    )
                })
                .collect(),
        }
    }

    fn pref(table: &str, priority: &[&str]) -> FieldPreference {
        FieldPreference {
            table_name: table.to_string(),
            priority_fields: priority.iter().map(|s| s.to_string()).collect(),
            excluded_fields: vec![],
            filter_hints: BTreeMap::new(),
        }
    }

    #[test]
    fn chains_priority_tables_inner_and_enrichment_left() {
        let loaded = vec![(
            "s".to_string(),
            schema_with(&[
                ("rbp", &["material_id", "qty"]),
                ("ops", &["material_id", "planner_key"]),
                ("master", &["planner_key", "plant_name"]),
            ]),
        )];
        let prefs = vec![
            pref("rbp", &["material_id"]),
            pref("ops", &["material_id"]),
            pref("master", &[]),
        ];
        let rules = composite_rules(&prefs, &loaded);
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.match_type, MatchType::Composite);
        let tables = rule.join_tables.as_ref().unwrap();
        assert_eq!(tables.len(), 3);
        // Enrichment table (no priority fields) is last.
        assert_eq!(tables.last().map(String::as_str), Some("master"));
        let types = rule.join_types.as_ref().unwrap();
        assert_eq!(types[0], JoinType::Inner);
        assert_eq!(*types.last().unwrap(), JoinType::Left);
        // Conditions name real columns, never placeholders.
        for condition in rule.join_conditions.as_ref().unwrap() {
            assert!(condition.left.contains('.'));
            assert_ne!(condition.left, condition.right);
        }
    }

    #[test]
    fn unjoinable_preferences_produce_no_composite() {
        let loaded = vec![(
            "s".to_string(),
            schema_with(&[("a", &["x"]), ("b", &["y"])]),
        )];
        let prefs = vec![pref("a", &["x"]), pref("b", &["y"])];
        let rules = composite_rules(&prefs, &loaded);
        assert!(rules.is_empty());
    }

    #[test]
    fn single_preference_is_not_composed() {
        let loaded = vec![("s".to_string(), schema_with(&[("a", &["x"])]))];
        let rules = composite_rules(&[pref("a", &["x"])], &loaded);
        assert!(rules.is_empty());
    }
}
