//! Dialect SQL generator
//!
//! Templates per query type, rendered for MySQL, PostgreSQL, SQL Server, or
//! Oracle. Join conditions always use real column names resolved from the
//! knowledge graph; a path step without join columns fails generation
//! rather than emitting a placeholder.

use crate::intent::{table_columns, QueryIntent};
use crate::classify::{Operation, QueryType};
use crate::QueryError;
use reconkg_model::graph::{KnowledgeGraph, PathStep};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    MySql,
    Postgres,
    SqlServer,
    Oracle,
}

impl SqlDialect {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Some(Self::MySql),
            "postgresql" | "postgres" => Some(Self::Postgres),
            "sqlserver" | "mssql" => Some(Self::SqlServer),
            "oracle" => Some(Self::Oracle),
            _ => None,
        }
    }

    pub fn quote(self, ident: &str) -> String {
        match self {
            Self::MySql => format!("`{ident}`"),
            Self::Postgres | Self::Oracle => format!("\"{ident}\""),
            Self::SqlServer => format!("[{ident}]"),
        }
    }
}

/// A table participating in the generated query.
struct TableRef {
    alias: String,
    table_id: String,
}

fn table_name<'kg>(kg: &'kg KnowledgeGraph, table_id: &str) -> &'kg str {
    kg.node(table_id).map(|n| n.name.as_str()).unwrap_or(table_id)
}

fn literal(value: &str) -> String {
    if value.parse::<f64>().is_ok() {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

fn join_columns_of(step: &PathStep) -> Result<(&str, &str), QueryError> {
    match (step.source_column.as_deref(), step.target_column.as_deref()) {
        (Some(s), Some(t)) => Ok((s, t)),
        _ => Err(QueryError::MissingJoinColumns(
            step.from_id.clone(),
            step.to_id.clone(),
        )),
    }
}

/// Allocate a short alias from the table name, skipping taken ones.
fn extension_alias(table: &str, taken: &mut Vec<String>) -> String {
    let base = table
        .chars()
        .find(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_lowercase().to_string())
        .unwrap_or_else(|| "x".to_string());
    let mut candidate = base.clone();
    let mut suffix = 1;
    while taken.contains(&candidate) {
        suffix += 1;
        candidate = format!("{base}{suffix}");
    }
    taken.push(candidate.clone());
    candidate
}

pub fn generate_sql(
    kg: &KnowledgeGraph,
    intent: &QueryIntent,
    dialect: SqlDialect,
    limit: i64,
) -> Result<String, QueryError> {
    let source_id = intent
        .source_table
        .as_deref()
        .ok_or_else(|| QueryError::UnresolvedEntity("no source table".to_string()))?;

    // A comparison without joinability must fail generation.
    if intent.query_type == QueryType::ComparisonQuery {
        let target_id = intent
            .target_table
            .as_deref()
            .ok_or_else(|| QueryError::UnresolvedEntity("no target table".to_string()))?;
        if intent.join_path.is_empty() {
            return Err(QueryError::NoJoinPath {
                source: source_id.to_string(),
                target: target_id.to_string(),
                max_hops: 3,
            });
        }
    }

    let mut taken = vec!["s".to_string(), "t".to_string()];
    let mut tables: Vec<TableRef> = vec![TableRef {
        alias: "s".to_string(),
        table_id: source_id.to_string(),
    }];

    // Join chain source -> target: intermediates j1.., target is `t`.
    let mut join_clauses: Vec<String> = Vec::new();
    let chain_join = match (intent.query_type, intent.operation) {
        (QueryType::ComparisonQuery, Operation::NotIn) => "LEFT JOIN",
        _ => "INNER JOIN",
    };
    let hops = intent.join_path.len();
    for (i, step) in intent.join_path.iter().enumerate() {
        let (source_col, target_col) = join_columns_of(step)?;
        let left_alias = tables.last().expect("source always present").alias.clone();
        let right_alias = if i + 1 == hops {
            "t".to_string()
        } else {
            let alias = format!("j{}", i + 1);
            taken.push(alias.clone());
            alias
        };
        join_clauses.push(format!(
            "{chain_join} {} {right_alias} ON {left_alias}.{} = {right_alias}.{}",
            dialect.quote(table_name(kg, &step.to_id)),
            dialect.quote(source_col),
            dialect.quote(target_col),
        ));
        tables.push(TableRef {
            alias: right_alias,
            table_id: step.to_id.clone(),
        });
    }

    // Extension joins to additional-column tables are always LEFT: they
    // enrich output without changing join fidelity.
    for path in &intent.extension_paths {
        for step in path {
            if tables.iter().any(|t| t.table_id == step.to_id) {
                continue;
            }
            let (source_col, target_col) = join_columns_of(step)?;
            let left_alias = tables
                .iter()
                .find(|t| t.table_id == step.from_id)
                .map(|t| t.alias.clone())
                .unwrap_or_else(|| "s".to_string());
            let right_name = table_name(kg, &step.to_id);
            let right_alias = extension_alias(right_name, &mut taken);
            join_clauses.push(format!(
                "LEFT JOIN {} {right_alias} ON {left_alias}.{} = {right_alias}.{}",
                dialect.quote(right_name),
                dialect.quote(source_col),
                dialect.quote(target_col),
            ));
            tables.push(TableRef {
                alias: right_alias,
                table_id: step.to_id.clone(),
            });
        }
    }

    let alias_of = |table_id: &str| {
        tables
            .iter()
            .find(|t| t.table_id == table_id)
            .map(|t| t.alias.clone())
    };

    // Projection list.
    let mut select_items: Vec<String> = Vec::new();
    let is_aggregation = intent.query_type == QueryType::AggregationQuery;
    if is_aggregation {
        let agg_alias = intent
            .target_table
            .as_deref()
            .and_then(&alias_of)
            .unwrap_or_else(|| "s".to_string());
        if let Some(group) = &intent.group_by {
            select_items.push(format!("{agg_alias}.{}", dialect.quote(group)));
        }
        select_items.push("COUNT(*) AS count_value".to_string());
    } else {
        select_items.push("s.*".to_string());
        for extra in &intent.additional_columns {
            if let Some(alias) = alias_of(&extra.table_id) {
                select_items.push(format!(
                    "{alias}.{} AS {}",
                    dialect.quote(&extra.column),
                    extra.column.to_ascii_lowercase()
                ));
            }
        }
    }

    // Material-master projection: first alias wins when the table shows up
    // more than once.
    if let Some((alias, table_id)) = tables
        .iter()
        .find(|t| is_material_master(kg, &t.table_id))
        .map(|t| (t.alias.clone(), t.table_id.clone()))
    {
        let already = select_items.iter().any(|s| s.contains("OPS_PLANNER"));
        let columns = table_columns(kg, &table_id);
        let has_column = columns.is_empty() || columns.iter().any(|c| c == "OPS_PLANNER");
        if !already && !is_aggregation && has_column {
            select_items.push(format!("{alias}.OPS_PLANNER AS ops_planner"));
        }
    }

    // WHERE clause: NULL predicate first (NOT_IN), then filters, then the
    // Oracle row limit.
    let mut predicates: Vec<String> = Vec::new();
    if intent.query_type == QueryType::ComparisonQuery && intent.operation == Operation::NotIn {
        let last = intent.join_path.last().expect("checked non-empty");
        let (_, target_col) = join_columns_of(last)?;
        predicates.push(format!("t.{} IS NULL", dialect.quote(target_col)));
    }
    for filter in &intent.filters {
        let alias = filter
            .table
            .as_deref()
            .and_then(&alias_of)
            .unwrap_or_else(|| "s".to_string());
        predicates.push(format!(
            "{alias}.{} {} {}",
            dialect.quote(&filter.column),
            filter.op,
            literal(&filter.value)
        ));
    }
    if dialect == SqlDialect::Oracle {
        predicates.push(format!("ROWNUM <= {limit}"));
    }

    // Assemble.
    let distinct = if is_aggregation { "" } else { "DISTINCT " };
    let top = if dialect == SqlDialect::SqlServer && !is_aggregation {
        format!("TOP {limit} ")
    } else {
        String::new()
    };
    let mut sql = format!(
        "SELECT {distinct}{top}{} FROM {} s",
        select_items.join(", "),
        dialect.quote(table_name(kg, source_id)),
    );
    for clause in &join_clauses {
        sql.push(' ');
        sql.push_str(clause);
    }
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    if is_aggregation {
        if let Some(group) = &intent.group_by {
            let agg_alias = intent
                .target_table
                .as_deref()
                .and_then(&alias_of)
                .unwrap_or_else(|| "s".to_string());
            sql.push_str(&format!(" GROUP BY {agg_alias}.{}", dialect.quote(group)));
        }
    }
    if matches!(dialect, SqlDialect::MySql | SqlDialect::Postgres) {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    debug!(sql, "generated dialect SQL");
    Ok(sql)
}

fn is_material_master(kg: &KnowledgeGraph, table_id: &str) -> bool {
    let configured = std::env::var("RECONKG_MATERIAL_MASTER")
        .unwrap_or_else(|_| "material_master".to_string())
        .to_ascii_lowercase();
    let name = table_name(kg, table_id).to_ascii_lowercase();
    if name.contains(&configured) {
        return true;
    }
    kg.table_aliases.get(table_id).map_or(false, |aliases| {
        aliases
            .iter()
            .any(|a| a.to_ascii_lowercase().replace(' ', "_").contains(&configured))
    })
}
