//! KPI execution engine
//!
//! `execute` creates a pending history row, resolves cached vs compiled SQL,
//! always persists the statement before running it, applies the material-
//! master projection enhancement, and finalizes the row with a
//! compare-and-set so a concurrent cancel is never overwritten.
//!
//! Long-running executions go through `execute_detached`, which returns the
//! execution id immediately and finishes on a spawned task.

use crate::store::{row_to_kpi, KpiStore};
use crate::KpiError;
use chrono::{DateTime, Utc};
use regex::Regex;
use reconkg_graph::GraphStore;
use reconkg_landing::{DbConfig, LandingDb};
use reconkg_llm::LlmAdapter;
use reconkg_model::kpi::{ExecutionParams, ExecutionStatus, KpiDefinition, KpiExecution, KpiKind};
use reconkg_query::{execute as nl_execute, NlCompiler, SqlDialect};
use sqlx::any::AnyRow;
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_opt(value: Option<&str>) -> String {
    match value {
        Some(v) => quote(v),
        None => "NULL".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub params: ExecutionParams,
    pub source_db: DbConfig,
    pub deadline: Duration,
}

/// One dashboard group: active KPIs joined with their latest execution.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DashboardEntry {
    pub group_name: String,
    pub kpis: Vec<DashboardKpi>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DashboardKpi {
    pub kpi: KpiDefinition,
    pub last_status: Option<String>,
    pub last_records: Option<i64>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct KpiEngine {
    landing: Arc<LandingDb>,
    graphs: Arc<dyn GraphStore>,
    llm: Option<Arc<LlmAdapter>>,
}

impl KpiEngine {
    pub fn new(landing: Arc<LandingDb>, graphs: Arc<dyn GraphStore>) -> Self {
        Self {
            landing,
            graphs,
            llm: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<LlmAdapter>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn store(&self) -> KpiStore<'_> {
        KpiStore::new(&self.landing)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run to completion; returns the execution id.
    pub async fn execute(&self, kpi_id: i64, options: ExecuteOptions) -> Result<String, KpiError> {
        let kpi = self.store().get(kpi_id).await?;
        let execution_id = self.create_execution_row(&kpi, &options.params).await?;
        self.run_execution(&execution_id, kpi, options).await;
        Ok(execution_id)
    }

    /// Create the pending row, spawn the work, return immediately.
    pub async fn execute_detached(
        &self,
        kpi_id: i64,
        options: ExecuteOptions,
    ) -> Result<String, KpiError> {
        let kpi = self.store().get(kpi_id).await?;
        let execution_id = self.create_execution_row(&kpi, &options.params).await?;
        let engine = self.clone();
        let id = execution_id.clone();
        tokio::spawn(async move {
            engine.run_execution(&id, kpi, options).await;
        });
        Ok(execution_id)
    }

    /// Flip a not-yet-finalized execution to `cancelled`.
    pub async fn cancel(&self, execution_id: &str) -> Result<bool, KpiError> {
        let update = format!(
            "UPDATE execution_history SET execution_status = 'cancelled' \
             WHERE execution_id = {} \
             AND execution_status IN ('pending', 'queued', 'running')",
            quote(execution_id)
        );
        let result = sqlx::query(&update).execute(self.landing.pool()).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_execution_row(
        &self,
        kpi: &KpiDefinition,
        params: &ExecutionParams,
    ) -> Result<String, KpiError> {
        let execution_id = Uuid::new_v4().to_string();
        let insert = format!(
            "INSERT INTO execution_history \
             (execution_id, kpi_id, kg_name, select_schema, ruleset_name, db_type, \
              limit_records, use_llm, excluded_fields, operation, execution_status, \
              execution_timestamp) \
             VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, 'kpi', 'pending', {})",
            quote(&execution_id),
            kpi.id,
            quote_opt(params.kg_name.as_deref()),
            quote_opt(params.select_schema.as_deref()),
            quote_opt(params.ruleset_name.as_deref()),
            quote_opt(params.db_type.as_deref()),
            params.limit_records.unwrap_or(1000),
            i32::from(params.use_llm),
            quote(&serde_json::to_string(&params.excluded_fields).unwrap_or_default()),
            quote(&Utc::now().to_rfc3339()),
        );
        sqlx::query(&insert).execute(self.landing.pool()).await?;
        Ok(execution_id)
    }

    async fn run_execution(&self, execution_id: &str, kpi: KpiDefinition, options: ExecuteOptions) {
        if let Err(e) = self
            .run_execution_inner(execution_id, &kpi, &options)
            .await
        {
            warn!(execution = execution_id, error = %e, "execution failed");
            // Failed rows always carry a non-null statement, even when the
            // failure happened before SQL generation.
            let _ = self
                .finalize(
                    execution_id,
                    ExecutionStatus::Failed,
                    &format!(
                        "error_message = {}, generated_sql = COALESCE(generated_sql, '')",
                        quote(&e.to_string())
                    ),
                )
                .await;
        }
    }

    async fn run_execution_inner(
        &self,
        execution_id: &str,
        kpi: &KpiDefinition,
        options: &ExecuteOptions,
    ) -> Result<(), KpiError> {
        // pending -> running; zero rows means a cancel won the race.
        let claim = format!(
            "UPDATE execution_history SET execution_status = 'running' \
             WHERE execution_id = {} AND execution_status = 'pending'",
            quote(execution_id)
        );
        let claimed = sqlx::query(&claim).execute(self.landing.pool()).await?;
        if claimed.rows_affected() == 0 {
            info!(execution = execution_id, "execution cancelled before start");
            return Ok(());
        }

        let dialect = options
            .params
            .db_type
            .as_deref()
            .and_then(SqlDialect::parse)
            .unwrap_or(SqlDialect::MySql);
        let limit = options.params.limit_records.unwrap_or(1000);

        // Cached SQL short-circuits the compiler; the adapter is not called.
        let (generated_sql, confidence, query_type, operation, source_table, target_table) =
            if kpi.is_sql_cached && kpi.cached_sql.is_some() {
                let sql = kpi.cached_sql.clone().unwrap_or_default();
                (sql, 1.0, None, None, None, None)
            } else {
                let kg_name = options.params.kg_name.as_deref().unwrap_or_default();
                let kg = self.graphs.get(kg_name)?;
                let mut compiler = NlCompiler::new(self.graphs.as_ref());
                if let Some(llm) = self.llm.as_deref() {
                    compiler = compiler.with_llm(llm);
                }
                let (intent, sql) = compiler
                    .compile(
                        &kg,
                        &kpi.nl_definition,
                        dialect,
                        limit,
                        options.params.use_llm,
                    )
                    .await?;
                let name_of = |id: Option<&String>| {
                    id.and_then(|i| kg.node(i)).map(|n| n.name.clone())
                };
                (
                    sql,
                    intent.confidence,
                    Some(format!("{:?}", intent.query_type)),
                    Some(format!("{:?}", intent.operation)),
                    name_of(intent.source_table.as_ref()),
                    name_of(intent.target_table.as_ref()),
                )
            };

        // Persist the statement before any execution happens.
        let persist_sql = format!(
            "UPDATE execution_history SET generated_sql = {}, sql_query_type = {}, \
             operation = {}, source_table = {}, target_table = {} \
             WHERE execution_id = {}",
            quote(&generated_sql),
            quote_opt(query_type.as_deref()),
            quote_opt(operation.as_deref()),
            quote_opt(source_table.as_deref()),
            quote_opt(target_table.as_deref()),
            quote(execution_id),
        );
        sqlx::query(&persist_sql).execute(self.landing.pool()).await?;

        // OPS_PLANNER enhancement; both statements are recorded.
        let enhanced_sql = enhance_ops_planner(&generated_sql);
        if let Some(enhanced) = &enhanced_sql {
            let update = format!(
                "UPDATE execution_history SET enhanced_sql = {} WHERE execution_id = {}",
                quote(enhanced),
                quote(execution_id)
            );
            sqlx::query(&update).execute(self.landing.pool()).await?;
        }
        let run_sql = enhanced_sql.as_deref().unwrap_or(&generated_sql);

        let run =
            tokio::time::timeout(options.deadline, nl_execute::execute_query(
                &options.source_db,
                run_sql,
                limit,
            ))
            .await;

        match run {
            Ok(Ok(executed)) => {
                let sample = serde_json::to_string(&executed.sample_rows).unwrap_or_default();
                self.finalize(
                    execution_id,
                    ExecutionStatus::Success,
                    &format!(
                        "number_of_records = {}, execution_time_ms = {}, \
                         confidence_score = {}, result_data = {}",
                        executed.record_count,
                        executed.elapsed_ms,
                        confidence,
                        quote(&sample),
                    ),
                )
                .await?;
                info!(
                    execution = execution_id,
                    records = executed.record_count,
                    "KPI execution succeeded"
                );
            }
            Ok(Err(e)) => {
                self.finalize(
                    execution_id,
                    ExecutionStatus::Failed,
                    &format!("error_message = {}", quote(&e.to_string())),
                )
                .await?;
            }
            Err(_elapsed) => {
                // Timeout is its own status; the SQL stays persisted.
                self.finalize(
                    execution_id,
                    ExecutionStatus::Timeout,
                    &format!("execution_time_ms = {}", options.deadline.as_millis()),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Finalize with compare-and-set: only pending/running rows transition,
    /// so a concurrent cancel sticks.
    async fn finalize(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        extra_sets: &str,
    ) -> Result<(), KpiError> {
        let update = format!(
            "UPDATE execution_history SET execution_status = {}, {extra_sets} \
             WHERE execution_id = {} \
             AND execution_status IN ('pending', 'running')",
            quote(status.as_str()),
            quote(execution_id),
        );
        sqlx::query(&update).execute(self.landing.pool()).await?;
        Ok(())
    }

    // ========================================================================
    // History
    // ========================================================================

    pub async fn list_executions(
        &self,
        kpi_id: i64,
        status: Option<ExecutionStatus>,
        limit: i64,
    ) -> Result<Vec<KpiExecution>, KpiError> {
        let mut sql = format!(
            "SELECT * FROM execution_history WHERE kpi_id = {kpi_id}"
        );
        if let Some(status) = status {
            sql.push_str(&format!(" AND execution_status = {}", quote(status.as_str())));
        }
        sql.push_str(&format!(
            " ORDER BY execution_timestamp DESC, id DESC LIMIT {limit}"
        ));
        let rows = sqlx::query(&sql).fetch_all(self.landing.pool()).await?;
        Ok(rows.iter().map(row_to_execution).collect())
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<KpiExecution, KpiError> {
        let sql = format!(
            "SELECT * FROM execution_history WHERE execution_id = {}",
            quote(execution_id)
        );
        let row = sqlx::query(&sql)
            .fetch_optional(self.landing.pool())
            .await?
            .ok_or_else(|| KpiError::ExecutionNotFound(execution_id.to_string()))?;
        Ok(row_to_execution(&row))
    }

    /// Server-side pagination: re-execute with a deterministic ORDER BY on
    /// the first projected column plus OFFSET/LIMIT.
    pub async fn drilldown(
        &self,
        execution_id: &str,
        source_db: &DbConfig,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<serde_json::Value>, KpiError> {
        let execution = self.get_execution(execution_id).await?;
        let base = execution
            .enhanced_sql
            .or(execution.generated_sql)
            .ok_or_else(|| KpiError::ExecutionNotFound(execution_id.to_string()))?;
        let stripped = strip_trailing_limit(&base);
        let page = page.max(1);
        let size = page_size.clamp(1, 1000);
        let offset = (page - 1) * size;
        let paged = format!(
            "SELECT * FROM ({stripped}) AS drill ORDER BY 1 LIMIT {size} OFFSET {offset}"
        );
        let executed = nl_execute::execute_query(source_db, &paged, size)
            .await
            .map_err(|e| KpiError::Query(e.to_string()))?;
        Ok(executed.sample_rows)
    }

    // ========================================================================
    // Evidence
    // ========================================================================

    /// Reconciliation rows filtered by the KPI's implicit match category.
    /// `extra_filter` ANDs with the implicit filter. Requires the staging
    /// tables of the latest reconciliation run to still exist.
    pub async fn evidence(
        &self,
        kpi_id: i64,
        match_status: Option<String>,
        extra_filter: Option<(String, String)>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<serde_json::Value>, KpiError> {
        let kpi = self.store().get(kpi_id).await?;
        let category = match_status.or_else(|| {
            KpiKind::from_name(kpi.alias_name.as_deref().unwrap_or(&kpi.name))
                .and_then(|k| k.evidence_filter().map(str::to_string))
        });

        // Latest reconciliation run holds the staging tables and join
        // conditions the evidence reads from.
        let row = sqlx::query(
            "SELECT source_table, target_table, joined_columns FROM execution_history \
             WHERE operation = 'reconciliation' AND execution_status = 'success' \
             ORDER BY execution_timestamp DESC, id DESC",
        )
        .fetch_optional(self.landing.pool())
        .await?
        .ok_or_else(|| KpiError::ExecutionNotFound("no reconciliation run".to_string()))?;

        let source: String = row.try_get("source_table").unwrap_or_default();
        let target: String = row.try_get("target_table").unwrap_or_default();
        let joined: String = row.try_get("joined_columns").unwrap_or_default();
        let conditions: Vec<String> = joined
            .split(',')
            .filter(|pair| pair.contains('='))
            .map(str::to_string)
            .collect();
        if source.is_empty() || conditions.is_empty() {
            return Err(KpiError::ExecutionNotFound(
                "reconciliation run has no staging descriptors".to_string(),
            ));
        }
        let on_clause = conditions.join(" AND ");

        let mut sql = match category.as_deref() {
            Some("matched") => format!(
                "SELECT s.* FROM {source} s INNER JOIN {target} t ON {on_clause}"
            ),
            Some("unmatched_source") => format!(
                "SELECT s.* FROM {source} s WHERE NOT EXISTS \
                 (SELECT 1 FROM {target} t WHERE {on_clause})"
            ),
            Some("unmatched_target") => format!(
                "SELECT t.* FROM {target} t WHERE NOT EXISTS \
                 (SELECT 1 FROM {source} s WHERE {on_clause})"
            ),
            // "inactive" relies on the caller's extra filter; the default
            // category reads all source rows.
            _ => format!("SELECT s.* FROM {source} s"),
        };
        if let Some((column, value)) = extra_filter {
            let glue = if sql.contains("WHERE") { " AND" } else { " WHERE" };
            sql.push_str(&format!("{glue} {column} = {}", quote(&value)));
        }
        sql.push_str(&format!(" LIMIT {} OFFSET {}", limit.clamp(1, 10_000), offset.max(0)));

        let rows = sqlx::query(&sql).fetch_all(self.landing.pool()).await?;
        Ok(rows.iter().map(any_row_to_json).collect())
    }

    // ========================================================================
    // Dashboard
    // ========================================================================

    /// Active KPIs grouped by `group_name`, each joined with its most recent
    /// execution's status and record count.
    pub async fn dashboard(&self) -> Result<Vec<DashboardEntry>, KpiError> {
        let kpis = sqlx::query(
            "SELECT * FROM kpi_definitions WHERE is_active = 1 ORDER BY group_name, name",
        )
        .fetch_all(self.landing.pool())
        .await?;

        let mut groups: std::collections::BTreeMap<String, Vec<DashboardKpi>> =
            std::collections::BTreeMap::new();
        for row in &kpis {
            let kpi = row_to_kpi(row);
            let latest = sqlx::query(&format!(
                "SELECT execution_status, number_of_records, execution_timestamp \
                 FROM execution_history WHERE kpi_id = {} \
                 ORDER BY execution_timestamp DESC, id DESC LIMIT 1",
                kpi.id
            ))
            .fetch_optional(self.landing.pool())
            .await?;

            let (last_status, last_records, last_timestamp) = match latest {
                Some(row) => (
                    row.try_get::<String, _>("execution_status").ok(),
                    row.try_get::<i64, _>("number_of_records").ok(),
                    row.try_get::<String, _>("execution_timestamp")
                        .ok()
                        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                        .map(|dt| dt.with_timezone(&Utc)),
                ),
                None => (None, None, None),
            };
            groups
                .entry(kpi.group_name.clone().unwrap_or_else(|| "ungrouped".to_string()))
                .or_default()
                .push(DashboardKpi {
                    kpi,
                    last_status,
                    last_records,
                    last_timestamp,
                });
        }

        Ok(groups
            .into_iter()
            .map(|(group_name, kpis)| DashboardEntry { group_name, kpis })
            .collect())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Inject `<alias>.OPS_PLANNER AS ops_planner` when the statement touches a
/// material-master table and does not already project it. The first alias
/// wins when the table appears more than once. Returns `None` when nothing
/// changed.
pub fn enhance_ops_planner(sql: &str) -> Option<String> {
    if sql.to_ascii_uppercase().contains("OPS_PLANNER") {
        return None;
    }
    let configured = std::env::var("RECONKG_MATERIAL_MASTER")
        .unwrap_or_else(|_| "material_master".to_string());
    let pattern = Regex::new(&format!(
        r#"(?i)(?:FROM|JOIN)\s+[\[`"]?(\w*{}\w*)[\]`"]?\s+(\w+)"#,
        regex::escape(&configured)
    ))
    .ok()?;
    let alias = pattern.captures(sql)?.get(2)?.as_str().to_string();

    let from_at = sql.to_ascii_uppercase().find(" FROM ")?;
    let (select_part, rest) = sql.split_at(from_at);
    Some(format!(
        "{select_part}, {alias}.OPS_PLANNER AS ops_planner{rest}"
    ))
}

fn strip_trailing_limit(sql: &str) -> String {
    let pattern = Regex::new(r"(?i)\s+LIMIT\s+\d+\s*$").expect("static regex");
    pattern.replace(sql, "").to_string()
}

fn any_row_to_json(row: &AnyRow) -> serde_json::Value {
    use sqlx::Column;
    let mut object = serde_json::Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<String, _>(idx) {
            serde_json::Value::String(v)
        } else if let Ok(v) = row.try_get::<i64, _>(idx) {
            serde_json::json!(v)
        } else if let Ok(v) = row.try_get::<f64, _>(idx) {
            serde_json::json!(v)
        } else {
            serde_json::Value::Null
        };
        object.insert(column.name().to_string(), value);
    }
    serde_json::Value::Object(object)
}

fn row_to_execution(row: &AnyRow) -> KpiExecution {
    let parse_ts = |key: &str| {
        row.try_get::<String, _>(key)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    };
    let status = row
        .try_get::<String, _>("execution_status")
        .ok()
        .and_then(|s| ExecutionStatus::parse(&s))
        .unwrap_or(ExecutionStatus::Pending);
    let excluded_fields: Vec<String> = row
        .try_get::<String, _>("excluded_fields")
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let flag = |key: &str| {
        row.try_get::<i64, _>(key)
            .map(|v| v != 0)
            .or_else(|_| row.try_get::<i32, _>(key).map(|v| v != 0))
            .unwrap_or(false)
    };

    KpiExecution {
        id: row.try_get("id").unwrap_or(0),
        kpi_id: row.try_get("kpi_id").unwrap_or(0),
        params: ExecutionParams {
            kg_name: row.try_get("kg_name").ok(),
            select_schema: row.try_get("select_schema").ok(),
            ruleset_name: row.try_get("ruleset_name").ok(),
            db_type: row.try_get("db_type").ok(),
            limit_records: row.try_get("limit_records").ok(),
            use_llm: flag("use_llm"),
            excluded_fields,
        },
        generated_sql: row.try_get("generated_sql").ok(),
        enhanced_sql: row.try_get("enhanced_sql").ok(),
        number_of_records: row.try_get("number_of_records").ok(),
        joined_columns: row
            .try_get::<String, _>("joined_columns")
            .map(|s| {
                s.split(',')
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        sql_query_type: row.try_get("sql_query_type").ok(),
        operation: row.try_get("operation").ok(),
        execution_status: status,
        execution_timestamp: parse_ts("execution_timestamp"),
        execution_time_ms: row.try_get("execution_time_ms").ok(),
        confidence_score: row.try_get("confidence_score").ok(),
        error_message: row.try_get("error_message").ok(),
        result_data: row
            .try_get::<String, _>("result_data")
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok()),
        source_table: row.try_get("source_table").ok(),
        target_table: row.try_get("target_table").ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_planner_injected_with_first_alias() {
        let sql = "SELECT DISTINCT s.* FROM [brz_lnd_RBP_GPU] s \
                   LEFT JOIN [hana_material_master] h ON s.[Material] = h.[MATERIAL] \
                   LEFT JOIN [hana_material_master] m ON s.[Alt] = m.[MATERIAL]";
        let enhanced = enhance_ops_planner(sql).unwrap();
        assert!(enhanced.contains("h.OPS_PLANNER AS ops_planner"));
        assert!(!enhanced.contains("m.OPS_PLANNER"));
        // Injected into the SELECT list, before FROM.
        assert!(enhanced.find("ops_planner").unwrap() < enhanced.find(" FROM ").unwrap());
    }

    #[test]
    fn ops_planner_not_duplicated() {
        let sql = "SELECT s.*, h.OPS_PLANNER AS ops_planner FROM t s \
                   JOIN hana_material_master h ON s.a = h.b";
        assert!(enhance_ops_planner(sql).is_none());
    }

    #[test]
    fn ops_planner_ignores_unrelated_tables() {
        let sql = "SELECT s.* FROM orders s JOIN customers t ON s.a = t.b";
        assert!(enhance_ops_planner(sql).is_none());
    }

    #[test]
    fn trailing_limit_is_stripped_for_drilldown() {
        assert_eq!(
            strip_trailing_limit("SELECT * FROM t LIMIT 100"),
            "SELECT * FROM t"
        );
        assert_eq!(
            strip_trailing_limit("SELECT * FROM t WHERE a = 1"),
            "SELECT * FROM t WHERE a = 1"
        );
    }
}
