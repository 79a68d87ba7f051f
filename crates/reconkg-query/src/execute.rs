//! NL query executor
//!
//! Runs generated SQL against the configured source database and returns a
//! bounded result sample. Distinct from the reconciliation executor: this
//! path never touches staging tables.

use crate::QueryError;
use reconkg_landing::DbConfig;
use sqlx::any::AnyPoolOptions;
use sqlx::{Column, Row};
use std::sync::Once;
use std::time::{Duration, Instant};
use tracing::debug;

static INSTALL_DRIVERS: Once = Once::new();

const SAMPLE_ROWS: usize = 100;
const CONNECT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct ExecutedQuery {
    pub record_count: i64,
    pub elapsed_ms: u64,
    pub sample_rows: Vec<serde_json::Value>,
}

fn row_to_json(row: &sqlx::any::AnyRow) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<String, _>(idx) {
            serde_json::Value::String(v)
        } else if let Ok(v) = row.try_get::<i64, _>(idx) {
            serde_json::json!(v)
        } else if let Ok(v) = row.try_get::<f64, _>(idx) {
            serde_json::json!(v)
        } else if let Ok(v) = row.try_get::<bool, _>(idx) {
            serde_json::json!(v)
        } else {
            serde_json::Value::Null
        };
        object.insert(column.name().to_string(), value);
    }
    serde_json::Value::Object(object)
}

pub async fn execute_query(
    db: &DbConfig,
    sql: &str,
    limit: i64,
) -> Result<ExecutedQuery, QueryError> {
    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
    let started = Instant::now();

    let pool = AnyPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .connect(&db.connection_url())
        .await
        .map_err(|e| {
            QueryError::Execution(format!("connect to {}: {e}", db.redacted_url()))
        })?;

    let rows = sqlx::query(sql)
        .fetch_all(&pool)
        .await
        .map_err(|e| QueryError::Execution(e.to_string()))?;

    // The limit lives inside the generated SQL; this is just a backstop for
    // dialects whose limit clause the source engine ignored.
    let record_count = rows.len().min(limit.max(0) as usize) as i64;
    let sample_rows: Vec<serde_json::Value> = rows
        .iter()
        .take(SAMPLE_ROWS)
        .map(row_to_json)
        .collect();

    let elapsed_ms = started.elapsed().as_millis() as u64;
    debug!(record_count, elapsed_ms, "query executed");
    Ok(ExecutedQuery {
        record_count,
        elapsed_ms,
        sample_rows,
    })
}
