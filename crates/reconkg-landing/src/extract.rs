//! Data extractor
//!
//! Pulls rows from an arbitrary source/target database and loads them into a
//! staging table on the landing DB. Reads are paged; writes prefer multi-row
//! INSERT batches and fall back to per-row INSERT when a batch fails.
//! Server-side bulk copy (`LOAD DATA LOCAL INFILE`) is the preferred path on
//! MySQL-class landings but needs driver-level local-infile support; when the
//! driver cannot provide it the extractor drops to batched INSERT and says so.
//!
//! On partial failure the staging table is dropped and the error surfaced;
//! transient connect errors are retried exactly once.

use crate::manager::{LandingDb, LandingScheme, MIN_CONNECT_TIMEOUT_SECS};
use crate::{sql_quote, validate_identifier, DbConfig, LandingError};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Column, Row};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_PAGE_SIZE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractStats {
    pub row_count: u64,
    pub size_bytes: u64,
    pub elapsed_ms: u64,
}

/// A decoded cell, ready to render as a SQL literal.
#[derive(Debug, Clone)]
enum CellValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl CellValue {
    fn render(&self) -> String {
        match self {
            Self::Text(s) => sql_quote(s),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Self::Null => "NULL".to_string(),
        }
    }

    fn approximate_bytes(&self) -> u64 {
        match self {
            Self::Text(s) => s.len() as u64,
            Self::Null => 1,
            _ => 8,
        }
    }
}

fn page_size() -> usize {
    std::env::var("RECONKG_BATCH_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PAGE_SIZE)
}

fn bulk_load_requested() -> bool {
    std::env::var("RECONKG_BULK_LOAD").map_or(false, |v| v == "1" || v == "true")
}

async fn connect_source(config: &DbConfig) -> Result<AnyPool, LandingError> {
    let url = config.connection_url();
    let connect = || {
        AnyPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(MIN_CONNECT_TIMEOUT_SECS))
            .connect(&url)
    };
    match connect().await {
        Ok(pool) => Ok(pool),
        Err(first) => {
            // One retry on transient connect errors only.
            warn!(db = %config.redacted_url(), error = %first,
                  "source connect failed, retrying once");
            connect().await.map_err(|e| {
                LandingError::Connect(format!(
                    "failed to connect to {}: {e}",
                    config.redacted_url()
                ))
            })
        }
    }
}

fn decode_row(row: &sqlx::any::AnyRow) -> (Vec<String>, Vec<CellValue>) {
    let mut names = Vec::with_capacity(row.columns().len());
    let mut values = Vec::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        names.push(column.name().to_string());
        let value = if let Ok(v) = row.try_get::<String, _>(idx) {
            CellValue::Text(v)
        } else if let Ok(v) = row.try_get::<i64, _>(idx) {
            CellValue::Integer(v)
        } else if let Ok(v) = row.try_get::<f64, _>(idx) {
            CellValue::Float(v)
        } else if let Ok(v) = row.try_get::<bool, _>(idx) {
            CellValue::Bool(v)
        } else {
            CellValue::Null
        };
        values.push(value);
    }
    (names, values)
}

/// Extract the select's rows into `landing_table`.
pub async fn extract_to_landing(
    source: &DbConfig,
    select_statement: &str,
    landing: &LandingDb,
    landing_table: &str,
) -> Result<ExtractStats, LandingError> {
    let started = Instant::now();
    validate_identifier(landing_table)?;

    if bulk_load_requested() && landing.scheme() == LandingScheme::MySql {
        debug!(
            table = landing_table,
            "server-side bulk copy requested but the driver lacks local-infile; \
             using batched INSERT"
        );
    }

    let pool = connect_source(source).await?;
    let page = page_size();
    let mut offset = 0usize;
    let mut total_rows = 0u64;
    let mut total_bytes = 0u64;

    let result: Result<(), LandingError> = async {
        loop {
            let paged = format!(
                "SELECT * FROM ({select_statement}) AS extract_page LIMIT {page} OFFSET {offset}"
            );
            let rows = sqlx::query(&paged).fetch_all(&pool).await?;
            if rows.is_empty() {
                break;
            }

            let mut column_names: Vec<String> = Vec::new();
            let mut batch: Vec<Vec<CellValue>> = Vec::with_capacity(rows.len());
            for row in &rows {
                let (names, values) = decode_row(row);
                if column_names.is_empty() {
                    for name in &names {
                        validate_identifier(name)?;
                    }
                    column_names = names;
                }
                total_bytes += values.iter().map(CellValue::approximate_bytes).sum::<u64>();
                batch.push(values);
            }

            load_batch(landing, landing_table, &column_names, &batch).await?;
            total_rows += batch.len() as u64;

            if rows.len() < page {
                break;
            }
            offset += page;
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        // Partial loads are useless for reconciliation; drop and surface.
        warn!(table = landing_table, error = %e, "extract failed, dropping staging table");
        let _ = landing.drop_staging(landing_table).await;
        return Err(e);
    }

    landing
        .update_row_count(landing_table, total_rows as i64)
        .await?;

    let stats = ExtractStats {
        row_count: total_rows,
        size_bytes: total_bytes,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        table = landing_table,
        rows = stats.row_count,
        bytes = stats.size_bytes,
        elapsed_ms = stats.elapsed_ms,
        "extract complete"
    );
    Ok(stats)
}

/// Multi-row INSERT; per-row fallback isolates a poison row.
async fn load_batch(
    landing: &LandingDb,
    table: &str,
    columns: &[String],
    batch: &[Vec<CellValue>],
) -> Result<(), LandingError> {
    if batch.is_empty() {
        return Ok(());
    }
    let column_list = columns.join(", ");
    let tuples: Vec<String> = batch
        .iter()
        .map(|values| {
            format!(
                "({})",
                values.iter().map(CellValue::render).collect::<Vec<_>>().join(", ")
            )
        })
        .collect();

    let multi = format!(
        "INSERT INTO {table} ({column_list}) VALUES {}",
        tuples.join(", ")
    );
    if sqlx::query(&multi).execute(landing.pool()).await.is_ok() {
        return Ok(());
    }

    warn!(table, rows = batch.len(), "batch INSERT failed, falling back to per-row");
    for tuple in tuples {
        let single = format!("INSERT INTO {table} ({column_list}) VALUES {tuple}");
        sqlx::query(&single).execute(landing.pool()).await?;
    }
    Ok(())
}
