//! Landing DB manager
//!
//! Staging table lifecycle on a single relational store: creation with
//! dialect-native DDL, join-column indexes, TTL-driven cleanup, and the
//! metadata/history tables everything else records into. Staging creation
//! and its metadata row commit in one transaction.

use crate::{sql_quote, validate_identifier, LandingError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::future::Future;
use std::pin::Pin;
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info, warn};

static INSTALL_DRIVERS: Once = Once::new();

/// Hard minimums from the resource model; shorter values are treated as
/// misconfiguration and raised to the floor.
pub const MIN_CONNECT_TIMEOUT_SECS: u64 = 60;
pub const MIN_QUERY_TIMEOUT_SECS: u64 = 120;

const MAX_VARCHAR: usize = 4000;
const DEFAULT_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandingScheme {
    MySql,
    Postgres,
    Sqlite,
}

impl LandingScheme {
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("mysql://") || url.starts_with("mariadb://") {
            Some(Self::MySql)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else if url.starts_with("sqlite:") {
            Some(Self::Sqlite)
        } else {
            None
        }
    }

    /// Positional placeholder in this scheme's syntax.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            _ => "?".to_string(),
        }
    }

    fn autoincrement_pk(self) -> &'static str {
        match self {
            Self::MySql => "BIGINT PRIMARY KEY AUTO_INCREMENT",
            Self::Postgres => "BIGSERIAL PRIMARY KEY",
            Self::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }

    fn timestamp_type(self) -> &'static str {
        match self {
            Self::MySql => "DATETIME",
            Self::Postgres => "TIMESTAMPTZ",
            Self::Sqlite => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingRole {
    Source,
    Target,
}

impl StagingRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Target => "target",
        }
    }
}

/// Column kind for staging DDL; widths come from sampling the extract.
#[derive(Debug, Clone, PartialEq)]
pub enum StagingType {
    /// Sampled max length; capped at 4000.
    Text { max_len: usize },
    Integer,
    Decimal,
    Date,
    Timestamp,
    Boolean,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagingColumn {
    pub name: String,
    pub kind: StagingType,
}

impl StagingColumn {
    pub fn text(name: impl Into<String>, max_len: usize) -> Self {
        Self {
            name: name.into(),
            kind: StagingType::Text { max_len },
        }
    }
}

/// Metadata row for one staged table.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingTableMeta {
    pub table_name: String,
    pub execution_id: String,
    pub ruleset_id: String,
    pub source_or_target: String,
    pub row_count: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: String,
}

pub struct LandingDb {
    pool: AnyPool,
    scheme: LandingScheme,
    ttl: ChronoDuration,
}

impl LandingDb {
    /// Establish the process-wide pooled connection.
    ///
    /// `RECONKG_STAGING_TTL_HOURS` overrides the default 24h TTL.
    pub async fn connect(url: &str) -> Result<Self, LandingError> {
        let scheme = LandingScheme::from_url(url).ok_or_else(|| {
            LandingError::Connect(format!(
                "unsupported landing URL scheme: {}",
                crate::config::redact_url(url)
            ))
        })?;
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let pool = AnyPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(MIN_CONNECT_TIMEOUT_SECS))
            .connect(url)
            .await
            .map_err(|e| {
                LandingError::Connect(format!(
                    "failed to connect to landing DB {}: {e}",
                    crate::config::redact_url(url)
                ))
            })?;

        let ttl_hours = std::env::var("RECONKG_STAGING_TTL_HOURS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_TTL_HOURS);

        Ok(Self {
            pool,
            scheme,
            ttl: ChronoDuration::hours(ttl_hours),
        })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn scheme(&self) -> LandingScheme {
        self.scheme
    }

    pub fn ttl(&self) -> ChronoDuration {
        self.ttl
    }

    /// Create the metadata and history tables if missing.
    pub async fn bootstrap(&self) -> Result<(), LandingError> {
        let id = self.scheme.autoincrement_pk();
        let ts = self.scheme.timestamp_type();

        let staging_meta = format!(
            "CREATE TABLE IF NOT EXISTS staging_table_metadata (
                id {id},
                table_name VARCHAR(128) NOT NULL,
                execution_id VARCHAR(64) NOT NULL,
                ruleset_id VARCHAR(64) NOT NULL,
                source_or_target VARCHAR(8) NOT NULL,
                row_count BIGINT NOT NULL DEFAULT 0,
                created_at {ts} NOT NULL,
                expires_at {ts} NOT NULL,
                status VARCHAR(16) NOT NULL DEFAULT 'active'
            )"
        );
        sqlx::query(&staging_meta).execute(&self.pool).await?;

        let history = format!(
            "CREATE TABLE IF NOT EXISTS execution_history (
                id {id},
                execution_id VARCHAR(64) NOT NULL,
                kpi_id BIGINT,
                kg_name VARCHAR(128),
                select_schema VARCHAR(256),
                ruleset_name VARCHAR(128),
                db_type VARCHAR(32),
                limit_records BIGINT,
                use_llm SMALLINT NOT NULL DEFAULT 0,
                excluded_fields TEXT,
                generated_sql TEXT,
                enhanced_sql TEXT,
                number_of_records BIGINT,
                joined_columns TEXT,
                sql_query_type VARCHAR(64),
                operation VARCHAR(64),
                execution_status VARCHAR(16) NOT NULL,
                execution_timestamp {ts} NOT NULL,
                execution_time_ms BIGINT,
                confidence_score DOUBLE PRECISION,
                error_message TEXT,
                result_data TEXT,
                source_table VARCHAR(128),
                target_table VARCHAR(128)
            )"
        );
        sqlx::query(&history).execute(&self.pool).await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_staging_status ON staging_table_metadata (status)",
            "CREATE INDEX IF NOT EXISTS idx_staging_table ON staging_table_metadata (table_name)",
            "CREATE INDEX IF NOT EXISTS idx_history_exec ON execution_history (execution_id)",
            "CREATE INDEX IF NOT EXISTS idx_history_kpi ON execution_history (kpi_id)",
        ] {
            if let Err(e) = sqlx::query(ddl).execute(&self.pool).await {
                // MySQL pre-8.0.29 lacks IF NOT EXISTS on indexes; a
                // duplicate-index error here is harmless.
                debug!(error = %e, "index bootstrap statement skipped");
            }
        }

        info!("landing DB bootstrapped");
        Ok(())
    }

    /// Generate the staging name: `recon_stage_{execution}_{role}_{stamp}`.
    pub fn staging_table_name(execution_id: &str, role: StagingRole) -> String {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let short: String = execution_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(12)
            .collect();
        format!("recon_stage_{short}_{}_{stamp}", role.as_str())
    }

    fn render_column(&self, column: &StagingColumn) -> Result<String, LandingError> {
        validate_identifier(&column.name)?;
        let sql_type = match (&column.kind, self.scheme) {
            (StagingType::Text { max_len }, LandingScheme::Sqlite) => {
                let _ = max_len;
                "TEXT".to_string()
            }
            (StagingType::Text { max_len }, _) => {
                format!("VARCHAR({})", (*max_len).clamp(1, MAX_VARCHAR))
            }
            (StagingType::Integer, LandingScheme::Sqlite) => "INTEGER".to_string(),
            (StagingType::Integer, _) => "BIGINT".to_string(),
            (StagingType::Decimal, LandingScheme::Sqlite) => "REAL".to_string(),
            (StagingType::Decimal, _) => "DECIMAL(38,10)".to_string(),
            (StagingType::Date, LandingScheme::Sqlite) => "TEXT".to_string(),
            (StagingType::Date, _) => "DATE".to_string(),
            (StagingType::Timestamp, _) => self.scheme.timestamp_type().to_string(),
            (StagingType::Boolean, LandingScheme::Sqlite) => "INTEGER".to_string(),
            (StagingType::Boolean, LandingScheme::MySql) => "TINYINT(1)".to_string(),
            (StagingType::Boolean, LandingScheme::Postgres) => "BOOLEAN".to_string(),
        };
        Ok(format!("{} {sql_type}", column.name))
    }

    /// CREATE the staging table and record its metadata row, atomically.
    pub async fn create_staging(
        &self,
        execution_id: &str,
        ruleset_id: &str,
        role: StagingRole,
        columns: &[StagingColumn],
    ) -> Result<String, LandingError> {
        let table_name = Self::staging_table_name(execution_id, role);
        validate_identifier(&table_name)?;

        // Uniqueness is a contract; a collision is a bug, not a retry case.
        let count_sql = format!(
            "SELECT COUNT(*) AS n FROM staging_table_metadata WHERE table_name = {}",
            sql_quote(&table_name)
        );
        let row = sqlx::query(&count_sql).fetch_one(&self.pool).await?;
        if row.try_get::<i64, _>("n").unwrap_or(0) > 0 {
            return Err(LandingError::NameCollision(table_name));
        }

        let rendered: Result<Vec<String>, LandingError> =
            columns.iter().map(|c| self.render_column(c)).collect();
        let ddl = format!(
            "CREATE TABLE {table_name} ({})",
            rendered?.join(", ")
        );

        let now = Utc::now();
        let expires = now + self.ttl;
        let insert = format!(
            "INSERT INTO staging_table_metadata \
             (table_name, execution_id, ruleset_id, source_or_target, row_count, \
              created_at, expires_at, status) \
             VALUES ({}, {}, {}, {}, 0, {}, {}, 'active')",
            sql_quote(&table_name),
            sql_quote(execution_id),
            sql_quote(ruleset_id),
            sql_quote(role.as_str()),
            sql_quote(&now.to_rfc3339()),
            sql_quote(&expires.to_rfc3339()),
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&ddl).execute(&mut *tx).await?;
        sqlx::query(&insert).execute(&mut *tx).await?;
        tx.commit().await?;

        debug!(table = table_name, role = role.as_str(), "staging table created");
        Ok(table_name)
    }

    /// One single-column index per join column.
    pub async fn create_indexes(
        &self,
        table_name: &str,
        columns: &[String],
    ) -> Result<(), LandingError> {
        validate_identifier(table_name)?;
        for (i, column) in columns.iter().enumerate() {
            validate_identifier(column)?;
            let ddl = format!("CREATE INDEX idx_{table_name}_{i} ON {table_name} ({column})");
            sqlx::query(&ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn update_row_count(
        &self,
        table_name: &str,
        row_count: i64,
    ) -> Result<(), LandingError> {
        let sql = format!(
            "UPDATE staging_table_metadata SET row_count = {row_count} \
             WHERE table_name = {}",
            sql_quote(table_name)
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// DROP the table and mark its metadata row deleted (kept for audit).
    pub async fn drop_staging(&self, table_name: &str) -> Result<(), LandingError> {
        validate_identifier(table_name)?;
        let drop = format!("DROP TABLE IF EXISTS {table_name}");
        sqlx::query(&drop).execute(&self.pool).await?;
        let update = format!(
            "UPDATE staging_table_metadata SET status = 'deleted' WHERE table_name = {}",
            sql_quote(table_name)
        );
        sqlx::query(&update).execute(&self.pool).await?;
        Ok(())
    }

    /// Drop every active staging table past its TTL. Returns how many fell.
    pub async fn cleanup_expired(&self) -> Result<u64, LandingError> {
        let now = Utc::now().to_rfc3339();
        let select = format!(
            "SELECT table_name FROM staging_table_metadata \
             WHERE status = 'active' AND expires_at < {}",
            sql_quote(&now)
        );
        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
        let mut dropped = 0u64;
        for row in rows {
            let table: String = row.try_get("table_name").unwrap_or_default();
            if table.is_empty() {
                continue;
            }
            match self.drop_staging(&table).await {
                Ok(()) => dropped += 1,
                Err(e) => warn!(table, error = %e, "failed to drop expired staging table"),
            }
        }
        if dropped > 0 {
            info!(dropped, "expired staging tables cleaned up");
        }
        Ok(dropped)
    }

    /// Metadata rows, optionally filtered by status.
    pub async fn list_staging(
        &self,
        status: Option<&str>,
    ) -> Result<Vec<StagingTableMeta>, LandingError> {
        let sql = match status {
            Some(s) => format!(
                "SELECT * FROM staging_table_metadata WHERE status = {} ORDER BY created_at",
                sql_quote(s)
            ),
            None => "SELECT * FROM staging_table_metadata ORDER BY created_at".to_string(),
        };
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_meta).collect())
    }

    /// Run `f` inside a single transaction; rolls back on error.
    pub async fn with_tx<T, F>(&self, f: F) -> Result<T, LandingError>
    where
        F: for<'t> FnOnce(
            &'t mut sqlx::AnyConnection,
        )
            -> Pin<Box<dyn Future<Output = Result<T, LandingError>> + Send + 't>>,
    {
        let mut tx = self.pool.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

fn row_to_meta(row: &AnyRow) -> StagingTableMeta {
    let parse_ts = |key: &str| {
        row.try_get::<String, _>(key)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    };
    StagingTableMeta {
        table_name: row.try_get("table_name").unwrap_or_default(),
        execution_id: row.try_get("execution_id").unwrap_or_default(),
        ruleset_id: row.try_get("ruleset_id").unwrap_or_default(),
        source_or_target: row.try_get("source_or_target").unwrap_or_default(),
        row_count: row.try_get("row_count").unwrap_or(0),
        created_at: parse_ts("created_at"),
        expires_at: parse_ts("expires_at"),
        status: row.try_get("status").unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_detection() {
        assert_eq!(
            LandingScheme::from_url("mysql://h/db"),
            Some(LandingScheme::MySql)
        );
        assert_eq!(
            LandingScheme::from_url("postgres://h/db"),
            Some(LandingScheme::Postgres)
        );
        assert_eq!(
            LandingScheme::from_url("sqlite::memory:"),
            Some(LandingScheme::Sqlite)
        );
        assert_eq!(LandingScheme::from_url("oracle://h/db"), None);
    }

    #[test]
    fn staging_name_matches_pattern() {
        let name = LandingDb::staging_table_name("ab12-cd34-ef56", StagingRole::Source);
        assert!(name.starts_with("recon_stage_ab12cd34ef56_source_"));
        let stamp = name.rsplit("source_").next().unwrap();
        assert_eq!(stamp.len(), "20250101_120000".len());
        assert!(validate_identifier(&name).is_ok());
    }

    #[test]
    fn placeholders_per_scheme() {
        assert_eq!(LandingScheme::Postgres.placeholder(2), "$2");
        assert_eq!(LandingScheme::MySql.placeholder(2), "?");
    }
}
