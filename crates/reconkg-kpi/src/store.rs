//! KPI definition store
//!
//! Definitions persist on the landing DB. Deletion is soft (`is_active`),
//! names are unique among active KPIs, and the cache-flag transition is a
//! compare-and-set on `updated_at`.

use crate::KpiError;
use chrono::{DateTime, Utc};
use reconkg_landing::LandingDb;
use reconkg_model::kpi::KpiDefinition;
use sqlx::any::AnyRow;
use sqlx::Row;
use tracing::info;

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_opt(value: &Option<String>) -> String {
    match value {
        Some(v) => quote(v),
        None => "NULL".to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewKpi {
    pub name: String,
    pub alias_name: Option<String>,
    pub group_name: Option<String>,
    pub description: Option<String>,
    pub nl_definition: String,
    pub created_by: Option<String>,
}

pub struct KpiStore<'a> {
    landing: &'a LandingDb,
}

impl<'a> KpiStore<'a> {
    pub fn new(landing: &'a LandingDb) -> Self {
        Self { landing }
    }

    pub async fn bootstrap(&self) -> Result<(), KpiError> {
        let id = match self.landing.scheme() {
            reconkg_landing::LandingScheme::MySql => "BIGINT PRIMARY KEY AUTO_INCREMENT",
            reconkg_landing::LandingScheme::Postgres => "BIGSERIAL PRIMARY KEY",
            reconkg_landing::LandingScheme::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        };
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS kpi_definitions (
                id {id},
                name VARCHAR(128) NOT NULL,
                alias_name VARCHAR(128),
                group_name VARCHAR(128),
                description TEXT,
                nl_definition TEXT NOT NULL,
                created_at VARCHAR(40) NOT NULL,
                updated_at VARCHAR(40) NOT NULL,
                created_by VARCHAR(64),
                is_active SMALLINT NOT NULL DEFAULT 1,
                is_accept SMALLINT NOT NULL DEFAULT 0,
                is_sql_cached SMALLINT NOT NULL DEFAULT 0,
                cached_sql TEXT
            )"
        );
        sqlx::query(&ddl).execute(self.landing.pool()).await?;
        Ok(())
    }

    pub async fn create(&self, new: &NewKpi) -> Result<KpiDefinition, KpiError> {
        if self.find_active_by_name(&new.name).await?.is_some() {
            return Err(KpiError::DuplicateName(new.name.clone()));
        }
        let now = Utc::now().to_rfc3339();
        let insert = format!(
            "INSERT INTO kpi_definitions \
             (name, alias_name, group_name, description, nl_definition, \
              created_at, updated_at, created_by, is_active, is_accept, \
              is_sql_cached, cached_sql) \
             VALUES ({}, {}, {}, {}, {}, {}, {}, {}, 1, 0, 0, NULL)",
            quote(&new.name),
            quote_opt(&new.alias_name),
            quote_opt(&new.group_name),
            quote_opt(&new.description),
            quote(&new.nl_definition),
            quote(&now),
            quote(&now),
            quote_opt(&new.created_by),
        );
        sqlx::query(&insert).execute(self.landing.pool()).await?;
        let created = self
            .find_active_by_name(&new.name)
            .await?
            .ok_or_else(|| KpiError::NotFound(new.name.clone()))?;
        info!(kpi = created.id, name = %created.name, "KPI created");
        Ok(created)
    }

    pub async fn get(&self, kpi_id: i64) -> Result<KpiDefinition, KpiError> {
        let sql = format!("SELECT * FROM kpi_definitions WHERE id = {kpi_id}");
        let row = sqlx::query(&sql)
            .fetch_optional(self.landing.pool())
            .await?
            .ok_or_else(|| KpiError::NotFound(kpi_id.to_string()))?;
        Ok(row_to_kpi(&row))
    }

    pub async fn find_active_by_name(
        &self,
        name: &str,
    ) -> Result<Option<KpiDefinition>, KpiError> {
        let sql = format!(
            "SELECT * FROM kpi_definitions WHERE name = {} AND is_active = 1",
            quote(name)
        );
        let row = sqlx::query(&sql).fetch_optional(self.landing.pool()).await?;
        Ok(row.map(|r| row_to_kpi(&r)))
    }

    /// Active KPIs ordered by group then name.
    pub async fn list(&self) -> Result<Vec<KpiDefinition>, KpiError> {
        let rows = sqlx::query(
            "SELECT * FROM kpi_definitions WHERE is_active = 1 \
             ORDER BY group_name, name",
        )
        .fetch_all(self.landing.pool())
        .await?;
        Ok(rows.iter().map(row_to_kpi).collect())
    }

    /// Update the editable fields; bumps `updated_at`.
    pub async fn update(
        &self,
        kpi_id: i64,
        description: Option<String>,
        nl_definition: Option<String>,
        group_name: Option<String>,
    ) -> Result<KpiDefinition, KpiError> {
        let existing = self.get(kpi_id).await?;
        let now = Utc::now().to_rfc3339();
        let update = format!(
            "UPDATE kpi_definitions SET description = {}, nl_definition = {}, \
             group_name = {}, updated_at = {} WHERE id = {kpi_id}",
            quote_opt(&description.or(existing.description)),
            quote(&nl_definition.unwrap_or(existing.nl_definition)),
            quote_opt(&group_name.or(existing.group_name)),
            quote(&now),
        );
        sqlx::query(&update).execute(self.landing.pool()).await?;
        self.get(kpi_id).await
    }

    /// Soft delete.
    pub async fn delete(&self, kpi_id: i64) -> Result<(), KpiError> {
        self.get(kpi_id).await?;
        let now = Utc::now().to_rfc3339();
        let update = format!(
            "UPDATE kpi_definitions SET is_active = 0, updated_at = {} WHERE id = {kpi_id}",
            quote(&now)
        );
        sqlx::query(&update).execute(self.landing.pool()).await?;
        Ok(())
    }

    /// Cache-flag transition with compare-and-set on `updated_at`.
    ///
    /// Setting `is_sql_cached = true` requires a prior successful execution;
    /// the cached statement is taken from the most recent one.
    pub async fn set_cache_flags(
        &self,
        kpi_id: i64,
        is_accept: bool,
        is_sql_cached: bool,
    ) -> Result<KpiDefinition, KpiError> {
        let existing = self.get(kpi_id).await?;

        let cached_sql = if is_sql_cached {
            let latest = self.latest_successful_sql(kpi_id).await?;
            match latest {
                Some(sql) => Some(sql),
                None => return Err(KpiError::NoSuccessfulExecution(kpi_id)),
            }
        } else {
            existing.cached_sql.clone()
        };

        let now = Utc::now().to_rfc3339();
        let update = format!(
            "UPDATE kpi_definitions SET is_accept = {}, is_sql_cached = {}, \
             cached_sql = {}, updated_at = {} \
             WHERE id = {kpi_id} AND updated_at = {}",
            i32::from(is_accept),
            i32::from(is_sql_cached),
            quote_opt(&cached_sql),
            quote(&now),
            quote(&existing.updated_at.to_rfc3339()),
        );
        let result = sqlx::query(&update).execute(self.landing.pool()).await?;
        if result.rows_affected() != 1 {
            return Err(KpiError::Conflict(kpi_id));
        }
        self.get(kpi_id).await
    }

    /// Null the cached SQL and drop both flags.
    pub async fn clear_cache(&self, kpi_id: i64) -> Result<KpiDefinition, KpiError> {
        self.get(kpi_id).await?;
        let now = Utc::now().to_rfc3339();
        let update = format!(
            "UPDATE kpi_definitions SET is_accept = 0, is_sql_cached = 0, \
             cached_sql = NULL, updated_at = {} WHERE id = {kpi_id}",
            quote(&now)
        );
        sqlx::query(&update).execute(self.landing.pool()).await?;
        self.get(kpi_id).await
    }

    async fn latest_successful_sql(&self, kpi_id: i64) -> Result<Option<String>, KpiError> {
        let sql = format!(
            "SELECT generated_sql FROM execution_history \
             WHERE kpi_id = {kpi_id} AND execution_status = 'success' \
             ORDER BY execution_timestamp DESC, id DESC"
        );
        let row = sqlx::query(&sql).fetch_optional(self.landing.pool()).await?;
        Ok(row.and_then(|r| r.try_get::<String, _>("generated_sql").ok()))
    }
}

pub(crate) fn row_to_kpi(row: &AnyRow) -> KpiDefinition {
    let parse_ts = |key: &str| {
        row.try_get::<String, _>(key)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    };
    let flag = |key: &str| {
        row.try_get::<i64, _>(key)
            .map(|v| v != 0)
            .or_else(|_| row.try_get::<i32, _>(key).map(|v| v != 0))
            .or_else(|_| row.try_get::<bool, _>(key))
            .unwrap_or(false)
    };
    KpiDefinition {
        id: row.try_get("id").unwrap_or(0),
        name: row.try_get("name").unwrap_or_default(),
        alias_name: row.try_get("alias_name").ok(),
        group_name: row.try_get("group_name").ok(),
        description: row.try_get("description").ok(),
        nl_definition: row.try_get("nl_definition").unwrap_or_default(),
        created_at: parse_ts("created_at"),
        updated_at: parse_ts("updated_at"),
        created_by: row.try_get("created_by").ok(),
        is_active: flag("is_active"),
        is_accept: flag("is_accept"),
        is_sql_cached: flag("is_sql_cached"),
        cached_sql: row.try_get("cached_sql").ok(),
    }
}
