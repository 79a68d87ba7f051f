//! Landing database: staging lifecycle, extraction, and reconciliation
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                LANDING RECONCILIATION FLOW                    │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  source DB ──extract──► recon_stage_<id>_source_<ts> ──┐      │
//! │                                                        ├─► one │
//! │  target DB ──extract──► recon_stage_<id>_target_<ts> ──┘  SQL │
//! │                                                        (CTEs)  │
//! │                    staging_table_metadata ◄── TTL cleanup      │
//! │                    execution_history      ◄── results          │
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! One process-wide pool; staging DDL is rendered for the landing URL's own
//! scheme, never by callers.

pub mod config;
pub mod executor;
pub mod extract;
pub mod manager;

pub use config::DbConfig;
pub use executor::{ExecutionOutcome, ExecutionRequest, ReconciliationExecutor};
pub use extract::{extract_to_landing, ExtractStats};
pub use manager::{LandingDb, LandingScheme, StagingColumn, StagingRole, StagingType};

#[derive(Debug, thiserror::Error)]
pub enum LandingError {
    #[error("database connect failure: {0}")]
    Connect(String),
    #[error("database query failure: {0}")]
    Query(String),
    #[error("staging table `{0}` not found")]
    StagingNotFound(String),
    #[error("staging table name collision: `{0}`")]
    NameCollision(String),
    #[error("ruleset `{0}` has no executable rules")]
    NoExecutableRules(String),
    #[error("ruleset load failure: {0}")]
    Ruleset(String),
    #[error("execution timed out after {0}s")]
    Timeout(u64),
    #[error("execution cancelled")]
    Cancelled,
}

impl From<sqlx::Error> for LandingError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                LandingError::Connect(e.to_string())
            }
            _ => LandingError::Query(e.to_string()),
        }
    }
}

/// Quote a string literal for direct inclusion in rendered SQL.
pub(crate) fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Identifiers that reach rendered DDL/DML must stay simple: alphanumerics
/// and underscores only. Staging names and schema-derived column names all
/// satisfy this; anything else is rejected before it touches SQL.
pub(crate) fn validate_identifier(name: &str) -> Result<(), LandingError> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(LandingError::Query(format!(
            "identifier `{name}` contains unsupported characters"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_quote_escapes_single_quotes() {
        assert_eq!(sql_quote("O'Brien"), "'O''Brien'");
        assert_eq!(sql_quote("plain"), "'plain'");
    }

    #[test]
    fn identifier_validation() {
        assert!(validate_identifier("recon_stage_ab12_source_20250101_120000").is_ok());
        assert!(validate_identifier("Material").is_ok());
        assert!(validate_identifier("bad name").is_err());
        assert!(validate_identifier("drop;table").is_err());
        assert!(validate_identifier("").is_err());
    }
}
