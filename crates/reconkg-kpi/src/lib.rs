//! KPI engine
//!
//! CRUD over KPI definitions, cache-flag transitions, background execution
//! through the NL compiler, append-only execution history, drill-down
//! pagination, and reconciliation evidence.
//!
//! KPI rows live in the landing database (`kpi_definitions` plus the shared
//! `execution_history` table); flag updates use compare-and-set SQL so
//! concurrent editors never lose writes.

pub mod engine;
pub mod store;

pub use engine::{DashboardEntry, ExecuteOptions, KpiEngine};
pub use store::{KpiStore, NewKpi};

#[derive(Debug, thiserror::Error)]
pub enum KpiError {
    #[error("KPI `{0}` not found")]
    NotFound(String),
    #[error("execution `{0}` not found")]
    ExecutionNotFound(String),
    #[error("KPI `{0}` has no successful execution; cannot cache SQL")]
    NoSuccessfulExecution(i64),
    #[error("concurrent update detected for KPI {0}")]
    Conflict(i64),
    #[error("KPI name `{0}` already exists")]
    DuplicateName(String),
    #[error("landing store failure: {0}")]
    Landing(#[from] reconkg_landing::LandingError),
    #[error("compile failure: {0}")]
    Compile(#[from] reconkg_query::QueryError),
    #[error("graph failure: {0}")]
    Graph(#[from] reconkg_graph::StoreError),
    #[error("query failure: {0}")]
    Query(String),
}

impl From<sqlx::Error> for KpiError {
    fn from(e: sqlx::Error) -> Self {
        KpiError::Query(e.to_string())
    }
}
