//! NL query compiler
//!
//! Turns a free-text definition into executable dialect SQL using the
//! knowledge graph:
//!
//! ```text
//! definition ──► classifier ──► parser ──► generator ──► executor
//!                  (regex,       (aliases,   (dialect      (sqlx)
//!                   LLM tie-      KG join     templates)
//!                   break)       inference)
//! ```
//!
//! Batch requests compile and execute each definition independently; one
//! failure never fails the batch.

pub mod classify;
pub mod execute;
pub mod generate;
pub mod intent;

use reconkg_graph::GraphStore;
use reconkg_landing::DbConfig;
use reconkg_llm::LlmAdapter;
use reconkg_model::graph::KnowledgeGraph;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

pub use classify::{Classification, Operation, QueryType};
pub use generate::SqlDialect;
pub use intent::{Filter, QueryIntent};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("knowledge graph failure: {0}")]
    Graph(#[from] reconkg_graph::StoreError),
    #[error("could not resolve a table from `{0}`")]
    UnresolvedEntity(String),
    #[error("no join path between `{source}` and `{target}` within {max_hops} hops")]
    NoJoinPath {
        source: String,
        target: String,
        max_hops: usize,
    },
    #[error("join path step between `{0}` and `{1}` carries no join columns")]
    MissingJoinColumns(String, String),
    #[error("unsupported db_type `{0}`")]
    UnknownDialect(String),
    #[error("execution failure: {0}")]
    Execution(String),
}

/// One round-trip request: several definitions against one KG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlQueryRequest {
    pub kg_name: String,
    #[serde(default)]
    pub schemas: Vec<String>,
    pub definitions: Vec<String>,
    #[serde(default)]
    pub use_llm: bool,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    pub db_type: String,
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_limit() -> i64 {
    1000
}

/// Per-definition result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub definition: String,
    pub sql: Option<String>,
    pub record_count: i64,
    pub joined_columns: Vec<String>,
    pub confidence: f64,
    pub execution_time_ms: u64,
    pub sample_rows: Vec<serde_json::Value>,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Batch aggregate statistics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatchStats {
    pub total_records: i64,
    pub total_execution_time_ms: u64,
    /// Average confidence over successful queries only.
    pub average_confidence: f64,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlQueryResponse {
    pub results: Vec<QueryResult>,
    pub stats: BatchStats,
}

pub struct NlCompiler<'a> {
    graphs: &'a dyn GraphStore,
    llm: Option<&'a LlmAdapter>,
    llm_deadline: Duration,
}

impl<'a> NlCompiler<'a> {
    pub fn new(graphs: &'a dyn GraphStore) -> Self {
        Self {
            graphs,
            llm: None,
            llm_deadline: Duration::from_secs(60),
        }
    }

    pub fn with_llm(mut self, llm: &'a LlmAdapter) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Classify and parse one definition into an intent, then generate SQL.
    pub async fn compile(
        &self,
        kg: &KnowledgeGraph,
        definition: &str,
        dialect: SqlDialect,
        limit: i64,
        use_llm: bool,
    ) -> Result<(QueryIntent, String), QueryError> {
        let llm = if use_llm { self.llm } else { None };
        let classification =
            classify::classify(definition, llm, self.llm_deadline).await;
        let intent = intent::parse_intent(
            kg,
            definition,
            &classification,
            llm,
            self.llm_deadline,
        )
        .await?;
        let sql = generate::generate_sql(kg, &intent, dialect, limit)?;
        Ok((intent, sql))
    }

    /// Full batch: compile and execute every definition independently.
    pub async fn run_batch(
        &self,
        request: &NlQueryRequest,
        source_db: &DbConfig,
    ) -> Result<NlQueryResponse, QueryError> {
        let dialect = SqlDialect::parse(&request.db_type)
            .ok_or_else(|| QueryError::UnknownDialect(request.db_type.clone()))?;
        let kg = self.graphs.get(&request.kg_name)?;

        let mut results = Vec::with_capacity(request.definitions.len());
        for definition in &request.definitions {
            let result = self
                .run_one(&kg, definition, dialect, request, source_db)
                .await;
            results.push(result);
        }

        let mut stats = BatchStats::default();
        let mut confidence_sum = 0.0;
        for result in &results {
            stats.total_records += result.record_count;
            stats.total_execution_time_ms += result.execution_time_ms;
            if result.status == "success" {
                stats.succeeded += 1;
                confidence_sum += result.confidence;
            } else {
                stats.failed += 1;
            }
        }
        if stats.succeeded > 0 {
            stats.average_confidence = confidence_sum / stats.succeeded as f64;
        }

        Ok(NlQueryResponse { results, stats })
    }

    async fn run_one(
        &self,
        kg: &KnowledgeGraph,
        definition: &str,
        dialect: SqlDialect,
        request: &NlQueryRequest,
        source_db: &DbConfig,
    ) -> QueryResult {
        let compiled = self
            .compile(kg, definition, dialect, request.limit, request.use_llm)
            .await;
        let (intent, sql) = match compiled {
            Ok(pair) => pair,
            Err(e) => {
                warn!(definition, error = %e, "definition failed to compile");
                return QueryResult {
                    definition: definition.to_string(),
                    sql: None,
                    record_count: 0,
                    joined_columns: vec![],
                    confidence: 0.0,
                    execution_time_ms: 0,
                    sample_rows: vec![],
                    status: "failed".to_string(),
                    error: Some(e.to_string()),
                };
            }
        };

        match execute::execute_query(source_db, &sql, request.limit).await {
            Ok(executed) => QueryResult {
                definition: definition.to_string(),
                sql: Some(sql),
                record_count: executed.record_count,
                joined_columns: intent.joined_column_names(),
                confidence: intent.confidence,
                execution_time_ms: executed.elapsed_ms,
                sample_rows: executed.sample_rows,
                status: "success".to_string(),
                error: None,
            },
            Err(e) => QueryResult {
                definition: definition.to_string(),
                sql: Some(sql),
                record_count: 0,
                joined_columns: intent.joined_column_names(),
                confidence: intent.confidence,
                execution_time_ms: 0,
                sample_rows: vec![],
                status: "failed".to_string(),
                error: Some(e.to_string()),
            },
        }
    }
}
