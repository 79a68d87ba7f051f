//! Integration tests for the complete reconkg pipeline
//!
//! These tests verify end-to-end functionality across crates:
//! - Schema files → Graph builder → Graph store round-trip
//! - Graph → Rule generator (pattern and LLM passes)
//! - Graph + aliases → NL compiler → dialect SQL
//!
//! Run with: cargo test --test integration_tests

use async_trait::async_trait;
use reconkg_graph::{FsGraphStore, GraphBuildRequest, GraphBuilder, GraphStore};
use reconkg_llm::{CompletionRequest, CompletionResponse, LlmAdapter, LlmClient, LlmError};
use reconkg_model::graph::RelationshipType;
use reconkg_model::prefs::RelationshipPair;
use reconkg_rules::{FsRulesetStore, RuleGenerationRequest, RuleGenerator, RulesetStore};
use reconkg_schema::SchemaStore;
use tempfile::tempdir;

// ============================================================================
// Fixtures
// ============================================================================

const CATALOG_SCHEMA: &str = r#"{
    "database": "orderMgmt",
    "total_tables": 3,
    "tables": {
        "product": {
            "table_name": "product",
            "columns": [
                {"name": "product_id", "type": "bigint", "nullable": false, "primary_key": true},
                {"name": "item_code", "type": "varchar(32)", "nullable": false},
                {"name": "product_name", "type": "varchar(128)", "nullable": true}
            ],
            "primary_keys": ["product_id"],
            "foreign_keys": [],
            "indexes": []
        },
        "orders": {
            "table_name": "orders",
            "columns": [
                {"name": "order_id", "type": "bigint", "nullable": false, "primary_key": true},
                {"name": "product_id", "type": "bigint", "nullable": false},
                {"name": "status", "type": "varchar(16)", "nullable": true}
            ],
            "primary_keys": ["order_id"],
            "foreign_keys": [
                {"source_column": "product_id", "target_table": "product",
                 "target_column": "product_id", "constraint_name": "fk_orders_product"}
            ],
            "indexes": []
        },
        "supplier": {
            "table_name": "supplier",
            "columns": [
                {"name": "supplier_id", "type": "bigint", "nullable": false, "primary_key": true},
                {"name": "supplier_name", "type": "varchar(128)", "nullable": false}
            ],
            "primary_keys": ["supplier_id"],
            "foreign_keys": [],
            "indexes": []
        }
    }
}"#;

const DESIGN_SCHEMA: &str = r#"{
    "database": "qinspect",
    "total_tables": 2,
    "tables": {
        "design": {
            "table_name": "design",
            "columns": [
                {"name": "design_id", "type": "bigint", "nullable": false, "primary_key": true},
                {"name": "product_id", "type": "bigint", "nullable": false},
                {"name": "design_code", "type": "varchar(16)", "nullable": false}
            ],
            "primary_keys": ["design_id"],
            "foreign_keys": [],
            "indexes": []
        },
        "inspection": {
            "table_name": "inspection",
            "columns": [
                {"name": "inspection_id", "type": "bigint", "nullable": false, "primary_key": true},
                {"name": "design_id", "type": "bigint", "nullable": false},
                {"name": "inspector_name", "type": "varchar(64)", "nullable": true}
            ],
            "primary_keys": ["inspection_id"],
            "foreign_keys": [
                {"source_column": "design_id", "target_table": "design",
                 "target_column": "design_id", "constraint_name": "fk_inspection_design"}
            ],
            "indexes": []
        }
    }
}"#;

fn write_schemas(dir: &std::path::Path) {
    std::fs::write(dir.join("orderMgmt-catalog.json"), CATALOG_SCHEMA).unwrap();
    std::fs::write(dir.join("qinspect-designcode.json"), DESIGN_SCHEMA).unwrap();
}

fn build_request() -> GraphBuildRequest {
    GraphBuildRequest::new(
        vec![
            "orderMgmt-catalog".to_string(),
            "qinspect-designcode".to_string(),
        ],
        "KG_integration",
    )
}

/// Scripted LLM client: canned JSON per prompt topic, so LLM-dependent
/// paths run deterministically.
struct CannedLlm;

#[async_trait]
impl LlmClient for CannedLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let content = if request.prompt.contains("reconciliation rules") {
            r#"{"rules": [{"source_table": "product", "source_columns": ["item_code"],
                "target_table": "design", "target_columns": ["design_code"],
                "match_type": "TRANSFORMATION", "transformation": "UPPER(TRIM(x))",
                "confidence": 0.82, "reasoning": "both are product identifiers"}]}"#
        } else if request.prompt.contains("business-friendly") {
            r#"{"aliases": ["Catalog Items"]}"#
        } else {
            r#"{"relationships": []}"#
        };
        Ok(CompletionResponse {
            content: content.to_string(),
            model: "canned".to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
        })
    }

    fn model_name(&self) -> &str {
        "canned"
    }
}

// ============================================================================
// Build → persist → load
// ============================================================================

#[tokio::test]
async fn multi_schema_build_meets_scenario_counts() {
    let schema_dir = tempdir().unwrap();
    write_schemas(schema_dir.path());
    let graph_dir = tempdir().unwrap();

    let schemas = SchemaStore::new(schema_dir.path());
    let graphs = FsGraphStore::new(graph_dir.path()).unwrap();
    let builder = GraphBuilder::new(&schemas, &graphs);

    let report = builder.build(&build_request()).await.unwrap();

    // Five tables plus their identifier columns, each anchored to its table,
    // plus the declared FKs and the cross-schema product reference.
    assert!(report.nodes_count >= 15);
    assert!(report.relationships_count >= 13);
    assert!(report
        .kg
        .relationships
        .iter()
        .any(|r| r.rel_type == RelationshipType::CrossSchemaReference));

    // Persist → load: identical graph, aliases included.
    let loaded = graphs.get("KG_integration").unwrap();
    assert_eq!(loaded, report.kg);
    assert_eq!(loaded.table_aliases, report.kg.table_aliases);
}

#[tokio::test]
async fn rebuild_with_same_inputs_is_byte_identical() {
    let schema_dir = tempdir().unwrap();
    write_schemas(schema_dir.path());
    let graph_dir = tempdir().unwrap();

    let schemas = SchemaStore::new(schema_dir.path());
    let graphs = FsGraphStore::new(graph_dir.path()).unwrap();
    let builder = GraphBuilder::new(&schemas, &graphs);

    builder.build(&build_request()).await.unwrap();
    let first = std::fs::read(graph_dir.path().join("KG_integration.kg.json")).unwrap();
    builder.build(&build_request()).await.unwrap();
    let second = std::fs::read(graph_dir.path().join("KG_integration.kg.json")).unwrap();
    assert_eq!(first, second);
}

// ============================================================================
// Build → rules (with and without LLM)
// ============================================================================

#[tokio::test]
async fn ruleset_generation_with_llm_produces_llm_rules() {
    let schema_dir = tempdir().unwrap();
    write_schemas(schema_dir.path());
    let graph_dir = tempdir().unwrap();
    let ruleset_dir = tempdir().unwrap();

    let schemas = SchemaStore::new(schema_dir.path());
    let graphs = FsGraphStore::new(graph_dir.path()).unwrap();
    let rulesets = FsRulesetStore::new(ruleset_dir.path()).unwrap();
    let llm = LlmAdapter::new(Box::new(CannedLlm));

    let builder = GraphBuilder::new(&schemas, &graphs).with_llm(&llm);
    let mut request = build_request();
    request.pairs = vec![RelationshipPair {
        source_table: "product".to_string(),
        source_column: "product_id".to_string(),
        target_table: "design".to_string(),
        target_column: "product_id".to_string(),
        bidirectional: false,
    }];
    builder.build(&request).await.unwrap();

    let generator = RuleGenerator::new(&graphs, &schemas, &rulesets).with_llm(&llm);
    let mut generation = RuleGenerationRequest::new("KG_integration", "integration_rules");
    generation.schemas = vec![
        "orderMgmt-catalog".to_string(),
        "qinspect-designcode".to_string(),
    ];
    generation.min_confidence = 0.7;
    generation.use_llm = true;

    let report = generator.generate(&generation).await.unwrap();

    assert!(report
        .ruleset
        .rules
        .iter()
        .any(|r| r.match_type == reconkg_model::rules::MatchType::Exact));
    assert!(report.ruleset.rules.iter().any(|r| r.llm_generated));
    assert!(!report.llm_degraded);

    // Ruleset round-trips through its store.
    let loaded = rulesets.load(&report.ruleset.ruleset_id).unwrap();
    assert_eq!(loaded, report.ruleset);
}

// ============================================================================
// Build with LLM aliases → NL compile
// ============================================================================

#[tokio::test]
async fn llm_aliases_feed_nl_compilation() {
    use reconkg_query::{NlCompiler, SqlDialect};

    let schema_dir = tempdir().unwrap();
    write_schemas(schema_dir.path());
    let graph_dir = tempdir().unwrap();

    let schemas = SchemaStore::new(schema_dir.path());
    let graphs = FsGraphStore::new(graph_dir.path()).unwrap();
    let llm = LlmAdapter::new(Box::new(CannedLlm));
    let builder = GraphBuilder::new(&schemas, &graphs).with_llm(&llm);

    let mut request = build_request();
    request.use_llm = true;
    let report = builder.build(&request).await.unwrap();
    assert!(!report.kg.table_aliases.is_empty());

    // Compile a simple data query against the freshly built graph.
    let compiler = NlCompiler::new(&graphs);
    let kg = graphs.get("KG_integration").unwrap();
    let (intent, sql) = compiler
        .compile(&kg, "List design rows", SqlDialect::MySql, 100, false)
        .await
        .unwrap();
    assert!(intent.source_table.is_some());
    assert!(sql.starts_with("SELECT DISTINCT"));
    assert!(sql.ends_with("LIMIT 100"));
}
