//! Rule generation against a graph built from schema fixtures.

use reconkg_graph::{FsGraphStore, GraphBuildRequest, GraphBuilder};
use reconkg_model::prefs::RelationshipPair;
use reconkg_model::rules::{MatchType, ValidationStatus};
use reconkg_rules::{FsRulesetStore, RuleGenerationRequest, RuleGenerator, RulesetStore};
use reconkg_schema::SchemaStore;

const SOURCE_SCHEMA: &str = r#"{
    "database": "rbp",
    "total_tables": 1,
    "tables": {
        "brz_lnd_RBP_GPU": {
            "table_name": "brz_lnd_RBP_GPU",
            "columns": [
                {"name": "Material", "type": "varchar(40)", "nullable": false},
                {"name": "plant_code", "type": "varchar(8)", "nullable": true},
                {"name": "product_name", "type": "varchar(128)", "nullable": true}
            ],
            "primary_keys": ["Material"],
            "foreign_keys": [],
            "indexes": []
        }
    }
}"#;

const TARGET_SCHEMA: &str = r#"{
    "database": "ops",
    "total_tables": 1,
    "tables": {
        "brz_lnd_OPS_EXCEL_GPU": {
            "table_name": "brz_lnd_OPS_EXCEL_GPU",
            "columns": [
                {"name": "PLANNING_SKU", "type": "varchar(40)", "nullable": false},
                {"name": "code", "type": "varchar(8)", "nullable": true},
                {"name": "planner_name", "type": "varchar(128)", "nullable": true},
                {"name": "Active_Inactive", "type": "varchar(8)", "nullable": true}
            ],
            "primary_keys": ["PLANNING_SKU"],
            "foreign_keys": [],
            "indexes": []
        }
    }
}"#;

struct Fixture {
    schemas: SchemaStore,
    graphs: FsGraphStore,
    rulesets: FsRulesetStore,
    _dirs: (tempfile::TempDir, tempfile::TempDir, tempfile::TempDir),
}

async fn fixture_with_kg() -> Fixture {
    let schema_dir = tempfile::tempdir().unwrap();
    std::fs::write(schema_dir.path().join("rbp.json"), SOURCE_SCHEMA).unwrap();
    std::fs::write(schema_dir.path().join("ops.json"), TARGET_SCHEMA).unwrap();
    let graph_dir = tempfile::tempdir().unwrap();
    let ruleset_dir = tempfile::tempdir().unwrap();

    let schemas = SchemaStore::new(schema_dir.path());
    let graphs = FsGraphStore::new(graph_dir.path()).unwrap();
    let rulesets = FsRulesetStore::new(ruleset_dir.path()).unwrap();

    let mut request = GraphBuildRequest::new(
        vec!["rbp".to_string(), "ops".to_string()],
        "KG_rules",
    );
    request.pairs = vec![RelationshipPair {
        source_table: "brz_lnd_RBP_GPU".to_string(),
        source_column: "Material".to_string(),
        target_table: "brz_lnd_OPS_EXCEL_GPU".to_string(),
        target_column: "PLANNING_SKU".to_string(),
        bidirectional: false,
    }];
    GraphBuilder::new(&schemas, &graphs)
        .build(&request)
        .await
        .unwrap();

    Fixture {
        schemas,
        graphs,
        rulesets,
        _dirs: (schema_dir, graph_dir, ruleset_dir),
    }
}

fn generation_request() -> RuleGenerationRequest {
    let mut request = RuleGenerationRequest::new("KG_rules", "gpu_ruleset");
    request.schemas = vec!["rbp".to_string(), "ops".to_string()];
    request.min_confidence = 0.7;
    request
}

#[tokio::test]
async fn explicit_pair_becomes_exact_rule() {
    let fx = fixture_with_kg().await;
    let generator = RuleGenerator::new(&fx.graphs, &fx.schemas, &fx.rulesets);
    let report = generator.generate(&generation_request()).await.unwrap();

    let exact = report
        .ruleset
        .rules
        .iter()
        .find(|r| r.match_type == MatchType::Exact)
        .expect("expected an EXACT rule");
    assert_eq!(exact.source_columns, vec!["Material".to_string()]);
    assert_eq!(exact.target_columns, vec!["PLANNING_SKU".to_string()]);
    assert_eq!(exact.validation_status, ValidationStatus::Valid);
    assert_eq!(exact.confidence, 1.0);
}

#[tokio::test]
async fn code_pattern_yields_transformation_rule() {
    let fx = fixture_with_kg().await;
    let generator = RuleGenerator::new(&fx.graphs, &fx.schemas, &fx.rulesets);
    let report = generator.generate(&generation_request()).await.unwrap();

    let transformation = report
        .ruleset
        .rules
        .iter()
        .find(|r| r.match_type == MatchType::Transformation)
        .expect("expected a TRANSFORMATION rule for plant_code <-> code");
    assert_eq!(
        transformation.transformation.as_deref(),
        Some("UPPER(TRIM(x))")
    );
}

#[tokio::test]
async fn fuzzy_name_rule_filtered_by_min_confidence() {
    let fx = fixture_with_kg().await;
    let generator = RuleGenerator::new(&fx.graphs, &fx.schemas, &fx.rulesets);

    // The fuzzy name-pair rule carries 0.70; a floor of 0.75 removes it.
    let mut request = generation_request();
    request.min_confidence = 0.75;
    let report = generator.generate(&request).await.unwrap();
    assert!(!report
        .ruleset
        .rules
        .iter()
        .any(|r| r.match_type == MatchType::Fuzzy));
}

#[tokio::test]
async fn match_type_filter_is_honored() {
    let fx = fixture_with_kg().await;
    let generator = RuleGenerator::new(&fx.graphs, &fx.schemas, &fx.rulesets);
    let mut request = generation_request();
    request.match_types = vec![MatchType::Exact];
    let report = generator.generate(&request).await.unwrap();
    assert!(report
        .ruleset
        .rules
        .iter()
        .all(|r| r.match_type == MatchType::Exact
            || r.validation_status == ValidationStatus::Invalid));
}

#[tokio::test]
async fn ruleset_round_trips_through_store() {
    let fx = fixture_with_kg().await;
    let generator = RuleGenerator::new(&fx.graphs, &fx.schemas, &fx.rulesets);
    let report = generator.generate(&generation_request()).await.unwrap();
    let loaded = fx.rulesets.load(&report.ruleset.ruleset_id).unwrap();
    assert_eq!(loaded, report.ruleset);
}

#[tokio::test]
async fn rules_are_canonically_ordered() {
    let fx = fixture_with_kg().await;
    let generator = RuleGenerator::new(&fx.graphs, &fx.schemas, &fx.rulesets);
    let report = generator.generate(&generation_request()).await.unwrap();
    let keys: Vec<_> = report
        .ruleset
        .rules
        .iter()
        .map(|r| {
            (
                r.source_schema.clone(),
                r.source_table.clone(),
                r.target_schema.clone(),
                r.target_table.clone(),
                r.rule_id.clone(),
            )
        })
        .collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
}
