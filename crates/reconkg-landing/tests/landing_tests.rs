//! Landing DB lifecycle and end-to-end reconciliation over sqlite.

use reconkg_landing::{
    DbConfig, ExecutionRequest, LandingDb, ReconciliationExecutor, StagingColumn, StagingRole,
};
use reconkg_model::kpi::AssessmentStatus;
use reconkg_model::rules::{
    JoinCondition, JoinType, MatchType, ReconciliationRule, RuleSet, ValidationStatus,
};
use reconkg_rules::{FsRulesetStore, RulesetStore};
use sqlx::any::AnyPoolOptions;
use sqlx::Row;

fn sqlite_url(dir: &tempfile::TempDir, name: &str) -> String {
    format!(
        "sqlite://{}?mode=rwc",
        dir.path().join(name).display()
    )
}

async fn landing(dir: &tempfile::TempDir) -> LandingDb {
    let db = LandingDb::connect(&sqlite_url(dir, "landing.db")).await.unwrap();
    db.bootstrap().await.unwrap();
    db
}

#[tokio::test]
async fn bootstrap_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = landing(&dir).await;
    db.bootstrap().await.unwrap();
    assert!(db.list_staging(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn staging_lifecycle_create_drop_audit() {
    let dir = tempfile::tempdir().unwrap();
    let db = landing(&dir).await;

    let columns = vec![
        StagingColumn::text("Material", 40),
        StagingColumn::text("plant_code", 8),
    ];
    let table = db
        .create_staging("exec-1", "rs-1", StagingRole::Source, &columns)
        .await
        .unwrap();
    assert!(table.starts_with("recon_stage_exec1_source_"));

    db.create_indexes(&table, &["Material".to_string()]).await.unwrap();

    let active = db.list_staging(Some("active")).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].table_name, table);
    assert_eq!(active[0].source_or_target, "source");

    // Drop marks the metadata row deleted but keeps it for audit.
    db.drop_staging(&table).await.unwrap();
    assert!(db.list_staging(Some("active")).await.unwrap().is_empty());
    let deleted = db.list_staging(Some("deleted")).await.unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].table_name, table);
}

#[tokio::test]
async fn reconciliation_end_to_end_over_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db = landing(&dir).await;

    // Source: 10 rows, 2 inactive. Target: 9 rows, 8 matching keys.
    let source_url = sqlite_url(&dir, "source.db");
    let target_url = sqlite_url(&dir, "target.db");
    sqlx::any::install_default_drivers();
    let source_pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect(&source_url)
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE gpu_products (Material TEXT, Active_Inactive TEXT)",
    )
    .execute(&source_pool)
    .await
    .unwrap();
    for i in 0..10 {
        let status = if i < 2 { "Inactive" } else { "Active" };
        sqlx::query(&format!(
            "INSERT INTO gpu_products VALUES ('SKU{i:03}', '{status}')"
        ))
        .execute(&source_pool)
        .await
        .unwrap();
    }

    let target_pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect(&target_url)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE ops_excel (PLANNING_SKU TEXT)")
        .execute(&target_pool)
        .await
        .unwrap();
    for i in 0..8 {
        sqlx::query(&format!("INSERT INTO ops_excel VALUES ('SKU{i:03}')"))
            .execute(&target_pool)
            .await
            .unwrap();
    }
    sqlx::query("INSERT INTO ops_excel VALUES ('GHOST')")
        .execute(&target_pool)
        .await
        .unwrap();

    // Ruleset: one EXACT rule joining the two staged tables.
    let ruleset_dir = tempfile::tempdir().unwrap();
    let rulesets = FsRulesetStore::new(ruleset_dir.path()).unwrap();
    let ruleset = RuleSet {
        ruleset_id: "rs-e2e".to_string(),
        ruleset_name: "gpu".to_string(),
        schemas: vec!["rbp".to_string(), "ops".to_string()],
        rules: vec![ReconciliationRule {
            rule_id: "r1".to_string(),
            rule_name: "material = planning_sku".to_string(),
            source_schema: "rbp".to_string(),
            source_table: "gpu_products".to_string(),
            source_columns: vec!["Material".to_string()],
            target_schema: "ops".to_string(),
            target_table: "ops_excel".to_string(),
            target_columns: vec!["PLANNING_SKU".to_string()],
            match_type: MatchType::Exact,
            transformation: None,
            confidence: 0.95,
            reasoning: String::new(),
            validation_status: ValidationStatus::Valid,
            llm_generated: false,
            created_at: chrono::Utc::now(),
            join_tables: None,
            join_conditions: None,
            join_order: None,
            join_types: None,
        }],
        generated_from_kg: "kg".to_string(),
        created_at: chrono::Utc::now(),
    };
    rulesets.save(&ruleset).unwrap();

    let executor = ReconciliationExecutor::new(&db, &rulesets);
    let outcome = executor
        .execute(&ExecutionRequest {
            ruleset_id: "rs-e2e".to_string(),
            source_db: DbConfig::from_url(source_url),
            target_db: DbConfig::from_url(target_url),
            limit: None,
            keep_staging: false,
            store_results: true,
            inactive_column: Some("Active_Inactive".to_string()),
            inactive_value: Some("Inactive".to_string()),
            deadline: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.matched_count, 8);
    assert_eq!(outcome.total_source_count, 10);
    assert_eq!(outcome.total_target_count, 9);
    assert_eq!(outcome.unmatched_source_count, 2);
    assert_eq!(outcome.unmatched_target_count, 1);
    assert_eq!(outcome.kpis.rcr, 80.0);
    assert_eq!(outcome.rcr_status, AssessmentStatus::Warning);
    assert_eq!(outcome.kpis.dqcs, 0.95);
    assert_eq!(outcome.dqcs_status, AssessmentStatus::Good);
    // 2 of 10 inactive.
    assert_eq!(outcome.kpis.irr, 20.0);
    assert_eq!(outcome.irr_status, AssessmentStatus::Warning);
    assert_eq!(outcome.rule_utilization, 1.0);
    assert!(outcome.generated_sql.contains("NOT EXISTS"));

    // keep_staging=false dropped both tables; audit rows remain.
    assert!(db.list_staging(Some("active")).await.unwrap().is_empty());
    assert_eq!(db.list_staging(Some("deleted")).await.unwrap().len(), 2);

    // Aggregate row persisted with the generated SQL.
    let row = sqlx::query("SELECT generated_sql, execution_status FROM execution_history")
        .fetch_one(db.pool())
        .await
        .unwrap();
    let sql: String = row.get("generated_sql");
    let status: String = row.get("execution_status");
    assert_eq!(status, "success");
    assert!(sql.contains("WITH matched AS"));
}

#[tokio::test]
async fn composite_chain_reconciliation_over_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db = landing(&dir).await;

    // Source: products(k1). Target DB: bridge(k1, k2) and master(k2).
    // Only A reaches master through the chain; B dead-ends at y, C never
    // enters the bridge.
    let source_url = sqlite_url(&dir, "chain_source.db");
    let target_url = sqlite_url(&dir, "chain_target.db");
    sqlx::any::install_default_drivers();
    let source_pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect(&source_url)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE products (k1 TEXT)")
        .execute(&source_pool)
        .await
        .unwrap();
    for key in ["A", "B", "C"] {
        sqlx::query(&format!("INSERT INTO products VALUES ('{key}')"))
            .execute(&source_pool)
            .await
            .unwrap();
    }

    let target_pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect(&target_url)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE bridge (k1 TEXT, k2 TEXT)")
        .execute(&target_pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO bridge VALUES ('A', 'x'), ('B', 'y')")
        .execute(&target_pool)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE master (k2 TEXT)")
        .execute(&target_pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO master VALUES ('x')")
        .execute(&target_pool)
        .await
        .unwrap();

    let ruleset_dir = tempfile::tempdir().unwrap();
    let rulesets = FsRulesetStore::new(ruleset_dir.path()).unwrap();
    let ruleset = RuleSet {
        ruleset_id: "rs-chain".to_string(),
        ruleset_name: "chain".to_string(),
        schemas: vec!["src".to_string(), "tgt".to_string()],
        rules: vec![ReconciliationRule {
            rule_id: "composite_01".to_string(),
            rule_name: "composite join over products -> bridge -> master".to_string(),
            source_schema: "src".to_string(),
            source_table: "products".to_string(),
            source_columns: vec!["k1".to_string()],
            target_schema: "tgt".to_string(),
            target_table: "master".to_string(),
            target_columns: vec!["k2".to_string()],
            match_type: MatchType::Composite,
            transformation: None,
            confidence: 0.85,
            reasoning: String::new(),
            validation_status: ValidationStatus::Likely,
            llm_generated: false,
            created_at: chrono::Utc::now(),
            join_tables: Some(vec![
                "products".to_string(),
                "bridge".to_string(),
                "master".to_string(),
            ]),
            join_conditions: Some(vec![
                JoinCondition {
                    left: "products.k1".to_string(),
                    right: "bridge.k1".to_string(),
                },
                JoinCondition {
                    left: "bridge.k2".to_string(),
                    right: "master.k2".to_string(),
                },
            ]),
            join_order: Some(vec![
                "products".to_string(),
                "bridge".to_string(),
                "master".to_string(),
            ]),
            join_types: Some(vec![JoinType::Inner, JoinType::Inner]),
        }],
        generated_from_kg: "kg".to_string(),
        created_at: chrono::Utc::now(),
    };
    rulesets.save(&ruleset).unwrap();

    let executor = ReconciliationExecutor::new(&db, &rulesets);
    let outcome = executor
        .execute(&ExecutionRequest {
            ruleset_id: "rs-chain".to_string(),
            source_db: DbConfig::from_url(source_url),
            target_db: DbConfig::from_url(target_url),
            limit: None,
            keep_staging: false,
            store_results: false,
            inactive_column: None,
            inactive_value: None,
            deadline: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.matched_count, 1);
    assert_eq!(outcome.unmatched_source_count, 2);
    assert_eq!(outcome.unmatched_target_count, 0);
    assert_eq!(outcome.total_source_count, 3);
    assert_eq!(outcome.total_target_count, 1);
    assert_eq!(outcome.kpis.dqcs, 0.85);
    assert_eq!(outcome.rule_utilization, 1.0);
    assert_eq!(outcome.chain_staging.len(), 1);
    assert!(outcome.generated_sql.contains("EXISTS"));
    assert!(outcome.generated_sql.contains("chain_0_matches"));

    // Source, target, and the bridge intermediate were all staged and
    // dropped together.
    assert!(db.list_staging(Some("active")).await.unwrap().is_empty());
    assert_eq!(db.list_staging(Some("deleted")).await.unwrap().len(), 3);
}

#[tokio::test]
async fn keep_staging_preserves_tables_for_post_mortem() {
    let dir = tempfile::tempdir().unwrap();
    let db = landing(&dir).await;

    let source_url = sqlite_url(&dir, "src2.db");
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect(&source_url)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE t (k TEXT)").execute(&pool).await.unwrap();
    sqlx::query("INSERT INTO t VALUES ('a')").execute(&pool).await.unwrap();

    let ruleset_dir = tempfile::tempdir().unwrap();
    let rulesets = FsRulesetStore::new(ruleset_dir.path()).unwrap();
    let ruleset = RuleSet {
        ruleset_id: "rs-keep".to_string(),
        ruleset_name: "keep".to_string(),
        schemas: vec![],
        rules: vec![ReconciliationRule {
            rule_id: "r1".to_string(),
            rule_name: "k = k".to_string(),
            source_schema: "s".to_string(),
            source_table: "t".to_string(),
            source_columns: vec!["k".to_string()],
            target_schema: "s".to_string(),
            target_table: "t".to_string(),
            target_columns: vec!["k".to_string()],
            match_type: MatchType::Exact,
            transformation: None,
            confidence: 0.9,
            reasoning: String::new(),
            validation_status: ValidationStatus::Valid,
            llm_generated: false,
            created_at: chrono::Utc::now(),
            join_tables: None,
            join_conditions: None,
            join_order: None,
            join_types: None,
        }],
        generated_from_kg: "kg".to_string(),
        created_at: chrono::Utc::now(),
    };
    rulesets.save(&ruleset).unwrap();

    let executor = ReconciliationExecutor::new(&db, &rulesets);
    let outcome = executor
        .execute(&ExecutionRequest {
            ruleset_id: "rs-keep".to_string(),
            source_db: DbConfig::from_url(source_url.clone()),
            target_db: DbConfig::from_url(source_url),
            limit: None,
            keep_staging: true,
            store_results: false,
            inactive_column: None,
            inactive_value: None,
            deadline: None,
        })
        .await
        .unwrap();

    assert_eq!(outcome.matched_count, 1);
    let active = db.list_staging(Some("active")).await.unwrap();
    assert_eq!(active.len(), 2);
    assert!(active
        .iter()
        .any(|m| Some(m.table_name.as_str()) == outcome.source_staging.as_deref()));
}
