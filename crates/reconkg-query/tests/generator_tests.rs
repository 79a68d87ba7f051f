//! End-to-end compile checks for the literal query scenarios.

use reconkg_model::graph::{GraphNode, KnowledgeGraph, Relationship, RelationshipType};
use reconkg_query::{NlCompiler, QueryError, SqlDialect};
use reconkg_graph::{FsGraphStore, GraphStore};
use std::collections::BTreeMap;

fn edge(source: &str, target: &str, source_col: &str, target_col: &str) -> Relationship {
    let mut properties = BTreeMap::new();
    properties.insert("source_column".to_string(), serde_json::json!(source_col));
    properties.insert("target_column".to_string(), serde_json::json!(target_col));
    Relationship {
        source_id: source.to_string(),
        target_id: target.to_string(),
        rel_type: RelationshipType::ForeignKey,
        confidence: 0.95,
        inferred: false,
        reasoning: String::new(),
        properties,
    }
}

/// KG_102: the GPU fixture with learned aliases and a material-master hop.
fn kg_102() -> KnowledgeGraph {
    let mut kg = KnowledgeGraph::new("KG_102");
    kg.nodes.push(GraphNode::table("bronze", "brz_lnd_RBP_GPU"));
    kg.nodes
        .push(GraphNode::table("bronze", "brz_lnd_OPS_EXCEL_GPU"));
    kg.nodes
        .push(GraphNode::table("bronze", "hana_material_master"));

    let ops = kg
        .nodes
        .iter_mut()
        .find(|n| n.id == "bronze:brz_lnd_OPS_EXCEL_GPU")
        .unwrap();
    ops.properties.insert(
        "columns".to_string(),
        serde_json::json!([
            {"name": "PLANNING_SKU", "type": "varchar"},
            {"name": "Active_Inactive", "type": "varchar"}
        ]),
    );
    let hana = kg
        .nodes
        .iter_mut()
        .find(|n| n.id == "bronze:hana_material_master")
        .unwrap();
    hana.properties.insert(
        "columns".to_string(),
        serde_json::json!([
            {"name": "MATERIAL", "type": "varchar"},
            {"name": "OPS_PLANNER", "type": "varchar"}
        ]),
    );

    kg.table_aliases.insert(
        "bronze:brz_lnd_RBP_GPU".to_string(),
        vec!["RBP".to_string(), "RBP GPU".to_string(), "GPU".to_string()],
    );
    kg.table_aliases.insert(
        "bronze:brz_lnd_OPS_EXCEL_GPU".to_string(),
        vec!["OPS".to_string(), "OPS Excel".to_string()],
    );

    kg.relationships.push(edge(
        "bronze:brz_lnd_RBP_GPU",
        "bronze:brz_lnd_OPS_EXCEL_GPU",
        "Material",
        "PLANNING_SKU",
    ));
    kg.relationships.push(edge(
        "bronze:brz_lnd_OPS_EXCEL_GPU",
        "bronze:hana_material_master",
        "PLANNING_SKU",
        "MATERIAL",
    ));
    kg
}

struct Fixture {
    store: FsGraphStore,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = FsGraphStore::new(dir.path()).unwrap();
    store.put(&kg_102()).unwrap();
    Fixture { store, _dir: dir }
}

#[tokio::test]
async fn not_in_comparison_with_learned_aliases_sqlserver() {
    let fx = fixture();
    let compiler = NlCompiler::new(&fx.store);
    let kg = fx.store.get("KG_102").unwrap();
    let (_intent, sql) = compiler
        .compile(
            &kg,
            "Show me all products in RBP which are not in OPS Excel",
            SqlDialect::SqlServer,
            1000,
            false,
        )
        .await
        .unwrap();
    assert_eq!(
        sql,
        "SELECT DISTINCT TOP 1000 s.* FROM [brz_lnd_RBP_GPU] s \
         LEFT JOIN [brz_lnd_OPS_EXCEL_GPU] t ON s.[Material] = t.[PLANNING_SKU] \
         WHERE t.[PLANNING_SKU] IS NULL"
    );
}

#[tokio::test]
async fn in_comparison_attaches_filter_to_target() {
    let fx = fixture();
    let compiler = NlCompiler::new(&fx.store);
    let kg = fx.store.get("KG_102").unwrap();
    let (_intent, sql) = compiler
        .compile(
            &kg,
            "Show me all products in RBP which are in active OPS Excel",
            SqlDialect::SqlServer,
            1000,
            false,
        )
        .await
        .unwrap();
    assert_eq!(
        sql,
        "SELECT DISTINCT TOP 1000 s.* FROM [brz_lnd_RBP_GPU] s \
         INNER JOIN [brz_lnd_OPS_EXCEL_GPU] t ON s.[Material] = t.[PLANNING_SKU] \
         WHERE t.[Active_Inactive] = 'Active'"
    );
    assert!(!sql.contains("IS NULL"));
}

#[tokio::test]
async fn additional_column_joins_material_master_with_real_columns() {
    let fx = fixture();
    let compiler = NlCompiler::new(&fx.store);
    let kg = fx.store.get("KG_102").unwrap();
    let (intent, sql) = compiler
        .compile(
            &kg,
            "Show products in RBP which are in OPS Excel with their OPS planner",
            SqlDialect::SqlServer,
            1000,
            false,
        )
        .await
        .unwrap();
    assert!(sql.contains(
        "LEFT JOIN [hana_material_master] h ON t.[PLANNING_SKU] = h.[MATERIAL]"
    ));
    assert!(sql.contains("h.[OPS_PLANNER] AS ops_planner"));
    // Placeholders like `id = id` never appear.
    assert!(!sql.contains("id] = [id"));
    assert!(intent
        .joined_column_names()
        .contains(&"PLANNING_SKU=MATERIAL".to_string()));
}

#[tokio::test]
async fn dialect_quoting_and_limits() {
    let fx = fixture();
    let compiler = NlCompiler::new(&fx.store);
    let kg = fx.store.get("KG_102").unwrap();
    let definition = "Show me all products in RBP which are not in OPS Excel";

    let (_, mysql) = compiler
        .compile(&kg, definition, SqlDialect::MySql, 50, false)
        .await
        .unwrap();
    assert!(mysql.contains("`brz_lnd_RBP_GPU`"));
    assert!(mysql.ends_with("LIMIT 50"));
    assert!(!mysql.contains("TOP"));

    let (_, postgres) = compiler
        .compile(&kg, definition, SqlDialect::Postgres, 50, false)
        .await
        .unwrap();
    assert!(postgres.contains("\"brz_lnd_RBP_GPU\""));
    assert!(postgres.ends_with("LIMIT 50"));

    let (_, oracle) = compiler
        .compile(&kg, definition, SqlDialect::Oracle, 50, false)
        .await
        .unwrap();
    assert!(oracle.contains("ROWNUM <= 50"));
    assert!(!oracle.contains("LIMIT"));
    assert!(oracle.contains("AND ROWNUM"));
}

#[tokio::test]
async fn comparison_without_path_fails_generation() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsGraphStore::new(dir.path()).unwrap();
    let mut kg = kg_102();
    kg.relationships.clear();
    store.put(&kg).unwrap();

    let compiler = NlCompiler::new(&store);
    let result = compiler
        .compile(
            &kg,
            "Show me all products in RBP which are not in OPS Excel",
            SqlDialect::SqlServer,
            1000,
            false,
        )
        .await;
    assert!(matches!(result, Err(QueryError::NoJoinPath { .. })));
}

#[tokio::test]
async fn aggregation_counts_over_resolved_table() {
    let fx = fixture();
    let compiler = NlCompiler::new(&fx.store);
    let kg = fx.store.get("KG_102").unwrap();
    let (_intent, sql) = compiler
        .compile(
            &kg,
            "How many products are in RBP",
            SqlDialect::MySql,
            1000,
            false,
        )
        .await
        .unwrap();
    assert!(sql.contains("COUNT(*)"));
    assert!(sql.contains("`brz_lnd_RBP_GPU`"));
}
