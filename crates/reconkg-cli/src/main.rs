//! reconkg command-line driver
//!
//! A thin operational surface over the library crates: build knowledge
//! graphs, generate rulesets, compile/execute NL queries, run landing
//! reconciliations, and clean up expired staging tables. Transport and web
//! UI live elsewhere.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use reconkg_graph::{FsGraphStore, GraphBuildRequest, GraphBuilder, GraphStore};
use reconkg_landing::{DbConfig, ExecutionRequest, LandingDb, ReconciliationExecutor};
use reconkg_llm::LlmAdapter;
use reconkg_model::prefs::{ExcludedFields, FieldPreference, RelationshipPair};
use reconkg_query::{NlCompiler, NlQueryRequest};
use reconkg_rules::{FsRulesetStore, RuleGenerationRequest, RuleGenerator};
use reconkg_schema::SchemaStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "reconkg", about = "Knowledge-graph reconciliation engine", version)]
struct Cli {
    /// Directory of schema descriptor JSON files.
    #[arg(long, default_value = "./schemas", global = true)]
    schema_dir: PathBuf,
    /// Directory for persisted knowledge graphs.
    #[arg(long, default_value = "./graphs", global = true)]
    graph_dir: PathBuf,
    /// Directory for persisted rulesets.
    #[arg(long, default_value = "./rulesets", global = true)]
    ruleset_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a knowledge graph from one or more schemas.
    BuildKg {
        /// Comma-separated schema names.
        #[arg(long, value_delimiter = ',')]
        schemas: Vec<String>,
        #[arg(long)]
        name: String,
        #[arg(long)]
        use_llm: bool,
        /// JSON file of explicit relationship pairs.
        #[arg(long)]
        pairs_file: Option<PathBuf>,
        /// JSON file of field preferences.
        #[arg(long)]
        prefs_file: Option<PathBuf>,
    },
    /// Generate a reconciliation ruleset from a knowledge graph.
    GenerateRules {
        #[arg(long)]
        kg: String,
        #[arg(long)]
        name: String,
        #[arg(long, value_delimiter = ',')]
        schemas: Vec<String>,
        #[arg(long, default_value_t = 0.7)]
        min_confidence: f64,
        #[arg(long)]
        use_llm: bool,
        #[arg(long)]
        prefs_file: Option<PathBuf>,
    },
    /// Compile (and optionally run) NL definitions against a graph.
    Query {
        #[arg(long)]
        kg: String,
        /// One or more definitions.
        #[arg(long, required = true)]
        definition: Vec<String>,
        #[arg(long, default_value = "mysql")]
        db_type: String,
        #[arg(long, default_value_t = 1000)]
        limit: i64,
        #[arg(long)]
        use_llm: bool,
        /// Source database URL; compile-only when omitted.
        #[arg(long)]
        source_url: Option<String>,
    },
    /// Execute a ruleset through the landing database.
    Execute {
        #[arg(long)]
        ruleset: String,
        /// Defaults to RECONKG_LANDING_URL.
        #[arg(long)]
        landing_url: Option<String>,
        #[arg(long)]
        source_url: String,
        #[arg(long)]
        target_url: String,
        #[arg(long)]
        keep_staging: bool,
        #[arg(long)]
        inactive_column: Option<String>,
        #[arg(long, default_value = "Inactive")]
        inactive_value: String,
    },
    /// Drop staging tables past their TTL.
    Cleanup {
        /// Defaults to RECONKG_LANDING_URL.
        #[arg(long)]
        landing_url: Option<String>,
    },
    /// KPI definitions and dashboard.
    Kpi {
        /// Defaults to RECONKG_LANDING_URL.
        #[arg(long)]
        landing_url: Option<String>,
        #[command(subcommand)]
        action: KpiAction,
    },
}

#[derive(Subcommand)]
enum KpiAction {
    /// List active KPI definitions.
    List,
    /// Active KPIs grouped with their latest execution.
    Dashboard,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let schemas = SchemaStore::new(&cli.schema_dir);
    let graphs = FsGraphStore::new(&cli.graph_dir)?;
    let rulesets = FsRulesetStore::new(&cli.ruleset_dir)?;
    let llm = LlmAdapter::from_env();

    match cli.command {
        Command::BuildKg {
            schemas: schema_names,
            name,
            use_llm,
            pairs_file,
            prefs_file,
        } => {
            let pairs: Vec<RelationshipPair> = read_json_or_default(pairs_file)?;
            let preferences: Vec<FieldPreference> = read_json_or_default(prefs_file)?;
            let excluded = match std::env::var("RECONKG_EXCLUDED_FIELDS") {
                Ok(raw) => ExcludedFields::from_override(
                    raw.split(',').map(|s| s.trim().to_string()),
                ),
                Err(_) => ExcludedFields::builtin(),
            };

            let mut builder =
                GraphBuilder::new(&schemas, &graphs).with_excluded_fields(excluded);
            if let Some(llm) = &llm {
                builder = builder.with_llm(llm);
            }
            let mut request = GraphBuildRequest::new(schema_names, &name);
            request.use_llm = use_llm;
            request.pairs = pairs;
            request.preferences = preferences;

            let report = builder.build(&request).await?;
            println!(
                "{} graph `{}`: {} nodes, {} relationships ({} pairs dropped, {} aliases)",
                "built".green().bold(),
                name,
                report.nodes_count,
                report.relationships_count,
                report.pairs_dropped,
                report.aliases_learned,
            );
            if report.llm_degraded {
                println!("{}", "LLM unavailable; rule-based graph only".yellow());
            }
            println!("digest: {}", report.content_digest.dimmed());
        }

        Command::GenerateRules {
            kg,
            name,
            schemas: schema_names,
            min_confidence,
            use_llm,
            prefs_file,
        } => {
            let preferences: Vec<FieldPreference> = read_json_or_default(prefs_file)?;
            let mut generator = RuleGenerator::new(&graphs, &schemas, &rulesets);
            if let Some(llm) = &llm {
                generator = generator.with_llm(llm);
            }
            let mut request = RuleGenerationRequest::new(&kg, &name);
            request.schemas = schema_names;
            request.min_confidence = std::env::var("RECONKG_MIN_CONFIDENCE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(min_confidence);
            request.use_llm = use_llm;
            request.preferences = preferences;

            let report = generator.generate(&request).await?;
            println!(
                "{} ruleset `{}` ({}): {} rules in {}ms",
                "generated".green().bold(),
                report.ruleset.ruleset_name,
                report.ruleset.ruleset_id,
                report.ruleset.rules.len(),
                report.generation_ms,
            );
            for (match_type, count) in &report.rules_by_match_type {
                println!("  {match_type}: {count}");
            }
            if report.invalid_count > 0 {
                println!(
                    "{}",
                    format!("{} rules demoted to INVALID", report.invalid_count).yellow()
                );
            }
        }

        Command::Query {
            kg,
            definition,
            db_type,
            limit,
            use_llm,
            source_url,
        } => {
            let mut compiler = NlCompiler::new(&graphs);
            if let Some(llm) = &llm {
                compiler = compiler.with_llm(llm);
            }

            match source_url {
                Some(url) => {
                    let request = NlQueryRequest {
                        kg_name: kg,
                        schemas: vec![],
                        definitions: definition,
                        use_llm,
                        min_confidence: 0.6,
                        limit,
                        db_type,
                    };
                    let response = compiler
                        .run_batch(&request, &DbConfig::from_url(url))
                        .await?;
                    for result in &response.results {
                        let marker = if result.status == "success" {
                            "ok".green()
                        } else {
                            "failed".red()
                        };
                        println!("[{marker}] {}", result.definition);
                        if let Some(sql) = &result.sql {
                            println!("  {sql}");
                        }
                        if let Some(error) = &result.error {
                            println!("  {}", error.red());
                        }
                        println!(
                            "  records: {}, {}ms",
                            result.record_count, result.execution_time_ms
                        );
                    }
                    println!(
                        "{} {} succeeded, {} failed, {} records, avg confidence {:.2}",
                        "batch:".bold(),
                        response.stats.succeeded,
                        response.stats.failed,
                        response.stats.total_records,
                        response.stats.average_confidence,
                    );
                }
                None => {
                    let dialect = reconkg_query::SqlDialect::parse(&db_type)
                        .context("unknown db_type")?;
                    let loaded = graphs.get(&kg)?;
                    for text in &definition {
                        let (intent, sql) = compiler
                            .compile(&loaded, text, dialect, limit, use_llm)
                            .await?;
                        println!("{} {text}", "compiled".green().bold());
                        println!("  {sql}");
                        for warning in &intent.warnings {
                            println!("  {}", warning.yellow());
                        }
                    }
                }
            }
        }

        Command::Execute {
            ruleset,
            landing_url,
            source_url,
            target_url,
            keep_staging,
            inactive_column,
            inactive_value,
        } => {
            let landing = LandingDb::connect(&resolve_landing_url(landing_url)?).await?;
            landing.bootstrap().await?;
            let executor = ReconciliationExecutor::new(&landing, &rulesets);
            let outcome = executor
                .execute(&ExecutionRequest {
                    ruleset_id: ruleset,
                    source_db: DbConfig::from_url(source_url),
                    target_db: DbConfig::from_url(target_url),
                    limit: None,
                    keep_staging,
                    store_results: true,
                    inactive_column,
                    inactive_value: Some(inactive_value),
                    deadline: None,
                })
                .await?;

            println!("{} execution {}", "done".green().bold(), outcome.execution_id);
            println!(
                "  matched {} / source {} / target {}",
                outcome.matched_count, outcome.total_source_count, outcome.total_target_count
            );
            println!(
                "  RCR {:.1} ({}) | DQCS {:.3} ({}) | REI {:.4} ({}) | IRR {:.1} ({})",
                outcome.kpis.rcr,
                outcome.rcr_status,
                outcome.kpis.dqcs,
                outcome.dqcs_status,
                outcome.kpis.rei,
                outcome.rei_status,
                outcome.kpis.irr,
                outcome.irr_status,
            );
        }

        Command::Cleanup { landing_url } => {
            let landing = LandingDb::connect(&resolve_landing_url(landing_url)?).await?;
            landing.bootstrap().await?;
            let dropped = landing.cleanup_expired().await?;
            println!("{} {dropped} expired staging tables dropped", "cleanup".green());
        }

        Command::Kpi {
            landing_url,
            action,
        } => {
            let landing =
                std::sync::Arc::new(LandingDb::connect(&resolve_landing_url(landing_url)?).await?);
            landing.bootstrap().await?;
            let graphs_arc: std::sync::Arc<dyn GraphStore> =
                std::sync::Arc::new(FsGraphStore::new(&cli.graph_dir)?);
            let engine = reconkg_kpi::KpiEngine::new(landing, graphs_arc);
            engine.store().bootstrap().await?;

            match action {
                KpiAction::List => {
                    for kpi in engine.store().list().await? {
                        println!(
                            "[{}] {} ({}) cached={}",
                            kpi.id,
                            kpi.name.bold(),
                            kpi.group_name.as_deref().unwrap_or("-"),
                            kpi.is_sql_cached,
                        );
                    }
                }
                KpiAction::Dashboard => {
                    for entry in engine.dashboard().await? {
                        println!("{}", entry.group_name.bold());
                        for item in &entry.kpis {
                            println!(
                                "  {} -> {} ({} records)",
                                item.kpi.name,
                                item.last_status.as_deref().unwrap_or("never run"),
                                item.last_records.unwrap_or(0),
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn resolve_landing_url(flag: Option<String>) -> Result<String> {
    flag.or_else(|| std::env::var("RECONKG_LANDING_URL").ok())
        .context("no landing URL; pass --landing-url or set RECONKG_LANDING_URL")
}

fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(
    path: Option<PathBuf>,
) -> Result<T> {
    match path {
        Some(path) => {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(T::default()),
    }
}
