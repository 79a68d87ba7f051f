//! Reconciliation executor
//!
//! End-to-end execution of a ruleset over the landing DB:
//! plan → extract source → extract target (→ extract composite chain
//! intermediates) → one CTE statement for matches, set differences, and KPI
//! projections → persist → staging retention.
//!
//! Composite rules execute through their recorded join chains: every chain
//! table is staged, and each chain contributes a correlated-EXISTS match
//! count over its INNER-join hops. A ruleset with only composite rules
//! computes the matched/unmatched sets through the best chain itself.
//!
//! The counting CTEs never carry a LIMIT; the caller's limit applies only to
//! drill-down evidence projections. Every table and column name reaching a
//! rendered statement passes `validate_identifier` first — including the
//! SELECTs sent to the external source/target databases.

use crate::manager::{LandingDb, StagingColumn, StagingRole, StagingType};
use crate::{extract, sql_quote, validate_identifier, DbConfig, LandingError};
use chrono::Utc;
use reconkg_model::kpi::{
    compute_rei, dqcs_status, irr_status, rcr_status, rei_status, AssessmentStatus,
    ExecutionStatus, KpiValues,
};
use reconkg_model::rules::{JoinType, MatchType, ReconciliationRule, RuleSet};
use reconkg_rules::RulesetStore;
use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub ruleset_id: String,
    pub source_db: DbConfig,
    pub target_db: DbConfig,
    /// Applies to evidence projections only, never to counting CTEs.
    pub limit: Option<i64>,
    pub keep_staging: bool,
    /// Persist the aggregate result row into `execution_history`.
    pub store_results: bool,
    /// Predicate for the IRR KPI: rows where `inactive_column = inactive_value`.
    pub inactive_column: Option<String>,
    pub inactive_value: Option<String>,
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub kpis: KpiValues,
    pub rcr_status: AssessmentStatus,
    pub dqcs_status: AssessmentStatus,
    pub rei_status: AssessmentStatus,
    pub irr_status: AssessmentStatus,
    pub matched_count: i64,
    pub unmatched_source_count: i64,
    pub unmatched_target_count: i64,
    pub total_source_count: i64,
    pub total_target_count: i64,
    pub high_confidence_count: i64,
    pub rule_utilization: f64,
    pub source_staging: Option<String>,
    pub target_staging: Option<String>,
    /// Chain intermediates, in staging order.
    pub chain_staging: Vec<String>,
    pub joined_columns: Vec<String>,
    pub generated_sql: String,
    pub elapsed_ms: u64,
    pub error_message: Option<String>,
}

// ============================================================================
// Composite chains
// ============================================================================

/// One equality hop between fidelity tables of a chain.
#[derive(Debug, Clone)]
struct ChainHop {
    left_alias: String,
    left_column: String,
    right_alias: String,
    right_column: String,
}

/// A fidelity member of a chain: tables reachable from the chain head
/// through INNER hops. LEFT-attached enrichment tables add output columns,
/// not match fidelity, so they stay out of the reconciliation statement.
#[derive(Debug, Clone)]
struct ChainMember {
    table: String,
    alias: String,
    columns: BTreeSet<String>,
}

/// A composite rule's join chain, reduced to its fidelity subgraph.
#[derive(Debug, Clone)]
struct ChainShape {
    confidence: f64,
    members: Vec<ChainMember>,
    hops: Vec<ChainHop>,
    /// Whether the chain's terminal table (the rule's target) is
    /// INNER-connected; only such chains can anchor matched/unmatched sets.
    terminal_included: bool,
}

/// A chain resolved against staging table names.
struct StagedChain {
    confidence: f64,
    /// `(staging_name, alias)` per fidelity member, chain order.
    tables: Vec<(String, String)>,
    hops: Vec<ChainHop>,
}

impl StagedChain {
    fn first(&self) -> &(String, String) {
        &self.tables[0]
    }

    fn last(&self) -> &(String, String) {
        self.tables.last().expect("chains have >= 2 members")
    }

    /// Correlated subquery body over the fidelity tables, excluding the
    /// outer alias. The hop equalities naming the outer alias correlate.
    fn exists_body(&self, outer_alias: &str) -> String {
        let from: Vec<String> = self
            .tables
            .iter()
            .filter(|(_, alias)| alias != outer_alias)
            .map(|(table, alias)| format!("{table} {alias}"))
            .collect();
        let conditions: Vec<String> = self
            .hops
            .iter()
            .map(|hop| {
                format!(
                    "{}.{} = {}.{}",
                    hop.left_alias, hop.left_column, hop.right_alias, hop.right_column
                )
            })
            .collect();
        format!("SELECT 1 FROM {} WHERE {}", from.join(", "), conditions.join(" AND "))
    }
}

/// Reduce a composite rule to its fidelity chain. Returns `None` when the
/// multi-table fields are absent/inconsistent or no INNER hop survives.
fn chain_shape(rule: &ReconciliationRule) -> Option<ChainShape> {
    let order = rule.join_order.as_ref()?;
    let conditions = rule.join_conditions.as_ref()?;
    let types = rule.join_types.as_ref()?;
    if order.len() < 2 || conditions.len() != order.len() - 1 || types.len() != conditions.len() {
        return None;
    }

    let alias_of: BTreeMap<&str, String> = order
        .iter()
        .enumerate()
        .map(|(i, table)| (table.as_str(), format!("c{i}")))
        .collect();

    let mut columns_of: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    let mut included: Vec<&str> = vec![order[0].as_str()];
    let mut hops = Vec::new();

    for (i, condition) in conditions.iter().enumerate() {
        if types[i] != JoinType::Inner {
            continue;
        }
        let attached = order[i + 1].as_str();
        let (left_table, left_column) = condition.left.split_once('.')?;
        let (right_table, right_column) = condition.right.split_once('.')?;
        // The condition anchors the attached table on some earlier member.
        let (anchor, anchor_col, candidate, candidate_col) = if right_table == attached {
            (left_table, left_column, right_table, right_column)
        } else {
            (right_table, right_column, left_table, left_column)
        };
        if !included.contains(&anchor) || candidate != attached {
            continue;
        }
        included.push(candidate);
        columns_of
            .entry(anchor)
            .or_default()
            .insert(anchor_col.to_string());
        columns_of
            .entry(candidate)
            .or_default()
            .insert(candidate_col.to_string());
        hops.push(ChainHop {
            left_alias: alias_of.get(anchor)?.clone(),
            left_column: anchor_col.to_string(),
            right_alias: alias_of.get(candidate)?.clone(),
            right_column: candidate_col.to_string(),
        });
    }
    if hops.is_empty() {
        return None;
    }

    let members: Vec<ChainMember> = order
        .iter()
        .filter(|table| included.contains(&table.as_str()))
        .map(|table| ChainMember {
            table: table.clone(),
            alias: alias_of[table.as_str()].clone(),
            columns: columns_of.remove(table.as_str()).unwrap_or_default(),
        })
        .collect();
    let terminal_included = included.contains(&order.last()?.as_str());

    Some(ChainShape {
        confidence: rule.confidence,
        members,
        hops,
        terminal_included,
    })
}

/// The minimal extraction plan derived from a ruleset.
struct Plan<'r> {
    /// Single-pair rules on the anchor endpoints; empty in composite mode.
    rules: Vec<&'r ReconciliationRule>,
    /// Composite chains whose endpoints match the plan's; the first chain
    /// anchors matched/unmatched when `rules` is empty.
    chains: Vec<ChainShape>,
    source_table: String,
    target_table: String,
    source_columns: Vec<String>,
    target_columns: Vec<String>,
    /// Chain intermediates (neither source nor target) and the columns to
    /// stage for each, in stable order.
    chain_tables: Vec<(String, Vec<String>)>,
}

pub struct ReconciliationExecutor<'a> {
    landing: &'a LandingDb,
    rulesets: &'a dyn RulesetStore,
}

impl<'a> ReconciliationExecutor<'a> {
    pub fn new(landing: &'a LandingDb, rulesets: &'a dyn RulesetStore) -> Self {
        Self { landing, rulesets }
    }

    pub async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, LandingError> {
        let deadline = request.deadline.unwrap_or(Duration::from_secs(3600));
        match tokio::time::timeout(deadline, self.execute_inner(request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Staging from a timed-out run follows keep_staging for
                // post-mortem, same as a failure.
                let timeout = LandingError::Timeout(deadline.as_secs());
                if request.store_results {
                    let _ = self
                        .persist_failure(&timeout, ExecutionStatus::Timeout)
                        .await;
                }
                Err(timeout)
            }
        }
    }

    async fn execute_inner(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, LandingError> {
        let started = Instant::now();
        let execution_id = Uuid::new_v4().to_string();

        let ruleset = self
            .rulesets
            .load(&request.ruleset_id)
            .map_err(|e| LandingError::Ruleset(e.to_string()))?;
        let plan = plan_for(&ruleset, request)?;

        // Phase 2/3: extract both sides (and chain intermediates) into
        // staging with join indexes. Everything staged so far is torn down
        // together on failure, per keep_staging.
        let mut staged: Vec<String> = Vec::new();
        let mut staging_of: BTreeMap<String, String> = BTreeMap::new();

        let source_staging = self
            .stage_side(
                &execution_id,
                &ruleset.ruleset_id,
                StagingRole::Source,
                &request.source_db,
                &plan.source_table,
                &plan.source_columns,
            )
            .await?;
        staged.push(source_staging.clone());
        staging_of.insert(plan.source_table.clone(), source_staging.clone());

        let target_staging = match self
            .stage_side(
                &execution_id,
                &ruleset.ruleset_id,
                StagingRole::Target,
                &request.target_db,
                &plan.target_table,
                &plan.target_columns,
            )
            .await
        {
            Ok(name) => name,
            Err(e) => {
                self.drop_all(&staged, request.keep_staging).await;
                return Err(e);
            }
        };
        staged.push(target_staging.clone());
        staging_of.insert(plan.target_table.clone(), target_staging.clone());

        // Chain intermediates extract from the target database: composition
        // orders chains priority-rich to enrichment, and enrichment tables
        // ride with the target. The index prefix keeps same-second staging
        // names collision-free.
        let mut chain_staging = Vec::new();
        for (index, (table, columns)) in plan.chain_tables.iter().enumerate() {
            let chained_id = format!("{index}{execution_id}");
            let result = self
                .stage_side(
                    &chained_id,
                    &ruleset.ruleset_id,
                    StagingRole::Target,
                    &request.target_db,
                    table,
                    columns,
                )
                .await;
            match result {
                Ok(name) => {
                    staged.push(name.clone());
                    staging_of.insert(table.clone(), name.clone());
                    chain_staging.push(name);
                }
                Err(e) => {
                    self.drop_all(&staged, request.keep_staging).await;
                    return Err(e);
                }
            }
        }

        // Resolve chain shapes against the staging names.
        let mut staged_chains: Vec<StagedChain> = Vec::new();
        for shape in &plan.chains {
            let tables: Option<Vec<(String, String)>> = shape
                .members
                .iter()
                .map(|m| staging_of.get(&m.table).map(|s| (s.clone(), m.alias.clone())))
                .collect();
            match tables {
                Some(tables) => staged_chains.push(StagedChain {
                    confidence: shape.confidence,
                    tables,
                    hops: shape.hops.clone(),
                }),
                None => warn!("chain member missing from staging map, skipping chain"),
            }
        }
        if plan.rules.is_empty() && staged_chains.is_empty() {
            self.drop_all(&staged, request.keep_staging).await;
            return Err(LandingError::NoExecutableRules(ruleset.ruleset_id.clone()));
        }

        // Phase 4: reconcile + KPIs in one statement.
        let sql = reconciliation_sql(
            &source_staging,
            &target_staging,
            &plan,
            &staged_chains,
            request.inactive_column.as_deref(),
            request.inactive_value.as_deref(),
        );

        let query_result = sqlx::query(&sql).fetch_one(self.landing.pool()).await;
        let row = match query_result {
            Ok(row) => row,
            Err(e) => {
                let error = LandingError::from(e);
                if request.store_results {
                    let _ = self
                        .persist_failed_sql(&execution_id, &sql, &error)
                        .await;
                }
                self.drop_all(&staged, request.keep_staging).await;
                return Err(error);
            }
        };

        let get_i64 = |key: &str| row.try_get::<i64, _>(key).unwrap_or(0);
        let get_f64 =
            |key: &str| row.try_get::<f64, _>(key).unwrap_or(0.0);

        let matched_count = get_i64("matched_count");
        let total_source = get_i64("total_source_count");
        let total_target = get_i64("total_target_count");
        let rcr = get_f64("rcr");
        let dqcs = get_f64("dqcs");
        let irr = get_f64("irr");

        // Utilization counts pair rules and chains alike.
        let pair_hits = (0..plan.rules.len())
            .filter(|i| get_i64(&format!("rule_{i}_matches")) > 0)
            .count();
        let chain_hits = (0..staged_chains.len())
            .filter(|i| get_i64(&format!("chain_{i}_matches")) > 0)
            .count();
        let rule_total = plan.rules.len() + staged_chains.len();
        let rule_utilization = if rule_total == 0 {
            0.0
        } else {
            (pair_hits + chain_hits) as f64 / rule_total as f64
        };

        let elapsed = started.elapsed();
        let rei = compute_rei(rcr, rule_utilization, elapsed.as_secs_f64().max(0.001));
        let kpis = KpiValues { rcr, dqcs, rei, irr };

        let joined_columns: Vec<String> = plan
            .rules
            .iter()
            .flat_map(|r| {
                r.source_columns
                    .iter()
                    .zip(&r.target_columns)
                    .map(|(s, t)| format!("s.{s}=t.{t}"))
            })
            .collect();

        let outcome = ExecutionOutcome {
            execution_id: execution_id.clone(),
            status: ExecutionStatus::Success,
            kpis,
            rcr_status: rcr_status(rcr),
            dqcs_status: dqcs_status(dqcs),
            rei_status: rei_status(rei),
            irr_status: irr_status(irr),
            matched_count,
            unmatched_source_count: get_i64("unmatched_source_count"),
            unmatched_target_count: get_i64("unmatched_target_count"),
            total_source_count: total_source,
            total_target_count: total_target,
            high_confidence_count: get_i64("high_confidence_count"),
            rule_utilization,
            source_staging: Some(source_staging.clone()),
            target_staging: Some(target_staging.clone()),
            chain_staging,
            joined_columns,
            generated_sql: sql,
            elapsed_ms: elapsed.as_millis() as u64,
            error_message: None,
        };

        // Phase 5: persist the aggregate row.
        if request.store_results {
            self.persist_outcome(&ruleset, &outcome).await?;
        }

        // Phase 6: staging retention.
        if !request.keep_staging {
            for table in &staged {
                self.landing.drop_staging(table).await?;
            }
        }

        info!(
            execution = %outcome.execution_id,
            rcr = outcome.kpis.rcr,
            dqcs = outcome.kpis.dqcs,
            matched = outcome.matched_count,
            chains = staged_chains.len(),
            elapsed_ms = outcome.elapsed_ms,
            "reconciliation complete"
        );
        Ok(outcome)
    }

    async fn drop_all(&self, staged: &[String], keep_staging: bool) {
        if keep_staging {
            return;
        }
        for table in staged {
            let _ = self.landing.drop_staging(table).await;
        }
    }

    async fn stage_side(
        &self,
        execution_id: &str,
        ruleset_id: &str,
        role: StagingRole,
        db: &DbConfig,
        table: &str,
        columns: &[String],
    ) -> Result<String, LandingError> {
        // Rule-derived names (including LLM-generated rules) are untrusted
        // until checked; nothing unvalidated reaches the source database.
        validate_identifier(table)?;
        for column in columns {
            validate_identifier(column)?;
        }
        let select = format!("SELECT {} FROM {table}", columns.join(", "));
        let staged_columns = sample_column_types(db, &select, columns).await?;
        let staging = self
            .landing
            .create_staging(execution_id, ruleset_id, role, &staged_columns)
            .await?;
        extract::extract_to_landing(db, &select, self.landing, &staging).await?;
        self.landing.create_indexes(&staging, columns).await?;
        Ok(staging)
    }

    async fn persist_outcome(
        &self,
        ruleset: &RuleSet,
        outcome: &ExecutionOutcome,
    ) -> Result<(), LandingError> {
        let result_data = serde_json::json!({
            "kpis": {
                "rcr": {"value": outcome.kpis.rcr, "status": outcome.rcr_status.to_string()},
                "dqcs": {"value": outcome.kpis.dqcs, "status": outcome.dqcs_status.to_string()},
                "rei": {"value": outcome.kpis.rei, "status": outcome.rei_status.to_string()},
                "irr": {"value": outcome.kpis.irr, "status": outcome.irr_status.to_string()},
            },
            "matched_count": outcome.matched_count,
            "unmatched_source_count": outcome.unmatched_source_count,
            "unmatched_target_count": outcome.unmatched_target_count,
            "total_source_count": outcome.total_source_count,
            "total_target_count": outcome.total_target_count,
            "high_confidence_count": outcome.high_confidence_count,
            "rule_utilization": outcome.rule_utilization,
            "chain_staging": outcome.chain_staging,
        });
        let insert = format!(
            "INSERT INTO execution_history \
             (execution_id, ruleset_name, operation, execution_status, \
              execution_timestamp, execution_time_ms, generated_sql, \
              number_of_records, joined_columns, confidence_score, result_data, \
              source_table, target_table) \
             VALUES ({}, {}, 'reconciliation', 'success', {}, {}, {}, {}, {}, {}, {}, {}, {})",
            sql_quote(&outcome.execution_id),
            sql_quote(&ruleset.ruleset_name),
            sql_quote(&Utc::now().to_rfc3339()),
            outcome.elapsed_ms,
            sql_quote(&outcome.generated_sql),
            outcome.matched_count,
            sql_quote(&outcome.joined_columns.join(",")),
            outcome.kpis.dqcs,
            sql_quote(&result_data.to_string()),
            sql_quote(outcome.source_staging.as_deref().unwrap_or("")),
            sql_quote(outcome.target_staging.as_deref().unwrap_or("")),
        );
        sqlx::query(&insert).execute(self.landing.pool()).await?;
        Ok(())
    }

    async fn persist_failed_sql(
        &self,
        execution_id: &str,
        sql: &str,
        error: &LandingError,
    ) -> Result<(), LandingError> {
        // Generated SQL is persisted on every outcome, including failure.
        let insert = format!(
            "INSERT INTO execution_history \
             (execution_id, operation, execution_status, execution_timestamp, \
              generated_sql, error_message) \
             VALUES ({}, 'reconciliation', 'failed', {}, {}, {})",
            sql_quote(execution_id),
            sql_quote(&Utc::now().to_rfc3339()),
            sql_quote(sql),
            sql_quote(&error.to_string()),
        );
        sqlx::query(&insert).execute(self.landing.pool()).await?;
        Ok(())
    }

    async fn persist_failure(
        &self,
        error: &LandingError,
        status: ExecutionStatus,
    ) -> Result<(), LandingError> {
        let insert = format!(
            "INSERT INTO execution_history \
             (execution_id, operation, execution_status, execution_timestamp, \
              error_message) \
             VALUES ({}, 'reconciliation', {}, {}, {})",
            sql_quote(&Uuid::new_v4().to_string()),
            sql_quote(status.as_str()),
            sql_quote(&Utc::now().to_rfc3339()),
            sql_quote(&error.to_string()),
        );
        sqlx::query(&insert).execute(self.landing.pool()).await?;
        Ok(())
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Derive the extraction plan: the executable single-pair rules of the
/// busiest table pair (anchored on the most confident rule), plus the
/// composite chains sharing those endpoints. When only composite rules
/// exist, the best terminal-connected chain anchors the plan instead.
///
/// Every table and column the plan will interpolate into SQL is validated
/// here, before any query leaves the process.
fn plan_for<'r>(
    ruleset: &'r RuleSet,
    request: &ExecutionRequest,
) -> Result<Plan<'r>, LandingError> {
    let mut singles: Vec<&ReconciliationRule> = ruleset
        .executable_rules()
        .filter(|r| !r.is_composite() && r.match_type != MatchType::Semantic)
        .collect();
    singles.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut composites: Vec<(&ReconciliationRule, ChainShape)> = ruleset
        .executable_rules()
        .filter(|r| r.is_composite())
        .filter_map(|r| chain_shape(r).map(|shape| (r, shape)))
        .collect();
    composites.sort_by(|a, b| {
        b.1.terminal_included
            .cmp(&a.1.terminal_included)
            .then_with(|| {
                b.0.confidence
                    .partial_cmp(&a.0.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });

    let (source_table, target_table, rules) = if !singles.is_empty() {
        let source = singles[0].source_table.clone();
        let target = singles[0].target_table.clone();
        let rules: Vec<&ReconciliationRule> = singles
            .into_iter()
            .filter(|r| r.source_table == source && r.target_table == target)
            .collect();
        (source, target, rules)
    } else if let Some((anchor_rule, shape)) = composites.first() {
        if !shape.terminal_included {
            return Err(LandingError::NoExecutableRules(ruleset.ruleset_id.clone()));
        }
        (
            anchor_rule.source_table.clone(),
            anchor_rule.target_table.clone(),
            Vec::new(),
        )
    } else {
        return Err(LandingError::NoExecutableRules(ruleset.ruleset_id.clone()));
    };

    // Keep the chains that span this plan's endpoints; others would need a
    // different staging pair and are skipped with a diagnostic.
    let mut chains = Vec::new();
    for (rule, shape) in composites {
        let spans = rule.join_order.as_ref().map_or(false, |order| {
            order.first().map(String::as_str) == Some(source_table.as_str())
                && order.last().map(String::as_str) == Some(target_table.as_str())
        });
        if spans {
            chains.push(shape);
        } else {
            warn!(
                rule = %rule.rule_id,
                "composite rule spans different endpoints than the plan, skipping"
            );
        }
    }

    let mut source_columns: BTreeSet<String> = BTreeSet::new();
    let mut target_columns: BTreeSet<String> = BTreeSet::new();
    for rule in &rules {
        source_columns.extend(rule.source_columns.iter().cloned());
        target_columns.extend(rule.target_columns.iter().cloned());
    }
    let mut chain_columns: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for shape in &chains {
        for member in &shape.members {
            if member.table == source_table {
                source_columns.extend(member.columns.iter().cloned());
            } else if member.table == target_table {
                target_columns.extend(member.columns.iter().cloned());
            } else {
                chain_columns
                    .entry(member.table.clone())
                    .or_default()
                    .extend(member.columns.iter().cloned());
            }
        }
    }
    if let Some(inactive) = &request.inactive_column {
        // Caller-supplied predicate column; checked like every other
        // identifier before it can reach a rendered statement.
        validate_identifier(inactive)?;
        source_columns.insert(inactive.clone());
    }

    validate_identifier(&source_table)?;
    validate_identifier(&target_table)?;
    for column in source_columns.iter().chain(&target_columns) {
        validate_identifier(column)?;
    }
    for (table, columns) in &chain_columns {
        validate_identifier(table)?;
        for column in columns {
            validate_identifier(column)?;
        }
    }

    Ok(Plan {
        rules,
        chains,
        source_table,
        target_table,
        source_columns: source_columns.into_iter().collect(),
        target_columns: target_columns.into_iter().collect(),
        chain_tables: chain_columns
            .into_iter()
            .map(|(table, columns)| (table, columns.into_iter().collect()))
            .collect(),
    })
}

/// Infer staging column types from a 100-row sample of the extract.
async fn sample_column_types(
    db: &DbConfig,
    select: &str,
    columns: &[String],
) -> Result<Vec<StagingColumn>, LandingError> {
    use sqlx::any::AnyPoolOptions;
    // The select is assembled from validated identifiers; re-check the
    // column list here so this path stays safe on its own.
    for column in columns {
        validate_identifier(column)?;
    }
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(crate::manager::MIN_CONNECT_TIMEOUT_SECS))
        .connect(&db.connection_url())
        .await
        .map_err(|e| {
            LandingError::Connect(format!("sample connect to {}: {e}", db.redacted_url()))
        })?;
    let sample_sql = format!("SELECT * FROM ({select}) AS width_sample LIMIT 100");
    let rows = sqlx::query(&sample_sql).fetch_all(&pool).await?;

    let mut staged = Vec::with_capacity(columns.len());
    for (idx, name) in columns.iter().enumerate() {
        let mut max_len = 1usize;
        let mut all_int = !rows.is_empty();
        let mut all_num = !rows.is_empty();
        for row in &rows {
            if let Ok(text) = row.try_get::<String, _>(idx) {
                max_len = max_len.max(text.len());
                all_int = false;
                all_num = false;
            } else if row.try_get::<i64, _>(idx).is_ok() {
                max_len = max_len.max(20);
            } else if row.try_get::<f64, _>(idx).is_ok() {
                all_int = false;
                max_len = max_len.max(40);
            } else {
                all_int = false;
                all_num = false;
            }
        }
        let kind = if all_int {
            StagingType::Integer
        } else if all_num {
            StagingType::Decimal
        } else {
            StagingType::Text {
                max_len: (max_len * 2).clamp(32, 4000),
            }
        };
        staged.push(StagingColumn {
            name: name.clone(),
            kind,
        });
    }
    Ok(staged)
}

// ============================================================================
// Reconciliation SQL
// ============================================================================

fn rule_condition(rule: &ReconciliationRule) -> String {
    let pairs: Vec<String> = rule
        .source_columns
        .iter()
        .zip(&rule.target_columns)
        .map(|(s, t)| match rule.match_type {
            // LEVENSHTEIN is not portable across landing schemes; fuzzy and
            // transformation rules compare normalized values.
            MatchType::Fuzzy | MatchType::Transformation => {
                format!("UPPER(TRIM(s.{s})) = UPPER(TRIM(t.{t}))")
            }
            _ => format!("s.{s} = t.{t}"),
        })
        .collect();
    format!("({})", pairs.join(" AND "))
}

/// The single reconciliation + KPI statement, built over the two staging
/// tables and any composite-rule chains. Counting CTEs carry no LIMIT.
fn reconciliation_sql(
    source_table: &str,
    target_table: &str,
    plan: &Plan<'_>,
    chains: &[StagedChain],
    inactive_column: Option<&str>,
    inactive_value: Option<&str>,
) -> String {
    let pair_mode = !plan.rules.is_empty();

    // Matched/unmatched CTEs: pair conditions when single-pair rules exist,
    // otherwise the anchor chain's correlated EXISTS.
    let (matched_cte, rule_sums, rule_sum_select, unmatched_source_cte, unmatched_target_cte) =
        if pair_mode {
            let conditions: Vec<String> = plan.rules.iter().map(|r| rule_condition(r)).collect();
            let any_condition = conditions.join(" OR ");
            let confidence_case = {
                let whens: Vec<String> = plan
                    .rules
                    .iter()
                    .zip(&conditions)
                    .map(|(rule, cond)| format!("WHEN {cond} THEN {}", rule.confidence))
                    .collect();
                format!("CASE {} ELSE 0 END", whens.join(" "))
            };
            let rule_flags: Vec<String> = conditions
                .iter()
                .enumerate()
                .map(|(i, cond)| format!("CASE WHEN {cond} THEN 1 ELSE 0 END AS rule_{i}"))
                .collect();
            let matched = format!(
                "matched AS (\n\
                     SELECT {confidence_case} AS confidence,\n\
                            {}\n\
                     FROM {source_table} s\n\
                     INNER JOIN {target_table} t ON {any_condition}\n\
                 )",
                rule_flags.join(",\n                    "),
            );
            let rule_sums: Vec<String> = (0..conditions.len())
                .map(|i| format!("SUM(rule_{i}) AS rule_{i}_matches"))
                .collect();
            let rule_sum_select: Vec<String> = (0..conditions.len())
                .map(|i| format!("m.rule_{i}_matches"))
                .collect();
            let unmatched_source = format!(
                "unmatched_source AS (\n\
                     SELECT COUNT(*) AS unmatched_source_count\n\
                     FROM {source_table} s\n\
                     WHERE NOT EXISTS (SELECT 1 FROM {target_table} t WHERE {any_condition})\n\
                 )"
            );
            let unmatched_target = format!(
                "unmatched_target AS (\n\
                     SELECT COUNT(*) AS unmatched_target_count\n\
                     FROM {target_table} t\n\
                     WHERE NOT EXISTS (SELECT 1 FROM {source_table} s WHERE {any_condition})\n\
                 )"
            );
            (matched, rule_sums, rule_sum_select, unmatched_source, unmatched_target)
        } else {
            let anchor = &chains[0];
            let (src_staging, src_alias) = anchor.first().clone();
            let (tgt_staging, tgt_alias) = anchor.last().clone();
            let matched = format!(
                "matched AS (\n\
                     SELECT {} AS confidence\n\
                     FROM {src_staging} {src_alias}\n\
                     WHERE EXISTS ({})\n\
                 )",
                anchor.confidence,
                anchor.exists_body(&src_alias),
            );
            let unmatched_source = format!(
                "unmatched_source AS (\n\
                     SELECT COUNT(*) AS unmatched_source_count\n\
                     FROM {src_staging} {src_alias}\n\
                     WHERE NOT EXISTS ({})\n\
                 )",
                anchor.exists_body(&src_alias),
            );
            let unmatched_target = format!(
                "unmatched_target AS (\n\
                     SELECT COUNT(*) AS unmatched_target_count\n\
                     FROM {tgt_staging} {tgt_alias}\n\
                     WHERE NOT EXISTS ({})\n\
                 )",
                anchor.exists_body(&tgt_alias),
            );
            (matched, Vec::new(), Vec::new(), unmatched_source, unmatched_target)
        };

    // One counting CTE per chain, in both modes; chains feed rule
    // utilization alongside the pair rules.
    let chain_ctes: Vec<String> = chains
        .iter()
        .enumerate()
        .map(|(i, chain)| {
            let (first_staging, first_alias) = chain.first().clone();
            format!(
                "chain_{i} AS (\n\
                     SELECT COUNT(*) AS chain_{i}_matches\n\
                     FROM {first_staging} {first_alias}\n\
                     WHERE EXISTS ({})\n\
                 )",
                chain.exists_body(&first_alias),
            )
        })
        .collect();
    let chain_cte_block = if chain_ctes.is_empty() {
        String::new()
    } else {
        format!(",\n         {}", chain_ctes.join(",\n         "))
    };
    let chain_select: String = (0..chains.len())
        .map(|i| format!("ch{i}.chain_{i}_matches,\n                "))
        .collect();
    let chain_from: String = (0..chains.len())
        .map(|i| format!(", chain_{i} ch{i}"))
        .collect();

    let inactive_count = match (inactive_column, inactive_value) {
        (Some(column), Some(value)) => format!(
            "(SELECT COUNT(*) FROM {source_table} WHERE {column} = {})",
            sql_quote(value)
        ),
        _ => "0".to_string(),
    };

    format!(
        "WITH {matched_cte},\n\
         match_stats AS (\n\
             SELECT COUNT(*) AS matched_count,\n\
                    COALESCE(AVG(confidence), 0) AS avg_confidence,\n\
                    SUM(CASE WHEN confidence >= 0.9 THEN 1 ELSE 0 END) AS high_confidence_count{rule_sums_prefix}{rule_sums}\n\
             FROM matched\n\
         ),\n\
         {unmatched_source_cte},\n\
         {unmatched_target_cte},\n\
         totals AS (\n\
             SELECT (SELECT COUNT(*) FROM {source_table}) AS total_source_count,\n\
                    (SELECT COUNT(*) FROM {target_table}) AS total_target_count,\n\
                    {inactive_count} AS inactive_source_count\n\
         ){chain_cte_block}\n\
         SELECT m.matched_count,\n\
                m.avg_confidence AS dqcs,\n\
                m.high_confidence_count,\n\
                {rule_sum_select}{chain_select}u1.unmatched_source_count,\n\
                u2.unmatched_target_count,\n\
                t.total_source_count,\n\
                t.total_target_count,\n\
                t.inactive_source_count,\n\
                CASE WHEN t.total_source_count > 0\n\
                     THEN m.matched_count * 100.0 / t.total_source_count ELSE 0 END AS rcr,\n\
                CASE WHEN t.total_source_count > 0\n\
                     THEN t.inactive_source_count * 100.0 / t.total_source_count ELSE 0 END AS irr\n\
         FROM match_stats m, unmatched_source u1, unmatched_target u2, totals t{chain_from}",
        rule_sums_prefix = if rule_sums.is_empty() { "" } else { ",\n                    " },
        rule_sums = rule_sums.join(",\n                    "),
        rule_sum_select = if rule_sum_select.is_empty() {
            String::new()
        } else {
            format!("{},\n                ", rule_sum_select.join(",\n                "))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reconkg_model::rules::{JoinCondition, ValidationStatus};

    fn rule(id: &str, source_col: &str, target_col: &str, confidence: f64) -> ReconciliationRule {
        ReconciliationRule {
            rule_id: id.to_string(),
            rule_name: id.to_string(),
            source_schema: "a".to_string(),
            source_table: "src".to_string(),
            source_columns: vec![source_col.to_string()],
            target_schema: "b".to_string(),
            target_table: "tgt".to_string(),
            target_columns: vec![target_col.to_string()],
            match_type: MatchType::Exact,
            transformation: None,
            confidence,
            reasoning: String::new(),
            validation_status: ValidationStatus::Valid,
            llm_generated: false,
            created_at: Utc::now(),
            join_tables: None,
            join_conditions: None,
            join_order: None,
            join_types: None,
        }
    }

    fn composite(
        tables: &[&str],
        conditions: &[(&str, &str)],
        types: &[JoinType],
    ) -> ReconciliationRule {
        let mut r = rule("comp", "k1", "k2", 0.85);
        r.source_table = tables[0].to_string();
        r.target_table = tables[tables.len() - 1].to_string();
        r.match_type = MatchType::Composite;
        r.join_tables = Some(tables.iter().map(|t| t.to_string()).collect());
        r.join_conditions = Some(
            conditions
                .iter()
                .map(|(l, rgt)| JoinCondition {
                    left: l.to_string(),
                    right: rgt.to_string(),
                })
                .collect(),
        );
        r.join_order = Some(tables.iter().map(|t| t.to_string()).collect());
        r.join_types = Some(types.to_vec());
        r
    }

    fn plan_with(rules: Vec<&'static ReconciliationRule>) -> Plan<'static> {
        Plan {
            rules,
            chains: Vec::new(),
            source_table: "src".to_string(),
            target_table: "tgt".to_string(),
            source_columns: vec!["Material".to_string()],
            target_columns: vec!["PLANNING_SKU".to_string()],
            chain_tables: Vec::new(),
        }
    }

    fn staged(shape: &ChainShape, staging: &[(&str, &str)]) -> StagedChain {
        let map: BTreeMap<&str, &str> = staging.iter().copied().collect();
        StagedChain {
            confidence: 0.85,
            tables: shape
                .members
                .iter()
                .map(|m| (map[m.table.as_str()].to_string(), m.alias.clone()))
                .collect(),
            hops: shape.hops.clone(),
        }
    }

    #[test]
    fn reconciliation_sql_has_all_counting_ctes_and_no_limit() {
        let r = Box::leak(Box::new(rule("r1", "Material", "PLANNING_SKU", 0.95)));
        let sql = reconciliation_sql("stage_s", "stage_t", &plan_with(vec![r]), &[], None, None);
        assert!(sql.contains("WITH matched AS"));
        assert!(sql.contains("unmatched_source_count"));
        assert!(sql.contains("unmatched_target_count"));
        assert!(sql.contains("total_source_count"));
        assert!(sql.contains("NOT EXISTS"));
        assert!(sql.contains("s.Material = t.PLANNING_SKU"));
        assert!(sql.contains("AS rcr"));
        assert!(sql.contains("AS dqcs"));
        assert!(sql.contains("AS irr"));
        assert!(!sql.to_uppercase().contains("LIMIT"));
    }

    #[test]
    fn inactive_predicate_feeds_irr() {
        let r = Box::leak(Box::new(rule("r1", "Material", "PLANNING_SKU", 0.95)));
        let sql = reconciliation_sql(
            "stage_s",
            "stage_t",
            &plan_with(vec![r]),
            &[],
            Some("Active_Inactive"),
            Some("Inactive"),
        );
        assert!(sql.contains("WHERE Active_Inactive = 'Inactive'"));
    }

    #[test]
    fn fuzzy_rules_compare_normalized_values() {
        let mut r = rule("r1", "name", "planner_name", 0.7);
        r.match_type = MatchType::Fuzzy;
        assert_eq!(
            rule_condition(&r),
            "(UPPER(TRIM(s.name)) = UPPER(TRIM(t.planner_name)))"
        );
    }

    #[test]
    fn multi_column_rule_conditions_are_anded() {
        let mut r = rule("r1", "a", "x", 0.9);
        r.source_columns.push("b".to_string());
        r.target_columns.push("y".to_string());
        assert_eq!(rule_condition(&r), "(s.a = t.x AND s.b = t.y)");
    }

    #[test]
    fn chain_shape_follows_inner_hops_in_order() {
        let r = composite(
            &["src", "bridge", "master"],
            &[("src.k1", "bridge.k1"), ("bridge.k2", "master.k2")],
            &[JoinType::Inner, JoinType::Inner],
        );
        let shape = chain_shape(&r).unwrap();
        assert!(shape.terminal_included);
        let members: Vec<&str> = shape.members.iter().map(|m| m.table.as_str()).collect();
        assert_eq!(members, vec!["src", "bridge", "master"]);
        assert_eq!(shape.hops.len(), 2);
        assert_eq!(shape.hops[0].left_alias, "c0");
        assert_eq!(shape.hops[1].right_alias, "c2");
        // Each member carries exactly the columns its hops touch.
        assert!(shape.members[1].columns.contains("k1"));
        assert!(shape.members[1].columns.contains("k2"));
    }

    #[test]
    fn chain_shape_drops_left_attached_enrichment() {
        let r = composite(
            &["src", "bridge", "extra"],
            &[("src.k1", "bridge.k1"), ("bridge.k2", "extra.k2")],
            &[JoinType::Inner, JoinType::Left],
        );
        let shape = chain_shape(&r).unwrap();
        assert!(!shape.terminal_included);
        assert_eq!(shape.members.len(), 2);
        assert_eq!(shape.hops.len(), 1);
    }

    #[test]
    fn chain_shape_rejects_inconsistent_join_fields() {
        let mut r = composite(
            &["src", "bridge"],
            &[("src.k1", "bridge.k1")],
            &[JoinType::Inner],
        );
        r.join_types = Some(vec![]);
        assert!(chain_shape(&r).is_none());
    }

    #[test]
    fn pair_mode_sql_counts_chains_alongside_rules() {
        let r = Box::leak(Box::new(rule("r1", "Material", "PLANNING_SKU", 0.95)));
        let comp = composite(
            &["src", "bridge", "tgt"],
            &[("src.Material", "bridge.k1"), ("bridge.k2", "tgt.PLANNING_SKU")],
            &[JoinType::Inner, JoinType::Inner],
        );
        let shape = chain_shape(&comp).unwrap();
        let chain = staged(
            &shape,
            &[("src", "stage_s"), ("bridge", "stage_b"), ("tgt", "stage_t")],
        );
        let sql =
            reconciliation_sql("stage_s", "stage_t", &plan_with(vec![r]), &[chain], None, None);
        assert!(sql.contains("rule_0_matches"));
        assert!(sql.contains("chain_0 AS"));
        assert!(sql.contains("ch0.chain_0_matches"));
        assert!(sql.contains("WHERE EXISTS (SELECT 1 FROM stage_b c1, stage_t c2"));
        assert!(sql.contains("c0.Material = c1.k1 AND c1.k2 = c2.PLANNING_SKU"));
    }

    #[test]
    fn composite_only_sql_matches_through_the_chain() {
        let comp = composite(
            &["src", "bridge", "tgt"],
            &[("src.k1", "bridge.k1"), ("bridge.k2", "tgt.k2")],
            &[JoinType::Inner, JoinType::Inner],
        );
        let shape = chain_shape(&comp).unwrap();
        let chain = staged(
            &shape,
            &[("src", "stage_s"), ("bridge", "stage_b"), ("tgt", "stage_t")],
        );
        let mut plan = plan_with(vec![]);
        plan.chains = vec![shape];
        let sql = reconciliation_sql("stage_s", "stage_t", &plan, &[chain], None, None);
        // Matched and unmatched sets come from the chain's EXISTS.
        assert!(sql.contains("FROM stage_s c0\n"));
        assert!(sql.contains("WHERE EXISTS"));
        assert!(sql.contains("WHERE NOT EXISTS"));
        // unmatched_target correlates from the chain's terminal alias.
        assert!(sql.contains("FROM stage_t c2"));
        assert!(!sql.contains("rule_0_matches"));
        assert!(sql.contains("chain_0_matches"));
    }

    #[test]
    fn plan_rejects_unsafe_identifiers() {
        let mut bad = rule("r1", "Material; DROP TABLE x", "PLANNING_SKU", 0.95);
        bad.source_table = "src".to_string();
        let ruleset = RuleSet {
            ruleset_id: "rs".to_string(),
            ruleset_name: "rs".to_string(),
            schemas: vec![],
            rules: vec![bad],
            generated_from_kg: "kg".to_string(),
            created_at: Utc::now(),
        };
        let request = ExecutionRequest {
            ruleset_id: "rs".to_string(),
            source_db: DbConfig::from_url("sqlite::memory:"),
            target_db: DbConfig::from_url("sqlite::memory:"),
            limit: None,
            keep_staging: false,
            store_results: false,
            inactive_column: None,
            inactive_value: None,
            deadline: None,
        };
        assert!(plan_for(&ruleset, &request).is_err());
    }

    #[test]
    fn plan_rejects_unsafe_inactive_column() {
        let r = rule("r1", "Material", "PLANNING_SKU", 0.95);
        let ruleset = RuleSet {
            ruleset_id: "rs".to_string(),
            ruleset_name: "rs".to_string(),
            schemas: vec![],
            rules: vec![r],
            generated_from_kg: "kg".to_string(),
            created_at: Utc::now(),
        };
        let request = ExecutionRequest {
            ruleset_id: "rs".to_string(),
            source_db: DbConfig::from_url("sqlite::memory:"),
            target_db: DbConfig::from_url("sqlite::memory:"),
            limit: None,
            keep_staging: false,
            store_results: false,
            inactive_column: Some("status = 'x' OR 1=1 --".to_string()),
            inactive_value: Some("Inactive".to_string()),
            deadline: None,
        };
        assert!(plan_for(&ruleset, &request).is_err());
    }
}
