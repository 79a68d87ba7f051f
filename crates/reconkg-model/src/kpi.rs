//! KPI definitions, execution records, and threshold buckets
//!
//! The four reconciliation KPIs:
//!
//! - **RCR** — Reconciliation Coverage Rate: `matched / total_source * 100`
//! - **DQCS** — Data Quality Confidence Score: average match confidence
//! - **REI** — Reconciliation Efficiency Index:
//!   `success_rate * rule_utilization * speed_factor / 10_000`
//! - **IRR** — Inactive Records Rate: `inactive_source / total_source * 100`
//!
//! Threshold buckets are bit-exact contracts used by dashboards; do not
//! adjust them without a data migration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Definitions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiDefinition {
    pub id: i64,
    /// Unique across active KPIs.
    pub name: String,
    #[serde(default)]
    pub alias_name: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub nl_definition: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
    /// Soft delete.
    pub is_active: bool,
    /// Operator has accepted the generated SQL.
    pub is_accept: bool,
    /// When true, `cached_sql` must be present and is used verbatim.
    pub is_sql_cached: bool,
    #[serde(default)]
    pub cached_sql: Option<String>,
}

impl KpiDefinition {
    /// `is_sql_cached = true` implies a cached statement exists.
    pub fn cache_is_consistent(&self) -> bool {
        !self.is_sql_cached || self.cached_sql.is_some()
    }
}

/// Implicit evidence category of a KPI, derived from its name/alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KpiKind {
    MatchRate,
    UnmatchedSourceCount,
    UnmatchedTargetCount,
    InactiveRecordCount,
    DataQualityScore,
}

impl KpiKind {
    /// Match-status filter applied by the evidence endpoint.
    pub fn evidence_filter(self) -> Option<&'static str> {
        match self {
            Self::MatchRate => None,
            Self::UnmatchedSourceCount => Some("unmatched_source"),
            Self::UnmatchedTargetCount => Some("unmatched_target"),
            Self::InactiveRecordCount => Some("inactive"),
            Self::DataQualityScore => Some("matched"),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        if upper.contains("MATCH_RATE") || upper.contains("MATCH RATE") {
            Some(Self::MatchRate)
        } else if upper.contains("UNMATCHED_SOURCE") {
            Some(Self::UnmatchedSourceCount)
        } else if upper.contains("UNMATCHED_TARGET") {
            Some(Self::UnmatchedTargetCount)
        } else if upper.contains("INACTIVE") {
            Some(Self::InactiveRecordCount)
        } else if upper.contains("QUALITY") {
            Some(Self::DataQualityScore)
        } else {
            None
        }
    }
}

// ============================================================================
// Executions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters the execution was launched with; persisted alongside the row
/// so the run is reproducible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExecutionParams {
    #[serde(default)]
    pub kg_name: Option<String>,
    #[serde(default)]
    pub select_schema: Option<String>,
    #[serde(default)]
    pub ruleset_name: Option<String>,
    #[serde(default)]
    pub db_type: Option<String>,
    #[serde(default)]
    pub limit_records: Option<i64>,
    #[serde(default)]
    pub use_llm: bool,
    #[serde(default)]
    pub excluded_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiExecution {
    pub id: i64,
    pub kpi_id: i64,
    pub params: ExecutionParams,
    /// Persisted on every outcome, including failure.
    #[serde(default)]
    pub generated_sql: Option<String>,
    #[serde(default)]
    pub enhanced_sql: Option<String>,
    #[serde(default)]
    pub number_of_records: Option<i64>,
    #[serde(default)]
    pub joined_columns: Vec<String>,
    #[serde(default)]
    pub sql_query_type: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    pub execution_status: ExecutionStatus,
    pub execution_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub execution_time_ms: Option<i64>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Bounded summary of the result rows, pagination-ready.
    #[serde(default)]
    pub result_data: Option<serde_json::Value>,
    #[serde(default)]
    pub source_table: Option<String>,
    #[serde(default)]
    pub target_table: Option<String>,
}

impl KpiExecution {
    /// Outcome-field contracts from the data model.
    pub fn is_consistent(&self) -> bool {
        match self.execution_status {
            ExecutionStatus::Success => {
                self.generated_sql.is_some() && self.number_of_records.map_or(false, |n| n >= 0)
            }
            ExecutionStatus::Failed => {
                self.generated_sql.is_some() && self.error_message.is_some()
            }
            _ => true,
        }
    }
}

// ============================================================================
// KPI values and status buckets
// ============================================================================

/// The four aggregate KPI values of a reconciliation run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct KpiValues {
    pub rcr: f64,
    pub dqcs: f64,
    pub rei: f64,
    pub irr: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssessmentStatus {
    #[serde(rename = "HEALTHY")]
    Healthy,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "CRITICAL")]
    Critical,
    #[serde(rename = "GOOD")]
    Good,
    #[serde(rename = "FAIR")]
    Fair,
    #[serde(rename = "POOR")]
    Poor,
    #[serde(rename = "ACCEPTABLE")]
    Acceptable,
    #[serde(rename = "NEEDS IMPROVEMENT")]
    NeedsImprovement,
    #[serde(rename = "EXCELLENT")]
    Excellent,
}

impl fmt::Display for AssessmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "HEALTHY",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Good => "GOOD",
            Self::Fair => "FAIR",
            Self::Poor => "POOR",
            Self::Acceptable => "ACCEPTABLE",
            Self::NeedsImprovement => "NEEDS IMPROVEMENT",
            Self::Excellent => "EXCELLENT",
        };
        f.write_str(s)
    }
}

/// RCR: >=90 HEALTHY; 80..90 WARNING; <80 CRITICAL.
pub fn rcr_status(rcr: f64) -> AssessmentStatus {
    if rcr >= 90.0 {
        AssessmentStatus::Healthy
    } else if rcr >= 80.0 {
        AssessmentStatus::Warning
    } else {
        AssessmentStatus::Critical
    }
}

/// DQCS: >=0.80 GOOD; 0.60..0.80 FAIR; <0.60 POOR.
pub fn dqcs_status(dqcs: f64) -> AssessmentStatus {
    if dqcs >= 0.80 {
        AssessmentStatus::Good
    } else if dqcs >= 0.60 {
        AssessmentStatus::Fair
    } else {
        AssessmentStatus::Poor
    }
}

/// REI: >=40 ACCEPTABLE; <40 NEEDS IMPROVEMENT.
pub fn rei_status(rei: f64) -> AssessmentStatus {
    if rei >= 40.0 {
        AssessmentStatus::Acceptable
    } else {
        AssessmentStatus::NeedsImprovement
    }
}

/// IRR: 0..=5 EXCELLENT; ..=10 GOOD; ..=20 WARNING; >20 CRITICAL.
pub fn irr_status(irr: f64) -> AssessmentStatus {
    if irr <= 5.0 {
        AssessmentStatus::Excellent
    } else if irr <= 10.0 {
        AssessmentStatus::Good
    } else if irr <= 20.0 {
        AssessmentStatus::Warning
    } else {
        AssessmentStatus::Critical
    }
}

impl KpiValues {
    pub fn statuses(
        &self,
    ) -> (
        AssessmentStatus,
        AssessmentStatus,
        AssessmentStatus,
        AssessmentStatus,
    ) {
        (
            rcr_status(self.rcr),
            dqcs_status(self.dqcs),
            rei_status(self.rei),
            irr_status(self.irr),
        )
    }
}

/// REI per the executor's formula: `success_rate * rule_utilization *
/// speed_factor / 10_000`, with `success_rate = rcr / 100`,
/// `rule_utilization` the fraction of rules that produced at least one
/// match, and `speed_factor = 1 + 1/execution_seconds`.
pub fn compute_rei(rcr: f64, rule_utilization: f64, execution_seconds: f64) -> f64 {
    let success_rate = rcr / 100.0;
    let speed_factor = 1.0 + 1.0 / execution_seconds.max(f64::EPSILON);
    success_rate * rule_utilization * speed_factor / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rcr_buckets_are_bit_exact() {
        assert_eq!(rcr_status(95.0), AssessmentStatus::Healthy);
        assert_eq!(rcr_status(90.0), AssessmentStatus::Healthy);
        assert_eq!(rcr_status(89.99), AssessmentStatus::Warning);
        assert_eq!(rcr_status(80.0), AssessmentStatus::Warning);
        assert_eq!(rcr_status(79.99), AssessmentStatus::Critical);
    }

    #[test]
    fn dqcs_buckets_are_bit_exact() {
        assert_eq!(dqcs_status(0.875), AssessmentStatus::Good);
        assert_eq!(dqcs_status(0.80), AssessmentStatus::Good);
        assert_eq!(dqcs_status(0.79), AssessmentStatus::Fair);
        assert_eq!(dqcs_status(0.60), AssessmentStatus::Fair);
        assert_eq!(dqcs_status(0.59), AssessmentStatus::Poor);
    }

    #[test]
    fn rei_and_irr_buckets() {
        assert_eq!(rei_status(40.0), AssessmentStatus::Acceptable);
        assert_eq!(rei_status(39.9), AssessmentStatus::NeedsImprovement);
        assert_eq!(irr_status(3.0), AssessmentStatus::Excellent);
        assert_eq!(irr_status(5.0), AssessmentStatus::Excellent);
        assert_eq!(irr_status(7.5), AssessmentStatus::Good);
        assert_eq!(irr_status(15.0), AssessmentStatus::Warning);
        assert_eq!(irr_status(20.01), AssessmentStatus::Critical);
    }

    #[test]
    fn needs_improvement_serializes_with_space() {
        let json = serde_json::to_string(&AssessmentStatus::NeedsImprovement).unwrap();
        assert_eq!(json, "\"NEEDS IMPROVEMENT\"");
    }

    #[test]
    fn failed_execution_requires_error_and_sql() {
        let exec = KpiExecution {
            id: 1,
            kpi_id: 1,
            params: ExecutionParams::default(),
            generated_sql: Some("SELECT 1".to_string()),
            enhanced_sql: None,
            number_of_records: None,
            joined_columns: vec![],
            sql_query_type: None,
            operation: None,
            execution_status: ExecutionStatus::Failed,
            execution_timestamp: Utc::now(),
            execution_time_ms: None,
            confidence_score: None,
            error_message: Some("boom".to_string()),
            result_data: None,
            source_table: None,
            target_table: None,
        };
        assert!(exec.is_consistent());

        let mut missing = exec;
        missing.error_message = None;
        assert!(!missing.is_consistent());
    }

    #[test]
    fn kpi_kind_from_name() {
        assert_eq!(KpiKind::from_name("gpu_match_rate"), Some(KpiKind::MatchRate));
        assert_eq!(
            KpiKind::from_name("UNMATCHED_SOURCE_COUNT"),
            Some(KpiKind::UnmatchedSourceCount)
        );
        assert_eq!(KpiKind::from_name("random"), None);
    }
}
