//! Definition classifier
//!
//! Keyword/regex rules first; an optional single LLM call breaks ties when
//! the rules are ambiguous. Confidence is recorded on the classification.

use reconkg_llm::{CompletionRequest, LlmAdapter};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryType {
    Relationship,
    DataQuery,
    FilterQuery,
    ComparisonQuery,
    AggregationQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    NotIn,
    In,
    Equals,
    Contains,
    Aggregate,
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub query_type: QueryType,
    pub operation: Operation,
    pub confidence: f64,
    pub reasoning: String,
}

fn not_in_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(not\s+in|not\s+present\s+in|missing\s+from|except|but\s+not)\b")
            .expect("static regex")
    })
}

fn in_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(which\s+are\s+in|present\s+in|also\s+in|in\s+both|common\s+to)\b")
            .expect("static regex")
    })
}

fn aggregate_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(count|how\s+many|sum|total|average|avg|min|max)\b")
            .expect("static regex")
    })
}

fn filter_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(active|inactive|where|with\s+status|status\s+is|since|before|after)\b")
            .expect("static regex")
    })
}

fn relationship_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(related\s+to|relationship|connected\s+to|linked\s+to)\b")
            .expect("static regex")
    })
}

/// Rule-based classification; `None` when no rule fires decisively.
fn classify_by_rules(definition: &str) -> Option<Classification> {
    if not_in_pattern().is_match(definition) {
        return Some(Classification {
            query_type: QueryType::ComparisonQuery,
            operation: Operation::NotIn,
            confidence: 0.9,
            reasoning: "set-difference phrasing".to_string(),
        });
    }
    if in_pattern().is_match(definition) {
        return Some(Classification {
            query_type: QueryType::ComparisonQuery,
            operation: Operation::In,
            confidence: 0.85,
            reasoning: "set-intersection phrasing".to_string(),
        });
    }
    if aggregate_pattern().is_match(definition) {
        return Some(Classification {
            query_type: QueryType::AggregationQuery,
            operation: Operation::Aggregate,
            confidence: 0.85,
            reasoning: "aggregation keyword".to_string(),
        });
    }
    if relationship_pattern().is_match(definition) {
        return Some(Classification {
            query_type: QueryType::Relationship,
            operation: Operation::None,
            confidence: 0.8,
            reasoning: "relationship phrasing".to_string(),
        });
    }
    if filter_pattern().is_match(definition) {
        return Some(Classification {
            query_type: QueryType::FilterQuery,
            operation: Operation::Equals,
            confidence: 0.75,
            reasoning: "filter qualifier".to_string(),
        });
    }
    None
}

#[derive(Debug, Deserialize)]
struct LlmClassification {
    query_type: String,
    operation: String,
    #[serde(default)]
    confidence: Option<f64>,
}

fn parse_query_type(s: &str) -> Option<QueryType> {
    match s.to_ascii_uppercase().as_str() {
        "RELATIONSHIP" => Some(QueryType::Relationship),
        "DATA_QUERY" => Some(QueryType::DataQuery),
        "FILTER_QUERY" => Some(QueryType::FilterQuery),
        "COMPARISON_QUERY" => Some(QueryType::ComparisonQuery),
        "AGGREGATION_QUERY" => Some(QueryType::AggregationQuery),
        _ => None,
    }
}

fn parse_operation(s: &str) -> Option<Operation> {
    match s.to_ascii_uppercase().as_str() {
        "NOT_IN" => Some(Operation::NotIn),
        "IN" => Some(Operation::In),
        "EQUALS" => Some(Operation::Equals),
        "CONTAINS" => Some(Operation::Contains),
        "AGGREGATE" => Some(Operation::Aggregate),
        "NONE" => Some(Operation::None),
        _ => None,
    }
}

/// Classify a definition. Rules win when they fire; otherwise one LLM call
/// disambiguates (when available), and the final fallback is DATA_QUERY.
pub async fn classify(
    definition: &str,
    llm: Option<&LlmAdapter>,
    deadline: Duration,
) -> Classification {
    if let Some(classification) = classify_by_rules(definition) {
        return classification;
    }

    if let Some(llm) = llm {
        let prompt = format!(
            "Classify this data question:\n\n{definition}\n\n\
             Respond with JSON: {{\"query_type\": \"RELATIONSHIP|DATA_QUERY|\
             FILTER_QUERY|COMPARISON_QUERY|AGGREGATION_QUERY\", \
             \"operation\": \"NOT_IN|IN|EQUALS|CONTAINS|AGGREGATE|NONE\", \
             \"confidence\": 0.0}}"
        );
        let result: Result<LlmClassification, _> = llm
            .complete_json(CompletionRequest::json(prompt), deadline)
            .await;
        if let Ok(llm_class) = result {
            if let (Some(query_type), Some(operation)) = (
                parse_query_type(&llm_class.query_type),
                parse_operation(&llm_class.operation),
            ) {
                return Classification {
                    query_type,
                    operation,
                    confidence: llm_class.confidence.unwrap_or(0.7).clamp(0.0, 1.0),
                    reasoning: "LLM disambiguation".to_string(),
                };
            }
        }
        debug!(definition, "LLM classification failed, falling back to DATA_QUERY");
    }

    Classification {
        query_type: QueryType::DataQuery,
        operation: Operation::None,
        confidence: 0.5,
        reasoning: "no rule matched".to_string(),
    }
}
