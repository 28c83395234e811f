pub mod average;
pub mod filter;
pub mod policy;
pub mod ranking;
pub mod stats;

pub use policy::{AbsentPolicy, RoundingPolicy};

use crate::decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

/// Fatal computation failure. Per-entry and per-student problems are
/// reported on the affected records instead; only a malformed evaluation
/// context aborts the whole run.
#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// Non-fatal condition attached to one student's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub code: String,
    pub message: String,
}

impl Warning {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Evaluation-level inputs the engine needs besides the score rows.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub evaluation_id: String,
    pub max_score: Decimal,
    pub policy: AbsentPolicy,
    pub rounding: RoundingPolicy,
}

/// One raw score entry, weight already resolved to the subject coefficient.
#[derive(Debug, Clone)]
pub struct ScoreRow {
    pub student_id: String,
    pub subject_id: String,
    pub value: Option<Decimal>,
    pub is_absent: bool,
    pub is_active: bool,
    pub weight: Decimal,
}

/// A student's fully computed outcome for one evaluation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentResult {
    pub student_id: String,
    pub average: Option<Decimal>,
    pub computed_from: usize,
    pub pending: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
    pub rank: Option<i64>,
    pub percentile: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub students: Vec<StudentResult>,
    pub invalid: Vec<filter::InvalidEntry>,
    pub stats: stats::Aggregate,
}

/// Runs the whole engine for one evaluation: filter, two-pass averages,
/// ranking, aggregate statistics. Pure; callers persist the outcome.
pub fn compute_evaluation(
    rows: &[ScoreRow],
    ctx: &EvaluationContext,
    manual_overrides: &BTreeMap<String, Decimal>,
    pass_threshold: Option<Decimal>,
) -> Result<EvaluationResult, CalcError> {
    if ctx.evaluation_id.is_empty() {
        return Err(CalcError::new("bad_evaluation", "missing evaluation id"));
    }
    if ctx.max_score <= Decimal::ZERO {
        return Err(CalcError::new(
            "bad_evaluation",
            "evaluation max score must be positive",
        ));
    }

    let partition = filter::partition(rows, ctx.max_score);
    let averages = average::compute_averages(&partition, ctx, manual_overrides);

    let ranked = ranking::rank(
        &averages
            .iter()
            .map(|a| (a.student_id.clone(), a.average))
            .collect::<Vec<_>>(),
    );

    let aggregate = stats::aggregate(
        &averages.iter().map(|a| a.average).collect::<Vec<_>>(),
        pass_threshold,
    );

    let mut by_student: BTreeMap<&str, &average::StudentAverage> = BTreeMap::new();
    for a in &averages {
        by_student.insert(a.student_id.as_str(), a);
    }

    let students = ranked
        .into_iter()
        .map(|r| {
            let a = by_student
                .get(r.student_id.as_str())
                .expect("ranked student missing from averages");
            StudentResult {
                student_id: r.student_id,
                average: r.average,
                computed_from: a.computed_from,
                pending: a.pending,
                warnings: a.warnings.clone(),
                rank: r.rank,
                percentile: r.percentile,
            }
        })
        .collect();

    Ok(EvaluationResult {
        students,
        invalid: partition.invalid,
        stats: aggregate,
    })
}
