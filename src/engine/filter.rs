use crate::decimal::Decimal;
use crate::engine::ScoreRow;
use serde::Serialize;

/// Why an entry was rejected by the validity filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    MissingValue,
    OutOfRange,
}

/// A data-entry error: reported to the caller, never silently coerced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidEntry {
    pub student_id: String,
    pub subject_id: String,
    pub value: Option<Decimal>,
    pub reason: InvalidReason,
}

#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub usable: Vec<ScoreRow>,
    pub absent: Vec<ScoreRow>,
    pub invalid: Vec<InvalidEntry>,
}

/// Classifies one evaluation's entries. Inactive entries are dropped
/// before classification (soft delete); absence wins over value checks.
pub fn partition(rows: &[ScoreRow], max_score: Decimal) -> Partition {
    let mut out = Partition::default();
    for row in rows {
        if !row.is_active {
            continue;
        }
        if row.is_absent {
            out.absent.push(row.clone());
            continue;
        }
        match row.value {
            None => out.invalid.push(InvalidEntry {
                student_id: row.student_id.clone(),
                subject_id: row.subject_id.clone(),
                value: None,
                reason: InvalidReason::MissingValue,
            }),
            Some(v) if v < Decimal::ZERO || v > max_score => out.invalid.push(InvalidEntry {
                student_id: row.student_id.clone(),
                subject_id: row.subject_id.clone(),
                value: Some(v),
                reason: InvalidReason::OutOfRange,
            }),
            Some(_) => out.usable.push(row.clone()),
        }
    }
    out
}
