use crate::decimal::Decimal;
use serde::Serialize;

/// One student's position within the evaluation cohort. Students with no
/// average keep a placeholder row (null rank/percentile) so reports can
/// still show them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedStudent {
    pub student_id: String,
    pub average: Option<Decimal>,
    pub rank: Option<i64>,
    pub percentile: Option<Decimal>,
}

const HUNDRED: i64 = 100;

/// Competition ranking ("1,2,2,4") over exact decimal averages.
///
/// Rank is `1 + count(strictly greater)`; percentile is
/// `100 * count(strictly lower) / ranked`, clamped to [0, 100]. A cohort
/// of one ranked student is defined as percentile 100. Output is ordered
/// by rank then student id, placeholder rows last by student id, so the
/// result is invariant under input shuffling.
pub fn rank(students: &[(String, Option<Decimal>)]) -> Vec<RankedStudent> {
    let ranked_averages: Vec<Decimal> = students.iter().filter_map(|(_, a)| *a).collect();
    let total_ranked = ranked_averages.len() as i64;

    let mut out: Vec<RankedStudent> = students
        .iter()
        .map(|(student_id, average)| {
            let (rank, percentile) = match average {
                Some(avg) => {
                    let greater = ranked_averages.iter().filter(|a| **a > *avg).count() as i64;
                    let lower = ranked_averages.iter().filter(|a| **a < *avg).count() as i64;
                    let pct = if total_ranked == 1 {
                        Decimal::from_int(HUNDRED)
                    } else {
                        Decimal::from_int(HUNDRED * lower)
                            .div(Decimal::from_int(total_ranked))
                            .unwrap_or(Decimal::ZERO)
                            .clamp(Decimal::ZERO, Decimal::from_int(HUNDRED))
                    };
                    (Some(1 + greater), Some(pct))
                }
                None => (None, None),
            };
            RankedStudent {
                student_id: student_id.clone(),
                average: *average,
                rank,
                percentile,
            }
        })
        .collect();

    out.sort_by(|a, b| match (a.rank, b.rank) {
        (Some(ra), Some(rb)) => ra.cmp(&rb).then_with(|| a.student_id.cmp(&b.student_id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.student_id.cmp(&b.student_id),
    });
    out
}
