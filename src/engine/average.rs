use crate::decimal::Decimal;
use crate::engine::filter::Partition;
use crate::engine::{AbsentPolicy, EvaluationContext, ScoreRow, Warning};
use std::collections::BTreeMap;

/// Phase-1 outcome for one student, before ranking.
#[derive(Debug, Clone)]
pub struct StudentAverage {
    pub student_id: String,
    pub average: Option<Decimal>,
    pub computed_from: usize,
    pub pending: bool,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Default)]
struct StudentEntries {
    usable: Vec<ScoreRow>,
    absent: Vec<ScoreRow>,
}

enum Phase1 {
    Resolved(StudentAverage),
    NeedsClassAverage(StudentAverage),
}

fn division_by_zero_warning(message: &str) -> Warning {
    Warning::new("division_by_zero_weight", message)
}

/// Computes every student's average for one evaluation.
///
/// Two-phase resolution: phase 1 settles every average that does not
/// depend on the class mean; phase 2 substitutes the mean of the
/// finalized phase-1 averages into `class_average` placeholders. Students
/// are processed in ascending id order and each student's entries are
/// summed in ascending subject order, so identical input always produces
/// identical output.
pub fn compute_averages(
    partition: &Partition,
    ctx: &EvaluationContext,
    manual_overrides: &BTreeMap<String, Decimal>,
) -> Vec<StudentAverage> {
    let mut grouped: BTreeMap<String, StudentEntries> = BTreeMap::new();
    for row in &partition.usable {
        grouped
            .entry(row.student_id.clone())
            .or_default()
            .usable
            .push(row.clone());
    }
    for row in &partition.absent {
        grouped
            .entry(row.student_id.clone())
            .or_default()
            .absent
            .push(row.clone());
    }
    // Students with only invalid entries still appear, with no average.
    for inv in &partition.invalid {
        grouped.entry(inv.student_id.clone()).or_default();
    }

    let mut resolved: Vec<StudentAverage> = Vec::new();
    let mut placeholders: Vec<StudentAverage> = Vec::new();

    for (student_id, mut entries) in grouped {
        entries.usable.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        entries.absent.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        match phase1(student_id, &entries, ctx, manual_overrides) {
            Phase1::Resolved(avg) => resolved.push(avg),
            Phase1::NeedsClassAverage(avg) => placeholders.push(avg),
        }
    }

    if !placeholders.is_empty() {
        let peer_mean = Decimal::weighted_mean(
            resolved
                .iter()
                .filter_map(|s| s.average)
                .map(|a| (a, Decimal::ONE)),
        );
        for mut p in placeholders {
            match peer_mean {
                Some(mean) => p.average = Some(ctx.rounding.apply(mean)),
                None => p.warnings.push(division_by_zero_warning(
                    "no peer averages available to substitute",
                )),
            }
            resolved.push(p);
        }
        resolved.sort_by(|a, b| a.student_id.cmp(&b.student_id));
    }

    resolved
}

fn phase1(
    student_id: String,
    entries: &StudentEntries,
    ctx: &EvaluationContext,
    manual_overrides: &BTreeMap<String, Decimal>,
) -> Phase1 {
    let computed_from = entries.usable.len();
    let mut warnings: Vec<Warning> = Vec::new();
    let mut pending = false;

    let has_usable = !entries.usable.is_empty();
    let has_absent = !entries.absent.is_empty();

    let average = match ctx.policy {
        // Only invalid entries; reported per entry by the filter.
        _ if !has_usable && !has_absent => None,
        AbsentPolicy::ZeroScore => {
            // Absent entries contribute zero at their subject weight.
            let pairs = entries
                .usable
                .iter()
                .map(|r| (r.value.unwrap_or(Decimal::ZERO), r.weight))
                .chain(entries.absent.iter().map(|r| (Decimal::ZERO, r.weight)));
            let mean = Decimal::weighted_mean(pairs);
            if mean.is_none() {
                warnings.push(division_by_zero_warning("all entry weights are zero"));
            }
            mean
        }
        AbsentPolicy::ProportionalBonus => proportional_bonus(entries, ctx, &mut warnings),
        _ if has_usable => {
            let mean = Decimal::weighted_mean(
                entries
                    .usable
                    .iter()
                    .map(|r| (r.value.unwrap_or(Decimal::ZERO), r.weight)),
            );
            if mean.is_none() {
                warnings.push(division_by_zero_warning("all entry weights are zero"));
            }
            mean
        }
        // All entries absent from here on.
        AbsentPolicy::ExcludeFromRanking => None,
        AbsentPolicy::ClassAverage => {
            return Phase1::NeedsClassAverage(StudentAverage {
                student_id,
                average: None,
                computed_from,
                pending: false,
                warnings,
            });
        }
        AbsentPolicy::ManualDecision => match manual_overrides.get(&student_id) {
            Some(v) if *v >= Decimal::ZERO && *v <= ctx.max_score => Some(*v),
            Some(v) => {
                pending = true;
                warnings.push(Warning::new(
                    "invalid_score_value",
                    format!("manual override {v} outside [0, {}]", ctx.max_score),
                ));
                None
            }
            None => {
                pending = true;
                warnings.push(Warning::new(
                    "manual_decision_pending",
                    "absent student awaits a manual decision",
                ));
                None
            }
        },
    };

    Phase1::Resolved(StudentAverage {
        student_id,
        average: average.map(|a| ctx.rounding.apply(a)),
        computed_from,
        pending,
        warnings,
    })
}

/// Usable weighted mean scaled by totalWeight/usableWeight, capped at the
/// evaluation's max score.
fn proportional_bonus(
    entries: &StudentEntries,
    ctx: &EvaluationContext,
    warnings: &mut Vec<Warning>,
) -> Option<Decimal> {
    let usable_weight = entries
        .usable
        .iter()
        .fold(Decimal::ZERO, |acc, r| acc.add(r.weight));

    if usable_weight.is_zero() {
        warnings.push(division_by_zero_warning(
            "no usable entries to extrapolate from",
        ));
        return None;
    }

    let mean = Decimal::weighted_mean(
        entries
            .usable
            .iter()
            .map(|r| (r.value.unwrap_or(Decimal::ZERO), r.weight)),
    )?;
    if entries.absent.is_empty() {
        return Some(mean);
    }

    let total_weight = entries
        .absent
        .iter()
        .fold(usable_weight, |acc, r| acc.add(r.weight));
    let scaled = mean.mul(total_weight).div(usable_weight)?;
    Some(scaled.min(ctx.max_score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::filter;
    use crate::engine::RoundingPolicy;

    fn d(s: &str) -> Decimal {
        s.parse().expect("decimal")
    }

    fn ctx(policy: AbsentPolicy, rounding: RoundingPolicy) -> EvaluationContext {
        EvaluationContext {
            evaluation_id: "eval-1".to_string(),
            max_score: d("20"),
            policy,
            rounding,
        }
    }

    fn row(student: &str, subject: &str, value: Option<&str>, absent: bool, weight: &str) -> ScoreRow {
        ScoreRow {
            student_id: student.to_string(),
            subject_id: subject.to_string(),
            value: value.map(d),
            is_absent: absent,
            is_active: true,
            weight: d(weight),
        }
    }

    fn run(
        rows: &[ScoreRow],
        policy: AbsentPolicy,
        rounding: RoundingPolicy,
        overrides: &BTreeMap<String, Decimal>,
    ) -> Vec<StudentAverage> {
        let ctx = ctx(policy, rounding);
        let partition = filter::partition(rows, ctx.max_score);
        compute_averages(&partition, &ctx, overrides)
    }

    #[test]
    fn unweighted_mean_of_two_scores() {
        let rows = vec![
            row("s1", "math", Some("14"), false, "1"),
            row("s1", "hist", Some("16"), false, "1"),
        ];
        let out = run(&rows, AbsentPolicy::ExcludeFromRanking, RoundingPolicy::TwoDecimals, &BTreeMap::new());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].average, Some(d("15")));
        assert_eq!(out[0].computed_from, 2);
    }

    #[test]
    fn subject_coefficients_weight_the_mean() {
        let rows = vec![
            row("s1", "math", Some("12"), false, "2"),
            row("s1", "hist", Some("18"), false, "1"),
        ];
        let out = run(&rows, AbsentPolicy::ExcludeFromRanking, RoundingPolicy::None, &BTreeMap::new());
        // (12*2 + 18*1) / 3 = 14
        assert_eq!(out[0].average, Some(d("14")));
    }

    #[test]
    fn exclude_policy_leaves_fully_absent_student_without_average() {
        let rows = vec![row("s1", "math", None, true, "1")];
        let out = run(&rows, AbsentPolicy::ExcludeFromRanking, RoundingPolicy::None, &BTreeMap::new());
        assert_eq!(out[0].average, None);
        assert!(!out[0].pending);
        assert!(out[0].warnings.is_empty());
    }

    #[test]
    fn zero_score_policy_forces_zero_for_fully_absent_student() {
        let rows = vec![row("s1", "math", None, true, "1")];
        let out = run(&rows, AbsentPolicy::ZeroScore, RoundingPolicy::None, &BTreeMap::new());
        assert_eq!(out[0].average, Some(Decimal::ZERO));
    }

    #[test]
    fn zero_score_policy_counts_absences_as_zeros_in_mixed_sets() {
        let rows = vec![
            row("s1", "math", Some("10"), false, "1"),
            row("s1", "hist", None, true, "1"),
        ];
        let out = run(&rows, AbsentPolicy::ZeroScore, RoundingPolicy::None, &BTreeMap::new());
        assert_eq!(out[0].average, Some(d("5")));
        assert_eq!(out[0].computed_from, 1);
    }

    #[test]
    fn class_average_substitutes_peer_mean_in_second_pass() {
        let rows = vec![
            row("s1", "math", Some("10"), false, "1"),
            row("s2", "math", Some("20"), false, "1"),
            row("s3", "math", None, true, "1"),
        ];
        let out = run(&rows, AbsentPolicy::ClassAverage, RoundingPolicy::None, &BTreeMap::new());
        let s3 = out.iter().find(|s| s.student_id == "s3").expect("s3");
        assert_eq!(s3.average, Some(d("15")));
        assert_eq!(s3.computed_from, 0);
    }

    #[test]
    fn class_average_without_peers_yields_null_and_warning() {
        let rows = vec![row("s1", "math", None, true, "1")];
        let out = run(&rows, AbsentPolicy::ClassAverage, RoundingPolicy::None, &BTreeMap::new());
        assert_eq!(out[0].average, None);
        assert_eq!(out[0].warnings[0].code, "division_by_zero_weight");
    }

    #[test]
    fn manual_decision_is_pending_until_overridden() {
        let rows = vec![row("s1", "math", None, true, "1")];
        let out = run(&rows, AbsentPolicy::ManualDecision, RoundingPolicy::None, &BTreeMap::new());
        assert_eq!(out[0].average, None);
        assert!(out[0].pending);
        assert_eq!(out[0].warnings[0].code, "manual_decision_pending");

        let mut overrides = BTreeMap::new();
        overrides.insert("s1".to_string(), d("11.5"));
        let out = run(&rows, AbsentPolicy::ManualDecision, RoundingPolicy::None, &overrides);
        assert_eq!(out[0].average, Some(d("11.5")));
        assert!(!out[0].pending);
    }

    #[test]
    fn proportional_bonus_extrapolates_and_clamps() {
        // 8/20 over half the weight extrapolates to 16.
        let rows = vec![
            row("s1", "math", Some("8"), false, "1"),
            row("s1", "hist", None, true, "1"),
        ];
        let out = run(&rows, AbsentPolicy::ProportionalBonus, RoundingPolicy::None, &BTreeMap::new());
        assert_eq!(out[0].average, Some(d("16")));

        // 12/20 would extrapolate to 24; capped at the max score.
        let rows = vec![
            row("s1", "math", Some("12"), false, "1"),
            row("s1", "hist", None, true, "1"),
        ];
        let out = run(&rows, AbsentPolicy::ProportionalBonus, RoundingPolicy::None, &BTreeMap::new());
        assert_eq!(out[0].average, Some(d("20")));
    }

    #[test]
    fn proportional_bonus_with_no_usable_entries_warns_not_panics() {
        let rows = vec![row("s1", "math", None, true, "1")];
        let out = run(&rows, AbsentPolicy::ProportionalBonus, RoundingPolicy::None, &BTreeMap::new());
        assert_eq!(out[0].average, None);
        assert_eq!(out[0].warnings[0].code, "division_by_zero_weight");
    }

    #[test]
    fn zero_weights_surface_warning_instead_of_crashing() {
        let rows = vec![row("s1", "math", Some("14"), false, "0")];
        let out = run(&rows, AbsentPolicy::ExcludeFromRanking, RoundingPolicy::None, &BTreeMap::new());
        assert_eq!(out[0].average, None);
        assert_eq!(out[0].warnings[0].code, "division_by_zero_weight");
    }

    #[test]
    fn rounding_is_applied_last() {
        let rows = vec![
            row("s1", "math", Some("12.3"), false, "1"),
            row("s1", "hist", Some("12.4"), false, "1"),
        ];
        // Exact mean 12.35; nearest_half rounds to 12.5.
        let out = run(&rows, AbsentPolicy::ExcludeFromRanking, RoundingPolicy::NearestHalf, &BTreeMap::new());
        assert_eq!(out[0].average, Some(d("12.5")));
    }

    #[test]
    fn student_with_only_invalid_entries_keeps_null_average() {
        let rows = vec![row("s1", "math", None, false, "1")];
        let out = run(&rows, AbsentPolicy::ZeroScore, RoundingPolicy::None, &BTreeMap::new());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].average, None);
        assert_eq!(out[0].computed_from, 0);
    }

    #[test]
    fn identical_input_yields_identical_output() {
        let rows = vec![
            row("s2", "b", Some("11"), false, "1"),
            row("s1", "a", Some("13"), false, "2"),
            row("s1", "b", Some("9.5"), false, "1"),
        ];
        let a = run(&rows, AbsentPolicy::ExcludeFromRanking, RoundingPolicy::None, &BTreeMap::new());
        let b = run(&rows, AbsentPolicy::ExcludeFromRanking, RoundingPolicy::None, &BTreeMap::new());
        let fmt = |v: &[StudentAverage]| {
            v.iter()
                .map(|s| format!("{}={:?}", s.student_id, s.average.map(|a| a.to_string())))
                .collect::<Vec<_>>()
                .join(";")
        };
        assert_eq!(fmt(&a), fmt(&b));
    }
}
