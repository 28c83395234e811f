use crate::decimal::Decimal;
use serde::Serialize;

/// Distributional metrics over one evaluation's computed averages.
///
/// Null averages are excluded from every metric and counted in
/// `excluded_count`. `std_dev` is the population standard deviation
/// (divide by N, not N-1). Median and quartiles interpolate linearly
/// between adjacent ranks at position `(n-1)*p`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub count: usize,
    pub excluded_count: usize,
    pub mean: Option<Decimal>,
    pub min: Option<Decimal>,
    pub max: Option<Decimal>,
    pub std_dev: Option<Decimal>,
    pub median: Option<Decimal>,
    pub q1: Option<Decimal>,
    pub q3: Option<Decimal>,
    pub pass_rate: Option<Decimal>,
}

impl Aggregate {
    fn empty(excluded_count: usize) -> Aggregate {
        Aggregate {
            count: 0,
            excluded_count,
            mean: None,
            min: None,
            max: None,
            std_dev: None,
            median: None,
            q1: None,
            q3: None,
            pass_rate: None,
        }
    }
}

/// Aggregates a set of averages. Never fails; the empty set yields
/// `count = 0` with every metric null.
pub fn aggregate(averages: &[Option<Decimal>], pass_threshold: Option<Decimal>) -> Aggregate {
    let mut included: Vec<Decimal> = averages.iter().filter_map(|a| *a).collect();
    let excluded_count = averages.len() - included.len();
    if included.is_empty() {
        return Aggregate::empty(excluded_count);
    }
    included.sort();

    let count = included.len();
    let mean = Decimal::weighted_mean(included.iter().map(|v| (*v, Decimal::ONE)))
        .unwrap_or(Decimal::ZERO);

    let std_dev = {
        let variance = Decimal::weighted_mean(
            included
                .iter()
                .map(|v| (v.sub(mean).mul(v.sub(mean)), Decimal::ONE)),
        )
        .unwrap_or(Decimal::ZERO);
        variance.sqrt()
    };

    let pass_rate = pass_threshold.map(|threshold| {
        let passed = included.iter().filter(|v| **v >= threshold).count();
        Decimal::from_int(passed as i64)
            .div(Decimal::from_int(count as i64))
            .unwrap_or(Decimal::ZERO)
    });

    Aggregate {
        count,
        excluded_count,
        mean: Some(mean),
        min: Some(included[0]),
        max: Some(included[count - 1]),
        std_dev: Some(std_dev),
        median: Some(percentile_lerp(&included, 1, 2)),
        q1: Some(percentile_lerp(&included, 1, 4)),
        q3: Some(percentile_lerp(&included, 3, 4)),
        pass_rate,
    }
}

/// Value at fractional position `(n-1) * num / den` of a sorted slice.
fn percentile_lerp(sorted: &[Decimal], num: usize, den: usize) -> Decimal {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = (n - 1) * num;
    let idx = pos / den;
    let rem = pos % den;
    if rem == 0 {
        sorted[idx]
    } else {
        Decimal::lerp(sorted[idx], sorted[idx + 1], rem as i64, den as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().expect("decimal")
    }

    fn some(values: &[&str]) -> Vec<Option<Decimal>> {
        values.iter().map(|v| Some(d(v))).collect()
    }

    #[test]
    fn empty_set_returns_nulls_without_error() {
        let agg = aggregate(&[], Some(d("10")));
        assert_eq!(agg.count, 0);
        assert_eq!(agg.excluded_count, 0);
        assert_eq!(agg.mean, None);
        assert_eq!(agg.median, None);
        assert_eq!(agg.pass_rate, None);

        let agg = aggregate(&[None, None], Some(d("10")));
        assert_eq!(agg.count, 0);
        assert_eq!(agg.excluded_count, 2);
        assert_eq!(agg.std_dev, None);
    }

    #[test]
    fn sample_cohort_mean_and_pass_rate() {
        // The four-student sample: [12, 13, 12.25, 13], threshold 10.
        let agg = aggregate(&some(&["12", "13", "12.25", "13"]), Some(d("10")));
        assert_eq!(agg.count, 4);
        assert_eq!(agg.mean, Some(d("12.5625")));
        assert_eq!(agg.min, Some(d("12")));
        assert_eq!(agg.max, Some(d("13")));
        assert_eq!(agg.pass_rate, Some(d("1")));
    }

    #[test]
    fn nulls_count_as_excluded_only() {
        let mut values = some(&["10", "14"]);
        values.push(None);
        let agg = aggregate(&values, Some(d("12")));
        assert_eq!(agg.count, 2);
        assert_eq!(agg.excluded_count, 1);
        assert_eq!(agg.mean, Some(d("12")));
        // 1 of 2 included passes; the null does not drag the rate down.
        assert_eq!(agg.pass_rate, Some(d("0.5")));
    }

    #[test]
    fn population_std_dev_known_value() {
        // [2, 4, 4, 4, 5, 5, 7, 9]: mean 5, population std dev exactly 2.
        let agg = aggregate(&some(&["2", "4", "4", "4", "5", "5", "7", "9"]), None);
        assert_eq!(agg.std_dev, Some(d("2")));
        assert_eq!(agg.pass_rate, None);
    }

    #[test]
    fn std_dev_of_identical_values_is_zero() {
        let agg = aggregate(&some(&["13", "13", "13"]), None);
        assert_eq!(agg.std_dev, Some(Decimal::ZERO));
    }

    #[test]
    fn median_even_count_interpolates() {
        let agg = aggregate(&some(&["4", "1", "3", "2"]), None);
        assert_eq!(agg.median, Some(d("2.5")));
    }

    #[test]
    fn median_odd_count_is_middle_value() {
        let agg = aggregate(&some(&["3", "1", "5", "2", "4"]), None);
        assert_eq!(agg.median, Some(d("3")));
        assert_eq!(agg.q1, Some(d("2")));
        assert_eq!(agg.q3, Some(d("4")));
    }

    #[test]
    fn quartiles_interpolate_between_ranks() {
        // Sorted [1, 2, 3, 4]: q1 at position 0.75 -> 1.75, q3 at 2.25 -> 3.25.
        let agg = aggregate(&some(&["1", "2", "3", "4"]), None);
        assert_eq!(agg.q1, Some(d("1.75")));
        assert_eq!(agg.q3, Some(d("3.25")));
    }

    #[test]
    fn single_value_collapses_all_positions() {
        let agg = aggregate(&some(&["14.5"]), Some(d("10")));
        assert_eq!(agg.median, Some(d("14.5")));
        assert_eq!(agg.q1, Some(d("14.5")));
        assert_eq!(agg.q3, Some(d("14.5")));
        assert_eq!(agg.std_dev, Some(Decimal::ZERO));
        assert_eq!(agg.pass_rate, Some(d("1")));
    }

    #[test]
    fn identical_input_yields_identical_output() {
        let values = some(&["11.3", "9.7", "15.25", "8"]);
        let a = serde_json::to_string(&aggregate(&values, Some(d("10")))).expect("json");
        let b = serde_json::to_string(&aggregate(&values, Some(d("10")))).expect("json");
        assert_eq!(a, b);
    }
}
