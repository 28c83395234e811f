use crate::decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How an absent student's missing scores contribute to their average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsentPolicy {
    ExcludeFromRanking,
    ZeroScore,
    ClassAverage,
    ManualDecision,
    ProportionalBonus,
}

impl AbsentPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            AbsentPolicy::ExcludeFromRanking => "exclude_from_ranking",
            AbsentPolicy::ZeroScore => "zero_score",
            AbsentPolicy::ClassAverage => "class_average",
            AbsentPolicy::ManualDecision => "manual_decision",
            AbsentPolicy::ProportionalBonus => "proportional_bonus",
        }
    }

    pub fn parse(s: &str) -> Option<AbsentPolicy> {
        match s {
            "exclude_from_ranking" => Some(AbsentPolicy::ExcludeFromRanking),
            "zero_score" => Some(AbsentPolicy::ZeroScore),
            "class_average" => Some(AbsentPolicy::ClassAverage),
            "manual_decision" => Some(AbsentPolicy::ManualDecision),
            "proportional_bonus" => Some(AbsentPolicy::ProportionalBonus),
            _ => None,
        }
    }
}

impl Default for AbsentPolicy {
    fn default() -> Self {
        AbsentPolicy::ExcludeFromRanking
    }
}

/// Final rounding applied to a computed average, strictly as the last step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingPolicy {
    None,
    NearestHalf,
    NearestQuarter,
    NearestInteger,
    OneDecimal,
    TwoDecimals,
    Ceil,
    Floor,
}

const POINT: i64 = 1_000_000;

impl RoundingPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundingPolicy::None => "none",
            RoundingPolicy::NearestHalf => "nearest_half",
            RoundingPolicy::NearestQuarter => "nearest_quarter",
            RoundingPolicy::NearestInteger => "nearest_integer",
            RoundingPolicy::OneDecimal => "one_decimal",
            RoundingPolicy::TwoDecimals => "two_decimals",
            RoundingPolicy::Ceil => "ceil",
            RoundingPolicy::Floor => "floor",
        }
    }

    pub fn parse(s: &str) -> Option<RoundingPolicy> {
        match s {
            "none" => Some(RoundingPolicy::None),
            "nearest_half" => Some(RoundingPolicy::NearestHalf),
            "nearest_quarter" => Some(RoundingPolicy::NearestQuarter),
            "nearest_integer" => Some(RoundingPolicy::NearestInteger),
            "one_decimal" => Some(RoundingPolicy::OneDecimal),
            "two_decimals" => Some(RoundingPolicy::TwoDecimals),
            "ceil" => Some(RoundingPolicy::Ceil),
            "floor" => Some(RoundingPolicy::Floor),
            _ => None,
        }
    }

    /// Rounds `value` per this policy. Nearest-style policies round half
    /// away from zero at the policy's quantum.
    pub fn apply(self, value: Decimal) -> Decimal {
        match self {
            RoundingPolicy::None => value,
            RoundingPolicy::NearestHalf => value.quantize(POINT / 2),
            RoundingPolicy::NearestQuarter => value.quantize(POINT / 4),
            RoundingPolicy::NearestInteger => value.quantize(POINT),
            RoundingPolicy::OneDecimal => value.quantize(POINT / 10),
            RoundingPolicy::TwoDecimals => value.quantize(POINT / 100),
            RoundingPolicy::Ceil => value.ceil_to(POINT),
            RoundingPolicy::Floor => value.floor_to(POINT),
        }
    }

    /// Report rendering for an already-rounded value. Fixed-decimal
    /// policies always show their full width (`15` -> `"15.00"`).
    pub fn render(self, value: Decimal) -> String {
        match self {
            RoundingPolicy::OneDecimal => value.to_fixed_string(1),
            RoundingPolicy::TwoDecimals => value.to_fixed_string(2),
            RoundingPolicy::NearestInteger | RoundingPolicy::Ceil | RoundingPolicy::Floor => {
                value.to_fixed_string(0)
            }
            _ => value.to_string(),
        }
    }
}

impl Default for RoundingPolicy {
    fn default() -> Self {
        RoundingPolicy::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().expect("decimal")
    }

    #[test]
    fn every_policy_round_trips_through_its_name() {
        for p in [
            AbsentPolicy::ExcludeFromRanking,
            AbsentPolicy::ZeroScore,
            AbsentPolicy::ClassAverage,
            AbsentPolicy::ManualDecision,
            AbsentPolicy::ProportionalBonus,
        ] {
            assert_eq!(AbsentPolicy::parse(p.as_str()), Some(p));
        }
        for r in [
            RoundingPolicy::None,
            RoundingPolicy::NearestHalf,
            RoundingPolicy::NearestQuarter,
            RoundingPolicy::NearestInteger,
            RoundingPolicy::OneDecimal,
            RoundingPolicy::TwoDecimals,
            RoundingPolicy::Ceil,
            RoundingPolicy::Floor,
        ] {
            assert_eq!(RoundingPolicy::parse(r.as_str()), Some(r));
        }
    }

    #[test]
    fn rounding_applies_at_the_policy_quantum() {
        let v = d("13.13");
        assert_eq!(RoundingPolicy::None.apply(v), v);
        assert_eq!(RoundingPolicy::NearestHalf.apply(v), d("13"));
        assert_eq!(RoundingPolicy::NearestQuarter.apply(v), d("13.25"));
        assert_eq!(RoundingPolicy::NearestInteger.apply(v), d("13"));
        assert_eq!(RoundingPolicy::OneDecimal.apply(v), d("13.1"));
        assert_eq!(RoundingPolicy::TwoDecimals.apply(v), d("13.13"));
        assert_eq!(RoundingPolicy::Ceil.apply(v), d("14"));
        assert_eq!(RoundingPolicy::Floor.apply(v), d("13"));
    }

    #[test]
    fn render_pads_fixed_decimal_policies() {
        assert_eq!(RoundingPolicy::TwoDecimals.render(d("15")), "15.00");
        assert_eq!(RoundingPolicy::OneDecimal.render(d("15")), "15.0");
        assert_eq!(RoundingPolicy::NearestHalf.render(d("12.5")), "12.5");
        assert_eq!(RoundingPolicy::None.render(d("12.5625")), "12.5625");
    }
}
