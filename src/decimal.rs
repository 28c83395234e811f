use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Fractional digits carried by every [`Decimal`].
pub const SCALE: u32 = 6;
const UNIT: i64 = 1_000_000;

/// Fixed-point decimal used for every score, weight and statistic.
///
/// Values are scaled `i64` micro-points, so comparison is exact, summation
/// order cannot drift, and repeated runs on identical input produce
/// byte-identical output. All rounding is half away from zero at scale 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Decimal(i64);

impl Decimal {
    pub const ZERO: Decimal = Decimal(0);
    pub const ONE: Decimal = Decimal(UNIT);

    pub fn from_int(n: i64) -> Decimal {
        Decimal(n * UNIT)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn add(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 + rhs.0)
    }

    pub fn sub(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 - rhs.0)
    }

    pub fn mul(self, rhs: Decimal) -> Decimal {
        Decimal(div_round_half_away(
            self.0 as i128 * rhs.0 as i128,
            UNIT as i128,
        ) as i64)
    }

    /// Division; `None` when the divisor is zero.
    pub fn div(self, rhs: Decimal) -> Option<Decimal> {
        if rhs.0 == 0 {
            return None;
        }
        Some(Decimal(div_round_half_away(
            self.0 as i128 * UNIT as i128,
            rhs.0 as i128,
        ) as i64))
    }

    /// Rounds half away from zero to a multiple of `quantum` micro-points.
    pub fn quantize(self, quantum: i64) -> Decimal {
        Decimal((div_round_half_away(self.0 as i128, quantum as i128) * quantum as i128) as i64)
    }

    /// Rounds up to the next multiple of `quantum` micro-points.
    pub fn ceil_to(self, quantum: i64) -> Decimal {
        let q = quantum as i128;
        let n = self.0 as i128;
        let up = if n % q == 0 { n / q } else if n > 0 { n / q + 1 } else { n / q };
        Decimal((up * q) as i64)
    }

    /// Rounds down to the previous multiple of `quantum` micro-points.
    pub fn floor_to(self, quantum: i64) -> Decimal {
        let q = quantum as i128;
        let n = self.0 as i128;
        let down = if n % q == 0 { n / q } else if n > 0 { n / q } else { n / q - 1 };
        Decimal((down * q) as i64)
    }

    /// Truncating square root at scale 6. Negative input yields zero.
    pub fn sqrt(self) -> Decimal {
        if self.0 <= 0 {
            return Decimal::ZERO;
        }
        // sqrt(raw * UNIT) keeps the result at scale 6.
        Decimal(isqrt(self.0 as u128 * UNIT as u128) as i64)
    }

    /// Linear interpolation `a + (b - a) * num / den` with exact rational
    /// arithmetic, rounded half away from zero at scale 6.
    pub fn lerp(a: Decimal, b: Decimal, num: i64, den: i64) -> Decimal {
        debug_assert!(den > 0 && (0..=den).contains(&num));
        let delta = (b.0 as i128 - a.0 as i128) * num as i128;
        Decimal(a.0 + div_round_half_away(delta, den as i128) as i64)
    }

    /// Weighted arithmetic mean `sum(v_i * w_i) / sum(w_i)` with a single
    /// terminal rounding, so summation never accumulates drift.
    /// `None` when the weight sum is zero.
    pub fn weighted_mean<I>(pairs: I) -> Option<Decimal>
    where
        I: IntoIterator<Item = (Decimal, Decimal)>,
    {
        let mut num: i128 = 0;
        let mut den: i128 = 0;
        for (v, w) in pairs {
            num += v.0 as i128 * w.0 as i128;
            den += w.0 as i128;
        }
        if den <= 0 {
            return None;
        }
        Some(Decimal(div_round_half_away(num, den) as i64))
    }

    /// Conversion from a JSON number. Values are quantized to scale 6.
    pub fn from_f64(v: f64) -> Option<Decimal> {
        if !v.is_finite() {
            return None;
        }
        let scaled = v * UNIT as f64;
        if scaled.abs() > i64::MAX as f64 / 2.0 {
            return None;
        }
        Some(Decimal(scaled.round() as i64))
    }

    /// Fixed-width rendering with exactly `dp` fractional digits
    /// (rounded half away from zero first). `dp` is capped at scale 6.
    pub fn to_fixed_string(self, dp: u32) -> String {
        let dp = dp.min(SCALE);
        let quantum = 10_i64.pow(SCALE - dp);
        let rounded = self.quantize(quantum);
        let sign = if rounded.0 < 0 { "-" } else { "" };
        let abs = rounded.0.unsigned_abs();
        let whole = abs / UNIT as u64;
        if dp == 0 {
            return format!("{}{}", sign, whole);
        }
        let frac = (abs % UNIT as u64) / quantum as u64;
        format!("{}{}.{:0width$}", sign, whole, frac, width = dp as usize)
    }
}

fn div_round_half_away(n: i128, d: i128) -> i128 {
    debug_assert!(d > 0);
    let q = n / d;
    let r = n % d;
    if 2 * r.abs() >= d {
        if n >= 0 {
            q + 1
        } else {
            q - 1
        }
    } else {
        q
    }
}

fn isqrt(n: u128) -> u128 {
    if n < 2 {
        return n;
    }
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDecimalError;

impl fmt::Display for ParseDecimalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid decimal literal")
    }
}

impl std::error::Error for ParseDecimalError {}

impl FromStr for Decimal {
    type Err = ParseDecimalError;

    fn from_str(s: &str) -> Result<Decimal, ParseDecimalError> {
        let s = s.trim();
        let (neg, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        if body.is_empty() {
            return Err(ParseDecimalError);
        }
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(ParseDecimalError);
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ParseDecimalError);
        }

        let whole: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| ParseDecimalError)?
        };

        // Fractional digits beyond scale 6 are rounded half away from zero.
        let mut frac: i128 = 0;
        let mut digits = 0u32;
        let mut round_up = false;
        for (i, c) in frac_part.chars().enumerate() {
            let d = (c as u8 - b'0') as i128;
            if (i as u32) < SCALE {
                frac = frac * 10 + d;
                digits += 1;
            } else if i as u32 == SCALE {
                round_up = d >= 5;
            }
        }
        while digits < SCALE {
            frac *= 10;
            digits += 1;
        }
        if round_up {
            frac += 1;
        }

        let raw = whole * UNIT as i128 + frac;
        if raw > i64::MAX as i128 {
            return Err(ParseDecimalError);
        }
        let raw = raw as i64;
        Ok(Decimal(if neg { -raw } else { raw }))
    }
}

impl fmt::Display for Decimal {
    /// Canonical form: trailing fractional zeros trimmed, no exponent.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / UNIT as u64;
        let mut frac = abs % UNIT as u64;
        if frac == 0 {
            return write!(f, "{}{}", sign, whole);
        }
        let mut digits = SCALE;
        while frac % 10 == 0 {
            frac /= 10;
            digits -= 1;
        }
        write!(f, "{}{}.{:0width$}", sign, whole, frac, width = digits as usize)
    }
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Decimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
        struct DecimalVisitor;

        impl Visitor<'_> for DecimalVisitor {
            type Value = Decimal;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a decimal string or number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Decimal, E> {
                v.parse()
                    .map_err(|_| E::custom(format!("invalid decimal: {v}")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Decimal, E> {
                Ok(Decimal::from_int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Decimal, E> {
                i64::try_from(v)
                    .map(Decimal::from_int)
                    .map_err(|_| E::custom("decimal out of range"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Decimal, E> {
                Decimal::from_f64(v).ok_or_else(|| E::custom("decimal out of range"))
            }
        }

        deserializer.deserialize_any(DecimalVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        for s in ["0", "15", "12.25", "12.5625", "0.5", "19.999999"] {
            let d: Decimal = s.parse().expect("parse");
            assert_eq!(d.to_string(), s);
        }
    }

    #[test]
    fn parse_trims_excess_digits_half_away() {
        let d: Decimal = "1.23456749".parse().expect("parse");
        assert_eq!(d.to_string(), "1.234567");
        let d: Decimal = "1.2345675".parse().expect("parse");
        assert_eq!(d.to_string(), "1.234568");
    }

    #[test]
    fn parse_rejects_garbage() {
        for s in ["", "-", ".", "1.2.3", "12a", "1,5"] {
            assert!(s.parse::<Decimal>().is_err(), "accepted {:?}", s);
        }
    }

    #[test]
    fn division_rounds_half_away_from_zero() {
        let one = Decimal::from_int(1);
        let three = Decimal::from_int(3);
        assert_eq!(one.div(three).expect("div").to_string(), "0.333333");
        let two = Decimal::from_int(2);
        assert_eq!(two.div(three).expect("div").to_string(), "0.666667");
        assert_eq!(one.div(Decimal::ZERO), None);
    }

    #[test]
    fn quantize_half_away() {
        let d: Decimal = "3.55".parse().expect("parse");
        assert_eq!(d.quantize(100_000).to_string(), "3.6");
        let d: Decimal = "3.54".parse().expect("parse");
        assert_eq!(d.quantize(100_000).to_string(), "3.5");
        let d: Decimal = "12.25".parse().expect("parse");
        assert_eq!(d.quantize(500_000).to_string(), "12.5");
        assert_eq!(d.quantize(250_000).to_string(), "12.25");
    }

    #[test]
    fn ceil_floor_to_whole_points() {
        let d: Decimal = "12.01".parse().expect("parse");
        assert_eq!(d.ceil_to(UNIT).to_string(), "13");
        assert_eq!(d.floor_to(UNIT).to_string(), "12");
        let whole: Decimal = "14".parse().expect("parse");
        assert_eq!(whole.ceil_to(UNIT).to_string(), "14");
        assert_eq!(whole.floor_to(UNIT).to_string(), "14");
    }

    #[test]
    fn fixed_rendering_pads_decimals() {
        let d: Decimal = "15".parse().expect("parse");
        assert_eq!(d.to_fixed_string(2), "15.00");
        let d: Decimal = "12.5625".parse().expect("parse");
        assert_eq!(d.to_fixed_string(2), "12.56");
        assert_eq!(d.to_fixed_string(0), "13");
    }

    #[test]
    fn sqrt_matches_known_values() {
        assert_eq!(Decimal::from_int(4).sqrt(), Decimal::from_int(2));
        assert_eq!(Decimal::from_int(25).sqrt(), Decimal::from_int(5));
        // sqrt(2) truncated at six decimals.
        assert_eq!(Decimal::from_int(2).sqrt().to_string(), "1.414213");
    }
}
