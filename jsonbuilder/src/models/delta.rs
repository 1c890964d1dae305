//! Calendar offsets parsed from compact tokens such as `3m`, `1y6m` or `o/n`.
//!
//! Months and years are applied as calendar arithmetic (the day is clamped to
//! the end of a shorter month), weeks and days as plain day counts.

use chrono::{Days, Months, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

use crate::error::{ExprError, ExprResult};

/// Alternating alphabetic and numeric runs; anything else is skipped.
static DELTA_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z]+|[-+]?[0-9]*\.?[0-9]+").expect("valid delta regex"));

/// A calendar offset with separate year/month/week/day components.
#[derive(Debug, Clone, Copy, Default)]
pub struct Delta {
    pub years: i64,
    pub months: i64,
    pub weeks: i64,
    pub days: i64,
}

impl Delta {
    pub fn new(years: i64, months: i64, weeks: i64, days: i64) -> Self {
        Self {
            years,
            months,
            weeks,
            days,
        }
    }

    pub fn days(days: i64) -> Self {
        Self::new(0, 0, 0, days)
    }

    pub fn months(months: i64) -> Self {
        Self::new(0, months, 0, 0)
    }

    /// Parse a delta token.
    ///
    /// `o/n`/`on` is one day and `t/n`/`tn` two days. Otherwise the token is a
    /// sequence of `(number, unit)` pairs with units `d`, `w`, `m`, `y`; a unit
    /// may repeat and its totals add up. Fractional numbers are truncated.
    /// Matching is case-insensitive. An empty token is a zero offset.
    pub fn parse(token: &str) -> ExprResult<Self> {
        let lower = token.to_lowercase();

        match lower.trim() {
            "o/n" | "on" => return Ok(Self::days(1)),
            "t/n" | "tn" => return Ok(Self::days(2)),
            _ => {}
        }

        let invalid = || ExprError::InvalidDeltaString(token.to_string());
        let mut delta = Self::default();
        let mut parts = DELTA_TOKEN.find_iter(&lower).map(|m| m.as_str());

        while let Some(number) = parts.next() {
            let value = if number.contains('.') {
                let value = number.parse::<f64>().map_err(|_| invalid())?.trunc();
                if !(i64::MIN as f64..i64::MAX as f64).contains(&value) {
                    return Err(invalid());
                }
                value as i64
            } else {
                number.parse::<i64>().map_err(|_| invalid())?
            };
            let unit = parts.next().ok_or_else(invalid)?;
            let slot = match unit {
                "d" => &mut delta.days,
                "w" => &mut delta.weeks,
                "m" => &mut delta.months,
                "y" => &mut delta.years,
                _ => return Err(invalid()),
            };
            *slot = slot.checked_add(value).ok_or_else(invalid)?;
        }

        // the folded totals must be representable too
        delta.total_months().map_err(|_| invalid())?;
        delta.total_days().map_err(|_| invalid())?;
        Ok(delta)
    }

    /// Years and months folded into months.
    pub fn total_months(&self) -> ExprResult<i64> {
        self.years
            .checked_mul(12)
            .and_then(|months| months.checked_add(self.months))
            .ok_or_else(|| overflow(self))
    }

    /// Weeks and days folded into days.
    pub fn total_days(&self) -> ExprResult<i64> {
        self.weeks
            .checked_mul(7)
            .and_then(|days| days.checked_add(self.days))
            .ok_or_else(|| overflow(self))
    }

    /// Totals widened so they never overflow; used for comparisons.
    fn wide_totals(&self) -> (i128, i128) {
        (
            i128::from(self.years) * 12 + i128::from(self.months),
            i128::from(self.weeks) * 7 + i128::from(self.days),
        )
    }

    pub fn is_zero(&self) -> bool {
        self.wide_totals() == (0, 0)
    }

    pub fn negate(self) -> ExprResult<Self> {
        self.map_parts(|part| part.checked_neg())
    }

    pub fn scale(self, factor: i64) -> ExprResult<Self> {
        self.map_parts(|part| part.checked_mul(factor))
    }

    pub fn plus(self, other: Self) -> ExprResult<Self> {
        let sum = Self::new(
            self.years.checked_add(other.years).ok_or_else(|| overflow(&self))?,
            self.months.checked_add(other.months).ok_or_else(|| overflow(&self))?,
            self.weeks.checked_add(other.weeks).ok_or_else(|| overflow(&self))?,
            self.days.checked_add(other.days).ok_or_else(|| overflow(&self))?,
        );
        Ok(sum)
    }

    /// Apply `f` to every component, failing on the first overflow.
    fn map_parts(self, f: impl Fn(i64) -> Option<i64>) -> ExprResult<Self> {
        let part = |value: i64| f(value).ok_or_else(|| overflow(&self));
        Ok(Self::new(
            part(self.years)?,
            part(self.months)?,
            part(self.weeks)?,
            part(self.days)?,
        ))
    }

    /// Shift `date` by this offset: months first, then days.
    pub fn apply(&self, date: NaiveDate) -> ExprResult<NaiveDate> {
        let out_of_range = || ExprError::Arithmetic(format!("{} + {} is out of range", date, self));

        let months = self.total_months()?;
        let count = u32::try_from(months.unsigned_abs()).map_err(|_| out_of_range())?;
        let shifted = if months >= 0 {
            date.checked_add_months(Months::new(count))
        } else {
            date.checked_sub_months(Months::new(count))
        };
        let shifted = shifted.ok_or_else(out_of_range)?;

        let days = self.total_days()?;
        let count = Days::new(days.unsigned_abs());
        let shifted = if days >= 0 {
            shifted.checked_add_days(count)
        } else {
            shifted.checked_sub_days(count)
        };
        shifted.ok_or_else(out_of_range)
    }
}

fn overflow(delta: &Delta) -> ExprError {
    ExprError::Arithmetic(format!("delta {} overflows", delta))
}

impl PartialEq for Delta {
    fn eq(&self, other: &Self) -> bool {
        self.wide_totals() == other.wide_totals()
    }
}

impl FromStr for Delta {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Delta {
    /// Compact token form, re-parsable by [`Delta::parse`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.years == 0 && self.months == 0 && self.weeks == 0 && self.days == 0 {
            return write!(f, "0d");
        }
        for (value, unit) in [
            (self.years, 'y'),
            (self.months, 'm'),
            (self.weeks, 'w'),
            (self.days, 'd'),
        ] {
            if value != 0 {
                write!(f, "{}{}", value, unit)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_single_unit() {
        let d = Delta::parse("3m").unwrap();
        assert_eq!(d.months, 3);
        assert_eq!(d.years, 0);
        assert_eq!(d.total_days().unwrap(), 0);
    }

    #[test]
    fn test_mixed_units() {
        let d = Delta::parse("1y6m").unwrap();
        assert_eq!(d.years, 1);
        assert_eq!(d.months, 6);
        assert_eq!(d.total_months().unwrap(), 18);
    }

    #[test]
    fn test_overnight_tokens() {
        assert_eq!(Delta::parse("o/n").unwrap(), Delta::days(1));
        assert_eq!(Delta::parse("ON").unwrap(), Delta::days(1));
        assert_eq!(Delta::parse("t/n").unwrap(), Delta::days(2));
        assert_eq!(Delta::parse("TN").unwrap(), Delta::days(2));
    }

    #[test]
    fn test_repeated_unit_accumulates() {
        let d = Delta::parse("1m2m").unwrap();
        assert_eq!(d.months, 3);
        let d = Delta::parse("2W-3d").unwrap();
        assert_eq!(d.weeks, 2);
        assert_eq!(d.days, -3);
        assert_eq!(d.total_days().unwrap(), 11);
    }

    #[test]
    fn test_fraction_truncates() {
        assert_eq!(Delta::parse("1.5y").unwrap().years, 1);
    }

    #[test]
    fn test_malformed() {
        for bad in ["abc", "3", "3x", "m3", "1y6"] {
            let err = Delta::parse(bad).unwrap_err();
            assert!(matches!(err, ExprError::InvalidDeltaString(_)), "{bad}");
        }
    }

    #[test]
    fn test_empty_is_zero() {
        assert!(Delta::parse("").unwrap().is_zero());
    }

    #[test]
    fn test_apply_clamps_month_end() {
        let d = Delta::parse("1m").unwrap();
        assert_eq!(d.apply(ymd(2020, 1, 31)).unwrap(), ymd(2020, 2, 29));
        let d = Delta::parse("1y").unwrap();
        assert_eq!(d.apply(ymd(2020, 2, 29)).unwrap(), ymd(2021, 2, 28));
    }

    #[test]
    fn test_apply_negative_and_days() {
        let d = Delta::parse("-1m1w").unwrap();
        assert_eq!(d.apply(ymd(2020, 3, 15)).unwrap(), ymd(2020, 2, 22));
    }

    #[test]
    fn test_display_round_trips() {
        let d = Delta::parse("1y6m2w3d").unwrap();
        assert_eq!(d.to_string(), "1y6m2w3d");
        assert_eq!(d.to_string().parse::<Delta>().unwrap(), d);
        assert_eq!(Delta::default().to_string(), "0d");
    }

    #[test]
    fn test_equality_normalizes() {
        assert_eq!(Delta::parse("1w").unwrap(), Delta::parse("7d").unwrap());
        assert_eq!(Delta::parse("12m").unwrap(), Delta::parse("1y").unwrap());
    }

    #[test]
    fn test_overflowing_tokens_rejected() {
        for bad in [
            "999999999999999999y",
            "99999999999999999999d",
            "9223372036854775807w",
            "9223372036854775807d1d",
        ] {
            let err = Delta::parse(bad).unwrap_err();
            assert!(matches!(err, ExprError::InvalidDeltaString(_)), "{bad}");
        }
        assert_eq!(
            Delta::parse("768614336404564650y").unwrap().total_months().unwrap(),
            768614336404564650 * 12
        );
    }

    #[test]
    fn test_checked_arithmetic() {
        let year = Delta::parse("1y").unwrap();
        let huge = year.scale(1_000_000_000_000_000_000).unwrap();
        assert!(matches!(huge.total_months(), Err(ExprError::Arithmetic(_))));
        assert!(matches!(huge.apply(ymd(2024, 1, 1)), Err(ExprError::Arithmetic(_))));
        assert!(matches!(year.scale(i64::MAX).unwrap().scale(2), Err(ExprError::Arithmetic(_))));

        let min = Delta::days(i64::MIN);
        assert!(matches!(min.negate(), Err(ExprError::Arithmetic(_))));
        assert!(matches!(min.plus(Delta::days(-1)), Err(ExprError::Arithmetic(_))));
        assert_eq!(Delta::days(3).plus(Delta::days(-3)).unwrap(), Delta::default());
        assert_eq!(Delta::months(2).negate().unwrap(), Delta::months(-2));
    }

    #[test]
    fn test_equality_does_not_overflow() {
        let wide = Delta::new(i64::MAX, 0, 0, 0);
        assert_ne!(wide, Delta::default());
        assert!(!wide.is_zero());
    }
}
