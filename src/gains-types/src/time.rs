use chrono::{DateTime, Datelike, Timelike, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::TradeError;

/// Number of whole calendar years between *from* and *to*.
///
/// The count only ticks over on (or after) the anniversary of *from*, so a
/// disposal exactly one year after an acquisition yields 1, one second
/// before the anniversary yields 0. A Feb 29 acquisition has its first
/// anniversary on Mar 1 of non-leap years.
pub fn year_delta(from: DateTime<Utc>, to: DateTime<Utc>) -> i32 {
    if to < from {
        return -year_delta(to, from);
    }
    let mut years = to.year() - from.year();
    let from_key = civil_key(from);
    if civil_key(to) < from_key {
        years -= 1;
    }
    years
}

fn civil_key(t: DateTime<Utc>) -> (u32, u32, u32, u32, u32, u32) {
    (
        t.month(),
        t.day(),
        t.hour(),
        t.minute(),
        t.second(),
        t.nanosecond(),
    )
}

/// Parse a timestamp string into a UTC instant.
///
/// An explicit UTC offset is mandatory; timestamps without one are rejected
/// instead of silently assuming a timezone.
pub fn parse_instant(input: &str) -> Result<DateTime<Utc>, TradeError> {
    let input = input.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(input) {
        return Ok(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f %z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(t) = DateTime::parse_from_str(input, fmt) {
            return Ok(t.with_timezone(&Utc));
        }
    }
    Err(TradeError::MissingTimezone(input.to_string()))
}

/// Format a monetary value with a fixed number of decimal places.
///
/// The absolute value is rounded down (toward zero) before the sign is
/// re-applied, so a reported value never overstates a gain or a balance.
pub fn format_amount(value: Decimal, places: u32) -> String {
    let rounded = value.round_dp_with_strategy(places, RoundingStrategy::ToZero);
    format!("{:.*}", places as usize, rounded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn year_delta_ticks_on_the_anniversary() {
        assert_eq!(year_delta(at(2017, 3, 10), at(2017, 12, 31)), 0);
        assert_eq!(year_delta(at(2017, 3, 10), at(2018, 3, 9)), 0);
        assert_eq!(year_delta(at(2017, 3, 10), at(2018, 3, 10)), 1);
        assert_eq!(year_delta(at(2017, 3, 10), at(2019, 3, 11)), 2);
    }

    #[test]
    fn year_delta_is_antisymmetric() {
        assert_eq!(year_delta(at(2018, 3, 10), at(2017, 3, 10)), -1);
        assert_eq!(year_delta(at(2018, 3, 10), at(2018, 1, 1)), 0);
    }

    #[test]
    fn year_delta_handles_leap_day_acquisitions() {
        // First anniversary of Feb 29 is Mar 1 in a non-leap year.
        assert_eq!(year_delta(at(2016, 2, 29), at(2017, 2, 28)), 0);
        assert_eq!(year_delta(at(2016, 2, 29), at(2017, 3, 1)), 1);
    }

    #[test]
    fn parse_instant_requires_an_offset() {
        let t = parse_instant("2017-06-01T10:00:00+02:00").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2017, 6, 1, 8, 0, 0).unwrap());
        let t = parse_instant("2017-06-01 10:00:00 +0000").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2017, 6, 1, 10, 0, 0).unwrap());
        assert!(parse_instant("2017-06-01 10:00:00").is_err());
    }

    #[test]
    fn format_amount_rounds_toward_zero() {
        assert_eq!(format_amount(Decimal::from_str("1.239").unwrap(), 2), "1.23");
        assert_eq!(format_amount(Decimal::from_str("-1.239").unwrap(), 2), "-1.23");
        assert_eq!(format_amount(Decimal::from_str("2").unwrap(), 2), "2.00");
    }
}
