//! Historical exchange rates for one currency pair, resampled to a fixed
//! interval.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use gains_types::{CurrencyCode, CurrencyPair, RateError, RateSource};
use rust_decimal::Decimal;

/// Time-indexed prices for a single directed pair.
///
/// Samples are keyed by the start of their sampling interval. A price
/// request inside a gap is served by the previous non-empty interval
/// (forward-fill); a request before the first or after the last interval
/// has no answer.
#[derive(Debug)]
pub struct RateSeries {
    pair: CurrencyPair,
    interval: Duration,
    samples: BTreeMap<DateTime<Utc>, Decimal>,
}

impl RateSeries {
    /// Create an empty series. Only use this if you want to fill the data
    /// manually with `insert_sample`, otherwise use `from_weighted_rows` or
    /// `from_csv_file`.
    pub fn new(pair: CurrencyPair, interval: Duration) -> Self {
        RateSeries {
            pair,
            interval: std::cmp::max(interval, Duration::seconds(1)),
            samples: BTreeMap::new(),
        }
    }

    /// Insert a price valid for the interval containing *time*.
    pub fn insert_sample(&mut self, time: DateTime<Utc>, price: Decimal) {
        let key = self.floor(time);
        self.samples.insert(key, price);
    }

    /// Build a series from raw `(time, price, volume)` rows by computing the
    /// volume-weighted average price per interval. Intervals without volume
    /// stay empty and are forward-filled on lookup.
    pub fn from_weighted_rows(
        pair: CurrencyPair,
        interval: Duration,
        rows: &[(DateTime<Utc>, Decimal, Decimal)],
    ) -> Self {
        let mut series = RateSeries::new(pair, interval);
        let mut grouped: BTreeMap<DateTime<Utc>, (Decimal, Decimal)> = BTreeMap::new();
        for (time, price, volume) in rows {
            let entry = grouped
                .entry(series.floor(*time))
                .or_insert((Decimal::ZERO, Decimal::ZERO));
            entry.0 += *price * *volume;
            entry.1 += *volume;
        }
        for (key, (price_times_volume, volume)) in grouped {
            if volume > Decimal::ZERO {
                series.samples.insert(key, price_times_volume / volume);
            }
        }
        series
    }

    /// Load a series from a csv file of `unix_time, price, volume` rows,
    /// such as the trade dumps offered by bitcoincharts.com.
    ///
    /// The unit must be a string given in the form
    /// 'currency_one/currency_two', e.g. 'EUR/BTC', pricing one unit of the
    /// second currency in the first.
    pub fn from_csv_file(
        path: &Path,
        unit: &str,
        interval: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let pair = parse_unit(unit)?;
        let mut rows = Vec::new();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_path(path)?;
        for record in reader.records() {
            let record = record?;
            let timestamp: i64 = record
                .get(0)
                .unwrap_or_default()
                .parse()
                .map_err(|e| format!("bad timestamp in {}: {}", path.display(), e))?;
            let time = DateTime::from_timestamp(timestamp, 0)
                .ok_or_else(|| format!("timestamp out of range in {}", path.display()))?;
            let price: Decimal = record
                .get(1)
                .unwrap_or_default()
                .parse()
                .map_err(|e| format!("bad price in {}: {}", path.display(), e))?;
            let volume: Decimal = record
                .get(2)
                .unwrap_or_default()
                .parse()
                .map_err(|e| format!("bad volume in {}: {}", path.display(), e))?;
            rows.push((time, price, volume));
        }
        Ok(Self::from_weighted_rows(pair, interval, &rows))
    }

    fn floor(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.interval.num_seconds();
        let floored = time.timestamp() - time.timestamp().rem_euclid(secs);
        DateTime::from_timestamp(floored, 0).expect("flooring keeps the timestamp in range")
    }
}

impl RateSource for RateSeries {
    fn pair(&self) -> &CurrencyPair {
        &self.pair
    }

    fn get_price(&self, time: DateTime<Utc>) -> Result<Decimal, RateError> {
        let no_rate = || RateError::NoRate {
            pair: self.pair.clone(),
            time,
        };
        let floored = self.floor(time);
        let last = self.samples.keys().next_back().ok_or_else(no_rate)?;
        if floored > *last {
            return Err(no_rate());
        }
        self.samples
            .range(..=floored)
            .next_back()
            .map(|(_, price)| *price)
            .ok_or_else(no_rate)
    }
}

/// Split a 'EUR/BTC'-style unit into the directed pair it prices (BTC→EUR).
fn parse_unit(unit: &str) -> Result<CurrencyPair, String> {
    match unit.split_once('/') {
        Some((quote, base)) if !quote.trim().is_empty() && !base.trim().is_empty() => Ok(
            CurrencyPair::new(CurrencyCode::new(base), CurrencyCode::new(quote)),
        ),
        _ => Err(format!(
            "Please supply the currency exchange rate unit in the correct form, \
             e.g. \"EUR/BTC\", got '{}'",
            unit
        )),
    }
}
