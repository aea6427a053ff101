//! Parser for the canonical trades CSV format.
//!
//! One row per trade:
//! `kind, time, buy_currency, buy_amount, sell_currency, sell_amount,
//! fee_currency, fee_amount, exchange, mark, comment`.
//! Amount fields may be empty, times must carry a UTC offset. Exchange
//! exports in other layouts are expected to be converted into this format
//! up front.

use std::path::PathBuf;
use std::str::FromStr;

use gains_types::{parse_instant, CurrencyCode, Trade, TradeKind, TradeSource};
use rust_decimal::Decimal;

pub struct CsvTradeParser {
    path: PathBuf,
    /// Number of leading rows (headers) to skip.
    skip_rows: usize,
}

impl CsvTradeParser {
    pub fn new(path: &str, skip_rows: usize) -> Self {
        CsvTradeParser {
            path: PathBuf::from(path),
            skip_rows,
        }
    }
}

impl TradeSource for CsvTradeParser {
    fn parse(&self) -> Result<Vec<Trade>, Box<dyn std::error::Error>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)?;

        let mut trades = Vec::new();
        for (row_number, record) in reader.records().enumerate() {
            let record = record?;
            if row_number < self.skip_rows {
                continue;
            }
            if record.iter().all(str::is_empty) {
                continue;
            }
            let trade = parse_record(&record)
                .map_err(|err| format!("{}, row {}: {}", self.path.display(), row_number + 1, err))?;
            trades.push(trade);
        }
        Ok(trades)
    }
}

fn parse_record(record: &csv::StringRecord) -> Result<Trade, String> {
    if record.len() < 8 {
        return Err(format!(
            "row is too short, expected at least 8 columns, got {}",
            record.len()
        ));
    }
    let field = |index: usize| record.get(index).unwrap_or("").trim();

    let kind = TradeKind::from_str(field(0))
        .map_err(|()| "unreachable: trade kind parsing is total".to_string())?;
    let time = parse_instant(field(1)).map_err(|err| err.to_string())?;
    let trade = Trade::new(
        kind,
        time,
        CurrencyCode::new(field(2)),
        parse_amount(field(3), "buy_amount")?,
        CurrencyCode::new(field(4)),
        parse_amount(field(5), "sell_amount")?,
        CurrencyCode::new(field(6)),
        parse_amount(field(7), "fee_amount")?,
        field(8).to_string(),
        field(9).to_string(),
        field(10).to_string(),
    )
    .map_err(|err| err.to_string())?;
    Ok(trade)
}

fn parse_amount(value: &str, name: &str) -> Result<Decimal, String> {
    if value.is_empty() {
        return Ok(Decimal::ZERO);
    }
    value
        .parse()
        .map_err(|err| format!("could not parse {} from '{}': {}", name, value, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(fields: &[&str]) -> csv::StringRecord {
        csv::StringRecord::from(fields.to_vec())
    }

    #[test]
    fn full_row_is_parsed() {
        let trade = parse_record(&record(&[
            "Trade",
            "2017-06-01T10:00:00+02:00",
            "XMR",
            "20",
            "BTC",
            "0.5",
            "BTC",
            "0.001",
            "Poloniex",
            "x",
            "note",
        ]))
        .unwrap();
        assert_eq!(*trade.kind(), TradeKind::Sale);
        assert_eq!(
            trade.time(),
            Utc.with_ymd_and_hms(2017, 6, 1, 8, 0, 0).unwrap()
        );
        assert_eq!(trade.buy(), (&CurrencyCode::new("XMR"), Decimal::from(20)));
        assert_eq!(trade.exchange(), "Poloniex");
        assert_eq!(trade.comment(), "note");
    }

    #[test]
    fn empty_amounts_parse_as_zero() {
        let trade = parse_record(&record(&[
            "Withdrawal",
            "2017-06-01T10:00:00Z",
            "",
            "",
            "BTC",
            "1",
            "",
            "",
            "Wallet",
        ]))
        .unwrap();
        assert_eq!(trade.buy().1, Decimal::ZERO);
        assert_eq!(trade.fee().1, Decimal::ZERO);
        assert!(trade.is_withdrawal_shaped());
    }

    #[test]
    fn negative_buy_amount_swaps_sides() {
        let trade = parse_record(&record(&[
            "Trade",
            "2017-06-01T10:00:00Z",
            "BTC",
            "-1",
            "EUR",
            "3000",
            "",
            "",
            "Kraken",
        ]))
        .unwrap();
        assert_eq!(trade.buy(), (&CurrencyCode::new("EUR"), Decimal::from(3000)));
        assert_eq!(trade.sell(), (&CurrencyCode::new("BTC"), Decimal::from(1)));
    }

    #[test]
    fn timestamp_without_offset_is_rejected() {
        let result = parse_record(&record(&[
            "Trade",
            "2017-06-01 10:00:00",
            "BTC",
            "1",
            "EUR",
            "3000",
            "",
            "",
            "Kraken",
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn short_rows_are_rejected() {
        assert!(parse_record(&record(&["Trade", "2017-06-01T10:00:00Z"])).is_err());
    }

    #[test]
    fn file_rows_are_read_in_order() {
        let path = std::env::temp_dir().join("fifo_gains_trades_test.csv");
        std::fs::write(
            &path,
            "kind, time, buy_currency, buy_amount, sell_currency, sell_amount, \
             fee_currency, fee_amount, exchange, mark, comment\n\
             Buy, 2017-01-01T10:00:00Z, BTC, 1, EUR, 1000, , , Kraken, , \n\
             Trade, 2017-01-02T10:00:00Z, EUR, 1500, BTC, 1, , , Kraken, , \n",
        )
        .unwrap();
        let parser = CsvTradeParser::new(path.to_str().unwrap(), 1);
        let trades = parser.parse().unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].sell(), (&CurrencyCode::new("EUR"), Decimal::from(1000)));
        assert_eq!(trades[1].buy(), (&CurrencyCode::new("EUR"), Decimal::from(1500)));
    }
}
