//! Append-only ledger of bag-draining events and its report views.

use std::borrow::Cow;

use chrono::{DateTime, NaiveTime, Utc};
use gains_types::{format_amount, LedgerLineData, PaymentReport};
use itertools::Itertools;
use once_cell::unsync::OnceCell;

/// Append-only record of every disposal and fee payment.
///
/// The raw rows are never mutated; `consolidated` offers a condensed view
/// for reporting that combines the slices of payments spanning several bags.
#[derive(Debug, Default)]
pub struct PaymentLedger {
    rows: Vec<PaymentReport>,
    /// Cache of the consolidated view, built once reporting starts.
    consolidated: OnceCell<Vec<PaymentReport>>,
}

impl PaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<PaymentReport>) -> Self {
        PaymentLedger {
            rows,
            consolidated: OnceCell::new(),
        }
    }

    pub fn push(&mut self, row: PaymentReport) {
        self.consolidated.take();
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[PaymentReport] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Condensed view of the ledger: consecutive rows that only differ in
    /// the numeric slice amounts (a payment drained across several bags on
    /// the same day) are combined by summing those amounts. Times are
    /// floored to day precision.
    pub fn consolidated(&self) -> &[PaymentReport] {
        self.consolidated.get_or_init(|| {
            let grouped = self.rows.iter().chunk_by(|row| {
                (
                    row.kind,
                    row.exchange.clone(),
                    row.currency.clone(),
                    row.cost_currency.clone(),
                    row.short_term,
                    row.buy_currency.clone(),
                    row.fee_ratio,
                    row.ex_rate,
                    row.buy_ratio,
                    floor_day(row.bag_time),
                    floor_day(row.sell_time),
                )
            });

            let mut combined = Vec::new();
            for (_, mut chunk) in &grouped {
                let first = chunk.next().expect("chunks are never empty");
                let mut row = PaymentReport {
                    bag_time: floor_day(first.bag_time),
                    sell_time: floor_day(first.sell_time),
                    ..first.clone()
                };
                for next in chunk {
                    row.to_pay += next.to_pay;
                    row.bag_amount_before += next.bag_amount_before;
                    row.bag_spent += next.bag_spent;
                    row.spent_cost += next.spent_cost;
                    row.proceeds += next.proceeds;
                    row.profit += next.profit;
                }
                combined.push(row);
            }
            combined
        })
    }
}

/// Provide the CSV line contract for a ledger row.
pub fn output_line(report: &PaymentReport) -> impl LedgerLineData {
    struct CsvLine {
        kind: String,
        amount_spent: String,
        currency: String,
        purchase_date: String,
        sell_date: String,
        exchange: String,
        short_term: String,
        cost: String,
        proceeds: String,
        profit: String,
    }

    impl LedgerLineData for CsvLine {
        fn kind(&self) -> Cow<str> {
            Cow::Borrowed(&self.kind)
        }

        fn amount_spent(&self) -> Cow<str> {
            Cow::Borrowed(&self.amount_spent)
        }

        fn currency(&self) -> Cow<str> {
            Cow::Borrowed(&self.currency)
        }

        fn purchase_date(&self) -> Cow<str> {
            Cow::Borrowed(&self.purchase_date)
        }

        fn sell_date(&self) -> Cow<str> {
            Cow::Borrowed(&self.sell_date)
        }

        fn exchange(&self) -> Cow<str> {
            Cow::Borrowed(&self.exchange)
        }

        fn short_term(&self) -> Cow<str> {
            Cow::Borrowed(&self.short_term)
        }

        fn cost(&self) -> Cow<str> {
            Cow::Borrowed(&self.cost)
        }

        fn proceeds(&self) -> Cow<str> {
            Cow::Borrowed(&self.proceeds)
        }

        fn profit(&self) -> Cow<str> {
            Cow::Borrowed(&self.profit)
        }
    }

    CsvLine {
        kind: report.kind.to_string(),
        amount_spent: format_amount(report.bag_spent, 8),
        currency: report.currency.to_string(),
        purchase_date: report.bag_time.format("%Y-%m-%d %H:%M:%S").to_string(),
        sell_date: report.sell_time.format("%Y-%m-%d %H:%M:%S").to_string(),
        exchange: report.exchange.clone(),
        short_term: report.short_term.to_string(),
        cost: format_amount(report.spent_cost, 2),
        proceeds: format_amount(report.proceeds, 2),
        profit: format_amount(report.profit, 2),
    }
}

fn floor_day(time: DateTime<Utc>) -> DateTime<Utc> {
    time.date_naive().and_time(NaiveTime::MIN).and_utc()
}
