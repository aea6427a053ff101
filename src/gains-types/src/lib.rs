
mod core;
mod csv;
mod parser;
mod rate;
mod report;
mod time;

pub use core::{CurrencyCode, Trade, TradeError, TradeKind};
pub use csv::{CsvHelper, LedgerLineData};
pub use parser::{amend_withdrawal_fees, sort_trades, TradeSource, TradesProvider};
pub use rate::{CurrencyPair, RateError, RateSource};
pub use report::{PaymentKind, PaymentReport};
pub use time::{format_amount, parse_instant, year_delta};
