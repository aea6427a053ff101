use std::{
    fmt::{self, Display, Formatter},
    ops::Deref,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag describing the kind of a transaction, as exported by the exchanges.
///
/// Only a few tags influence how a trade is booked (`Distribution` and
/// `Payment` change the dispatch, deposits and withdrawals are recognized
/// by their shape); every unknown tag is kept verbatim and treated as a
/// plain trade.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum TradeKind {
    /// Disposal of one currency for another.
    Sale,
    /// Currency leaving an exchange, on its way to another one.
    Withdrawal,
    /// Currency arriving on an exchange.
    Deposit,
    /// Currency granted without a purchase, e.g. an airdrop or fork payout.
    Distribution,
    /// Currency spent on goods or services, without anything bought in return.
    Payment,
    /// Any other tag. Booked as a plain trade, the tag is kept for reports.
    Other(String),
}

impl FromStr for TradeKind {
    type Err = ();

    fn from_str(input: &str) -> Result<TradeKind, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "sale" | "sell" | "trade" => Ok(TradeKind::Sale),
            "withdrawal" => Ok(TradeKind::Withdrawal),
            "deposit" => Ok(TradeKind::Deposit),
            "distribution" => Ok(TradeKind::Distribution),
            "payment" => Ok(TradeKind::Payment),
            other => Ok(TradeKind::Other(other.to_string())),
        }
    }
}

impl Display for TradeKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            TradeKind::Sale => write!(f, "sale"),
            TradeKind::Withdrawal => write!(f, "withdrawal"),
            TradeKind::Deposit => write!(f, "deposit"),
            TradeKind::Distribution => write!(f, "distribution"),
            TradeKind::Payment => write!(f, "payment"),
            TradeKind::Other(tag) => write!(f, "{}", tag),
        }
    }
}

/// Textual symbol of a currency, e.g. BTC or EUR.
///
/// The symbol is always stored in uppercase. An empty code is used to denote
/// a missing side of a trade (e.g. the buy side of a withdrawal).
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn new(symbol: &str) -> Self {
        CurrencyCode(symbol.trim().to_uppercase())
    }

    /// An empty code, denoting a missing trade side.
    pub fn none() -> Self {
        CurrencyCode(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume self, return inner string.
    pub fn inner(self) -> String {
        self.0
    }
}

impl FromStr for CurrencyCode {
    type Err = ();

    fn from_str(input: &str) -> Result<CurrencyCode, Self::Err> {
        Ok(CurrencyCode::new(input))
    }
}

impl Deref for CurrencyCode {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for CurrencyCode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error raised while building a canonical trade record.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum TradeError {
    #[error("ambiguity: only one of buy_amount or sell_amount may be negative")]
    BothSidesNegative,
    #[error("could not parse time '{0}': an explicit UTC offset is required")]
    MissingTimezone(String),
}

/// A single canonical transaction: a trade between two currencies, or a
/// deposit/withdrawal of a single currency.
///
/// `buy_amount` is net of fees (the amount fully available afterwards),
/// `sell_amount` is gross (the total amount that left the account).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    kind: TradeKind,
    /// Time of the transaction, normalized to UTC.
    time: DateTime<Utc>,
    buy_currency: CurrencyCode,
    buy_amount: Decimal,
    sell_currency: CurrencyCode,
    sell_amount: Decimal,
    fee_currency: CurrencyCode,
    fee_amount: Decimal,
    exchange: String,
    /// Free text marker carried over from the source data.
    mark: String,
    /// Free text note about the transaction.
    comment: String,
}

impl Trade {
    /// Create a new `Trade` instance, normalizing the raw values.
    ///
    /// *buy_amount* and *sell_amount* may be given in any order if exactly
    /// one of the two values is negative, which will then be identified as
    /// the sell amount; the currencies are swapped along with the amounts.
    /// It's an error if both values are negative. The fee amount is stored
    /// as absolute value; a zero fee adopts a default fee currency (the buy
    /// currency when it differs from the sell currency, else the sell
    /// currency).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: TradeKind,
        time: DateTime<Utc>,
        buy_currency: CurrencyCode,
        buy_amount: Decimal,
        sell_currency: CurrencyCode,
        sell_amount: Decimal,
        fee_currency: CurrencyCode,
        fee_amount: Decimal,
        exchange: String,
        mark: String,
        comment: String,
    ) -> Result<Self, TradeError> {
        let (mut buy_currency, mut buy_amount) = (buy_currency, buy_amount);
        let (mut sell_currency, mut sell_amount) = (sell_currency, sell_amount);

        if buy_amount < Decimal::ZERO && sell_amount < Decimal::ZERO {
            return Err(TradeError::BothSidesNegative);
        }
        if buy_amount < Decimal::ZERO {
            let sold = buy_amount.abs();
            buy_amount = sell_amount;
            sell_amount = sold;
            std::mem::swap(&mut buy_currency, &mut sell_currency);
        } else {
            sell_amount = sell_amount.abs();
        }

        let (fee_currency, fee_amount) = if fee_amount.is_zero() {
            let default_cur = if fee_currency != sell_currency && !buy_currency.is_empty() {
                buy_currency.clone()
            } else {
                sell_currency.clone()
            };
            (default_cur, Decimal::ZERO)
        } else {
            (fee_currency, fee_amount.abs())
        };

        Ok(Trade {
            kind,
            time,
            buy_currency,
            buy_amount,
            sell_currency,
            sell_amount,
            fee_currency,
            fee_amount,
            exchange,
            mark,
            comment,
        })
    }

    pub fn kind(&self) -> &TradeKind {
        &self.kind
    }

    /// Time of the transaction, in UTC.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Bought currency and amount (net of fees).
    pub fn buy(&self) -> (&CurrencyCode, Decimal) {
        (&self.buy_currency, self.buy_amount)
    }

    /// Sold currency and amount (gross, fees included).
    pub fn sell(&self) -> (&CurrencyCode, Decimal) {
        (&self.sell_currency, self.sell_amount)
    }

    /// Fee currency and amount.
    pub fn fee(&self) -> (&CurrencyCode, Decimal) {
        (&self.fee_currency, self.fee_amount)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn mark(&self) -> &str {
        &self.mark
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Whether this trade looks like a deposit: something was acquired
    /// without anything disposed of in return.
    pub fn is_deposit_shaped(&self) -> bool {
        self.buy_amount > Decimal::ZERO
            && (self.sell_amount.is_zero() || self.sell_currency.is_empty())
    }

    /// Whether this trade looks like a withdrawal: something was disposed of
    /// without anything acquired in return.
    pub fn is_withdrawal_shaped(&self) -> bool {
        self.sell_amount > Decimal::ZERO
            && (self.buy_amount.is_zero() || self.buy_currency.is_empty())
    }

    /// Add a fee to this trade, in the sold currency. Used by normalizers
    /// that reconstruct withdrawal fees missing from the source data.
    pub fn amend_fee(&mut self, amount: Decimal) {
        self.fee_currency = self.sell_currency.clone();
        self.fee_amount += amount;
    }
}

impl Display for Trade {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{} on {}: acquired {} {}, disposed of {} {} for a fee of {} {}",
            self.kind,
            self.time.to_rfc3339(),
            self.buy_amount,
            self.buy_currency,
            self.sell_amount,
            self.sell_currency,
            self.fee_amount,
            self.fee_currency,
        )?;
        if !self.exchange.is_empty() {
            write!(f, " on {}", self.exchange)?;
        }
        if !self.comment.is_empty() {
            write!(f, " [{}]", self.comment)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn eur() -> CurrencyCode {
        CurrencyCode::new("EUR")
    }

    fn btc() -> CurrencyCode {
        CurrencyCode::new("btc")
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 1, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn currency_code_is_uppercased() {
        assert_eq!(&*btc(), "BTC");
        assert_eq!(&*CurrencyCode::new("  eur "), "EUR");
    }

    #[test]
    fn negative_buy_amount_swaps_sides() {
        let t = Trade::new(
            TradeKind::Sale,
            at(1),
            btc(),
            Decimal::from(-2),
            eur(),
            Decimal::from(100),
            CurrencyCode::none(),
            Decimal::ZERO,
            "Ex".into(),
            String::new(),
            String::new(),
        )
        .unwrap();
        assert_eq!(t.buy(), (&eur(), Decimal::from(100)));
        assert_eq!(t.sell(), (&btc(), Decimal::from(2)));
    }

    #[test]
    fn two_negative_amounts_are_rejected() {
        let res = Trade::new(
            TradeKind::Sale,
            at(1),
            btc(),
            Decimal::from(-2),
            eur(),
            Decimal::from(-100),
            CurrencyCode::none(),
            Decimal::ZERO,
            "Ex".into(),
            String::new(),
            String::new(),
        );
        assert_eq!(res, Err(TradeError::BothSidesNegative));
    }

    #[test]
    fn zero_fee_adopts_the_buy_currency() {
        let t = Trade::new(
            TradeKind::Sale,
            at(1),
            btc(),
            Decimal::ONE,
            eur(),
            Decimal::from(1000),
            CurrencyCode::none(),
            Decimal::ZERO,
            "Ex".into(),
            String::new(),
            String::new(),
        )
        .unwrap();
        assert_eq!(t.fee(), (&btc(), Decimal::ZERO));
    }

    #[test]
    fn fee_amount_is_stored_as_absolute_value() {
        let t = Trade::new(
            TradeKind::Sale,
            at(1),
            btc(),
            Decimal::ONE,
            eur(),
            Decimal::from(1000),
            eur(),
            Decimal::from(-5),
            "Ex".into(),
            String::new(),
            String::new(),
        )
        .unwrap();
        assert_eq!(t.fee(), (&eur(), Decimal::from(5)));
    }
}
