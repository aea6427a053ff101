// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! First-In First-Out (FIFO) cost-basis tracking.
//!
//! Every acquisition of a foreign or digital currency is put into a *bag*:
//! an amount of one currency bought at one time for a known cost in the
//! base currency. Disposals drain bags strictly oldest-first.
//!
//! # Algorithm
//!
//! When an amount is disposed of (sold, paid out, or consumed as a fee):
//!
//! 1. Starting from the front of the exchange's bag list, find the first
//!    non-empty bag holding the disposed currency.
//!
//! 2. Spend as much as possible out of that bag, up to the disposed amount.
//!    The bag's base cost decreases proportionally while its unit price
//!    stays frozen; the value of the spent amount at disposal time is the
//!    revenue of the slice.
//!
//! Repeat until the disposed amount is covered, emitting one payment record
//! per drained bag. The difference between the revenue and the original
//! cost of each slice is the profit, taxable only if the bag was held for
//! less than the short-term threshold.
//!
//! Transfers between exchanges take bags out of the per-exchange inventory
//! into a per-currency in-transit list (withdrawal) and back (deposit),
//! splitting the bag on the amount boundary if necessary.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Datelike, Utc};
use gains_types::{year_delta, CurrencyCode, PaymentKind, PaymentReport, RateError, Trade, TradeKind};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relations::CurrencyRelation;
use crate::report::PaymentLedger;

/// Key under which in-flight totals are tracked next to the exchanges.
pub const IN_TRANSIT_KEY: &str = "in_transit";

/// Error raised while booking trades.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A trade is earlier than the last processed one.
    #[error("trade out of order: {0}")]
    InputOrder(String),
    /// A trade's fields are inconsistent with its intent.
    #[error("malformed trade: {0}")]
    InputShape(String),
    /// A disposal or withdrawal exceeds the tracked holdings.
    #[error("insufficient funds: {0}")]
    Insufficient(String),
    /// The currency relation could not serve a required rate.
    #[error(transparent)]
    Rate(#[from] RateError),
    /// The engine state itself is inconsistent. Not recoverable.
    #[error("state corruption: {0}")]
    Corruption(String),
}

impl EngineError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, EngineError::Corruption(_))
    }
}

/// A single cost-basis lot: an *amount* of one currency acquired at one
/// time, with the base cost paid for it.
///
/// Spending from a bag decreases amount and cost together; the unit price
/// is set once at creation and never changes for the bag's life.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Bag {
    id: u64,
    acquired_at: DateTime<Utc>,
    currency: CurrencyCode,
    /// Remaining amount, with fees already subtracted at creation.
    amount: Decimal,
    cost_currency: CurrencyCode,
    /// Remaining base cost, fees included.
    cost: Decimal,
    /// Base cost per unit at acquisition. Frozen.
    price: Decimal,
}

impl Bag {
    pub fn new(
        id: u64,
        acquired_at: DateTime<Utc>,
        currency: CurrencyCode,
        amount: Decimal,
        cost_currency: CurrencyCode,
        cost: Decimal,
    ) -> Result<Self, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::InputShape(format!(
                "a bag must hold a positive amount, got {} {}",
                amount, currency
            )));
        }
        let price = cost / amount;
        Ok(Bag {
            id,
            acquired_at,
            currency,
            amount,
            cost_currency,
            cost,
            price,
        })
    }

    /// Create a bag from a unit price instead of a total cost.
    pub fn from_unit_price(
        id: u64,
        acquired_at: DateTime<Utc>,
        currency: CurrencyCode,
        amount: Decimal,
        cost_currency: CurrencyCode,
        unit_price: Decimal,
    ) -> Result<Self, EngineError> {
        let mut bag = Self::new(
            id,
            acquired_at,
            currency,
            amount,
            cost_currency,
            amount * unit_price,
        )?;
        bag.price = unit_price;
        Ok(bag)
    }

    /// A part split off an existing bag: same purchase time, same unit
    /// price, fresh id.
    fn split_of(&self, id: u64, amount: Decimal, cost: Decimal) -> Result<Self, EngineError> {
        let mut split = Self::new(
            id,
            self.acquired_at,
            self.currency.clone(),
            amount,
            self.cost_currency.clone(),
            cost,
        )?;
        split.price = self.price;
        Ok(split)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn cost_currency(&self) -> &CurrencyCode {
        &self.cost_currency
    }

    pub fn cost(&self) -> Decimal {
        self.cost
    }

    pub fn unit_price(&self) -> Decimal {
        self.price
    }

    /// Spend some amount out of this bag. This updates the current amount
    /// and the base cost, but leaves the price constant.
    ///
    /// # Returns
    /// The tuple `(spent, spent_cost, remainder)`, where
    /// * *spent* is the amount taken out of the bag, in units of the bag's
    ///   currency;
    /// * *spent_cost* is the base cost of the spent amount;
    /// * *remainder* is the leftover of *amount* after the spent amount is
    ///   subtracted.
    pub fn spend(&mut self, amount: Decimal) -> (Decimal, Decimal, Decimal) {
        if amount >= self.amount {
            let result = (self.amount, self.cost, amount - self.amount);
            self.amount = Decimal::ZERO;
            self.cost = Decimal::ZERO;
            return result;
        }
        let value = amount * self.price;
        self.amount -= amount;
        self.cost -= value;
        (amount, value, Decimal::ZERO)
    }

    pub fn is_empty(&self) -> bool {
        self.amount.is_zero()
    }
}

/// The intent a trade resolves to, decided by the classifier below.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Intent {
    BuyWithBase,
    FeeOnly,
    NoOp,
    Withdrawal,
    Deposit,
    Sale,
}

/// Classify a trade into exactly one intent. The rules are tried in order,
/// the first match wins.
pub(crate) fn classify(trade: &Trade, base: &CurrencyCode) -> Intent {
    let (buy_currency, buy_amount) = trade.buy();
    let (sell_currency, sell_amount) = trade.sell();
    let buy_missing = buy_currency.is_empty() || buy_amount.is_zero();
    let sell_missing = sell_currency.is_empty() || sell_amount.is_zero();

    if (sell_currency == base && sell_amount > Decimal::ZERO)
        || (*trade.kind() == TradeKind::Distribution && sell_amount.is_zero())
    {
        Intent::BuyWithBase
    } else if buy_missing && sell_missing {
        if trade.fee().1 > Decimal::ZERO {
            Intent::FeeOnly
        } else {
            Intent::NoOp
        }
    } else if *trade.kind() != TradeKind::Payment && buy_missing {
        Intent::Withdrawal
    } else if sell_missing {
        Intent::Deposit
    } else {
        Intent::Sale
    }
}

/// FIFO bag inventory across all exchanges, plus the profits collected from
/// processing trades against it.
#[derive(Debug)]
pub struct BagFifo<'a> {
    /// The base (fiat) currency all costs and gains are recorded in.
    pub(crate) base: CurrencyCode,
    relation: &'a CurrencyRelation,
    /// Bags held per exchange, sorted by purchase time.
    pub(crate) bags: BTreeMap<String, Vec<Bag>>,
    /// Bags withdrawn but not deposited yet, per currency.
    pub(crate) in_transit: BTreeMap<CurrencyCode, Vec<Bag>>,
    /// Total amounts per exchange and currency, including the
    /// `IN_TRANSIT_KEY` row. Kept consistent with the bag lists.
    pub(crate) totals: BTreeMap<String, BTreeMap<CurrencyCode, Decimal>>,
    /// Short-term taxable profit per year, in base currency.
    pub(crate) profit: BTreeMap<i32, Decimal>,
    pub(crate) last_seen: Option<DateTime<Utc>>,
    pub(crate) next_bag_id: u64,
    pub(crate) ledger: PaymentLedger,
    /// Where to dump the state when a trade is rejected.
    pub(crate) snapshot_path: Option<PathBuf>,
    /// Bags held at least this many calendar years are long-term.
    pub(crate) short_term_years: i32,
    /// Decimal places kept on intermediate revenue products.
    pub(crate) precision: u32,
}

impl<'a> BagFifo<'a> {
    /// Create an empty inventory recording values in *base* currency.
    ///
    /// The *relation* must serve exchange rates between all currencies
    /// involved in the trades that will be processed.
    pub fn new(base: CurrencyCode, relation: &'a CurrencyRelation) -> Self {
        BagFifo {
            base,
            relation,
            bags: BTreeMap::new(),
            in_transit: BTreeMap::new(),
            totals: BTreeMap::new(),
            profit: BTreeMap::new(),
            last_seen: None,
            next_bag_id: 1,
            ledger: PaymentLedger::new(),
            snapshot_path: None,
            short_term_years: 1,
            precision: 28,
        }
    }

    pub fn with_snapshot_path(mut self, path: Option<PathBuf>) -> Self {
        self.snapshot_path = path;
        self
    }

    pub fn with_short_term_years(mut self, years: i32) -> Self {
        self.short_term_years = years;
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }

    pub fn base(&self) -> &CurrencyCode {
        &self.base
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    pub fn ledger(&self) -> &PaymentLedger {
        &self.ledger
    }

    pub fn profit_by_year(&self) -> &BTreeMap<i32, Decimal> {
        &self.profit
    }

    pub fn totals(&self) -> &BTreeMap<String, BTreeMap<CurrencyCode, Decimal>> {
        &self.totals
    }

    pub fn bags_on(&self, exchange: &str) -> &[Bag] {
        self.bags.get(exchange).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn in_transit_of(&self, currency: &CurrencyCode) -> &[Bag] {
        self.in_transit
            .get(currency)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Yearly taxable profit summary, one line per year.
    pub fn yearly_profit_report(&self) -> Vec<String> {
        self.profit
            .iter()
            .map(|(year, profit)| {
                format!(
                    "Year {}: Taxable Profit: {} {}",
                    year,
                    gains_types::format_amount(*profit, 2),
                    self.base
                )
            })
            .collect()
    }

    /// Book one trade against the inventory.
    ///
    /// On a validation failure the current state is dumped to the
    /// configured snapshot path before the error is returned, so the input
    /// can be fixed and processing resumed. Corruption errors mean the
    /// state itself is broken and nothing is written.
    pub fn process_trade(&mut self, trade: &Trade) -> Result<(), EngineError> {
        log::debug!("processing trade: {}", trade);
        match self.apply(trade) {
            Err(err) if !err.is_corruption() => {
                self.snapshot_on_failure();
                Err(err)
            }
            other => other,
        }
    }

    fn apply(&mut self, trade: &Trade) -> Result<(), EngineError> {
        if let Some(last) = self.last_seen {
            if trade.time() < last {
                return Err(EngineError::InputOrder(format!(
                    "trade time {} is before the last processed time {}: {}",
                    trade.time().to_rfc3339(),
                    last.to_rfc3339(),
                    trade
                )));
            }
        }
        if trade.buy().1 < Decimal::ZERO
            || trade.sell().1 < Decimal::ZERO
            || trade.fee().1 < Decimal::ZERO
        {
            return Err(EngineError::InputShape(format!(
                "negative amount in trade: {}",
                trade
            )));
        }

        let intent = classify(trade, &self.base);
        if intent != Intent::NoOp && trade.exchange().is_empty() {
            return Err(EngineError::InputShape(format!(
                "trade names no exchange: {}",
                trade
            )));
        }
        match intent {
            Intent::BuyWithBase => {
                let (currency, amount) = trade.buy();
                let cost = trade.sell().1;
                self.buy_with_base(trade.time(), currency, amount, cost, trade.exchange())?;
            }
            Intent::FeeOnly => self.handle_fee_only(trade)?,
            Intent::NoOp => log::debug!("trade books nothing: {}", trade),
            Intent::Withdrawal => self.handle_withdrawal(trade)?,
            Intent::Deposit => self.handle_deposit(trade)?,
            Intent::Sale => self.handle_sale(trade)?,
        }
        self.last_seen = Some(trade.time());
        Ok(())
    }

    /// Create a new bag with *amount* of *currency*, paid for directly in
    /// base currency. Fees are expected to be subtracted from *amount* but
    /// included in *cost* already.
    fn buy_with_base(
        &mut self,
        time: DateTime<Utc>,
        currency: &CurrencyCode,
        amount: Decimal,
        cost: Decimal,
        exchange: &str,
    ) -> Result<(), EngineError> {
        if amount <= Decimal::ZERO {
            return Ok(());
        }
        if *currency == self.base {
            return Err(EngineError::InputShape(
                "Buying the base currency is not possible.".to_string(),
            ));
        }
        let id = self.next_id();
        let bag = Bag::new(
            id,
            time,
            currency.clone(),
            amount,
            self.base.clone(),
            cost,
        )?;
        self.bags.entry(exchange.to_string()).or_default().push(bag);
        self.add_total(exchange, currency, amount);
        Ok(())
    }

    /// Take *sell_amount* of a currency off an exchange and put it in
    /// transit. The withdrawal fee, if any, is paid out of the exchange's
    /// oldest bags first; the rest moves into the in-transit list.
    fn handle_withdrawal(&mut self, trade: &Trade) -> Result<(), EngineError> {
        let (currency, amount) = trade.sell();
        let currency = currency.clone();
        if currency == self.base {
            return Err(EngineError::InputShape(format!(
                "Withdrawing the base currency is not possible: {}",
                trade
            )));
        }
        let (fee_currency, fee) = trade.fee();
        if fee > Decimal::ZERO && *fee_currency != currency {
            return Err(EngineError::InputShape(format!(
                "withdrawal fee must be paid in the withdrawn currency, got {}: {}",
                fee_currency, trade
            )));
        }
        if fee > amount {
            return Err(EngineError::InputShape(format!(
                "withdrawal fee exceeds the withdrawn amount: {}",
                trade
            )));
        }
        let available = self.total_of(trade.exchange(), &currency);
        if amount > available {
            return Err(EngineError::Insufficient(format!(
                "Withdrawn amount ({1} {0}) higher than total available ({2} {0}) on {3}: {4}",
                currency,
                amount,
                available,
                trade.exchange(),
                trade
            )));
        }

        if fee > Decimal::ZERO {
            let (short_profit, _) = self.pay(
                trade.time(),
                &currency,
                fee,
                trade.exchange(),
                Decimal::ONE,
                None,
                PaymentKind::WithdrawalFee,
                CurrencyCode::none(),
                Decimal::ZERO,
            )?;
            self.add_profit(trade.time().year(), short_profit);
        }

        let to_move = amount - fee;
        if to_move > Decimal::ZERO {
            let moved = {
                let source = self.bags.get_mut(trade.exchange()).ok_or_else(|| {
                    EngineError::Corruption(format!(
                        "no bags on {} while totals show {} {}",
                        trade.exchange(),
                        available,
                        currency
                    ))
                })?;
                let dest = self.in_transit.entry(currency.clone()).or_default();
                move_bags(source, dest, &currency, to_move, &mut self.next_bag_id)?
            };
            if moved != to_move {
                return Err(EngineError::Corruption(format!(
                    "only {} of {} {} found in bags on {}",
                    moved,
                    to_move,
                    currency,
                    trade.exchange()
                )));
            }
            self.drop_exchange_if_empty(trade.exchange());
            self.sub_total(trade.exchange(), &currency, to_move);
            self.add_total(IN_TRANSIT_KEY, &currency, to_move);
        }
        Ok(())
    }

    /// Make in-transit bags of a currency available on an exchange again,
    /// oldest first. Depositing more than is in transit books the surplus
    /// as bought at zero cost.
    fn handle_deposit(&mut self, trade: &Trade) -> Result<(), EngineError> {
        let (currency, amount) = trade.buy();
        let currency = currency.clone();
        if currency == self.base {
            return Err(EngineError::InputShape(format!(
                "Depositing the base currency is not possible: {}",
                trade
            )));
        }
        let (fee_currency, fee) = trade.fee();
        if fee > Decimal::ZERO && *fee_currency != currency {
            return Err(EngineError::InputShape(format!(
                "deposit fee must be paid in the deposited currency, got {}: {}",
                fee_currency, trade
            )));
        }

        let moved = match self.in_transit.get_mut(&currency) {
            Some(transit) => {
                let dest = self.bags.entry(trade.exchange().to_string()).or_default();
                let moved = move_bags(transit, dest, &currency, amount, &mut self.next_bag_id)?;
                // the just-deposited bags may be older than existing ones
                dest.sort_by_key(|bag| bag.acquired_at());
                moved
            }
            None => Decimal::ZERO,
        };
        if self
            .in_transit
            .get(&currency)
            .is_some_and(|bags| bags.is_empty())
        {
            self.in_transit.remove(&currency);
        }
        self.sub_total(IN_TRANSIT_KEY, &currency, moved);
        self.add_total(trade.exchange(), &currency, moved);

        let surplus = amount - moved;
        if surplus > Decimal::ZERO {
            log::warn!(
                "Depositing more money ({1} {0}) than was withdrawn before ({2} {0}). \
                 Assuming the additional amount ({3} {0}) was bought with 0 {4}.",
                currency,
                amount,
                moved,
                surplus,
                self.base
            );
            self.buy_with_base(
                trade.time(),
                &currency,
                surplus,
                Decimal::ZERO,
                trade.exchange(),
            )?;
        }

        if fee > Decimal::ZERO {
            // taken from the exchange's oldest funds, not from the
            // deposited bags specifically
            let (short_profit, _) = self.pay(
                trade.time(),
                &currency,
                fee,
                trade.exchange(),
                Decimal::ONE,
                None,
                PaymentKind::DepositFee,
                CurrencyCode::none(),
                Decimal::ZERO,
            )?;
            self.add_profit(trade.time().year(), short_profit);
        }
        Ok(())
    }

    /// A trade with nothing bought or sold, only a fee.
    fn handle_fee_only(&mut self, trade: &Trade) -> Result<(), EngineError> {
        let (fee_currency, fee) = trade.fee();
        let fee_currency = fee_currency.clone();
        let (short_profit, _) = self.pay(
            trade.time(),
            &fee_currency,
            fee,
            trade.exchange(),
            Decimal::ONE,
            None,
            PaymentKind::ExchangeFee,
            CurrencyCode::none(),
            Decimal::ZERO,
        )?;
        self.add_profit(trade.time().year(), short_profit);
        Ok(())
    }

    /// Dispose of the sold currency and, unless base currency was bought,
    /// put the bought currency into a new bag whose cost is the full net
    /// proceeds of the disposal.
    fn handle_sale(&mut self, trade: &Trade) -> Result<(), EngineError> {
        let (sell_currency, sell_amount) = trade.sell();
        let sell_currency = sell_currency.clone();
        let (buy_currency, buy_amount) = trade.buy();
        let buy_currency = buy_currency.clone();
        let (fee_currency, fee_amount) = trade.fee();
        let fee_currency = fee_currency.clone();

        let mut fee_ratio = Decimal::ZERO;
        let mut third_currency_fee = None;
        if fee_amount > Decimal::ZERO {
            if fee_currency == sell_currency {
                // the fee is already part of the gross sell amount
                fee_ratio = fee_amount / sell_amount;
            } else if fee_currency == buy_currency {
                fee_ratio = fee_amount / (buy_amount + fee_amount);
            } else {
                // fee in a native fee token; value it in the sold currency
                let rate = self
                    .relation
                    .get_rate(trade.time(), &fee_currency, &sell_currency)?;
                let converted = fee_amount * rate;
                fee_ratio = converted / (sell_amount + converted);
                third_currency_fee = Some((fee_currency.clone(), fee_amount));
            }
        }
        if fee_ratio >= Decimal::ONE {
            return Err(EngineError::InputShape(format!(
                "fee consumes the whole sale: {}",
                trade
            )));
        }

        // A sale against the base currency carries its own rate; it beats
        // whatever the relation would serve for that instant.
        let custom_rate = if buy_currency == self.base {
            Some(buy_amount / sell_amount / (Decimal::ONE - fee_ratio))
        } else {
            None
        };

        if let Some((fee_currency, fee_amount)) = third_currency_fee {
            let (short_profit, _) = self.pay(
                trade.time(),
                &fee_currency,
                fee_amount,
                trade.exchange(),
                Decimal::ONE,
                None,
                PaymentKind::ExchangeFee,
                CurrencyCode::none(),
                Decimal::ZERO,
            )?;
            self.add_profit(trade.time().year(), short_profit);
        }

        let kind = if *trade.kind() == TradeKind::Payment {
            PaymentKind::Payment
        } else {
            PaymentKind::Sale
        };
        let buy_ratio = buy_amount / sell_amount;
        let (short_profit, proceeds) = self.pay(
            trade.time(),
            &sell_currency,
            sell_amount,
            trade.exchange(),
            fee_ratio,
            custom_rate,
            kind,
            buy_currency.clone(),
            buy_ratio,
        )?;
        self.add_profit(trade.time().year(), short_profit);

        if buy_currency != self.base && buy_amount > Decimal::ZERO {
            // the full net proceeds become the cost of the new bag
            self.buy_with_base(trade.time(), &buy_currency, buy_amount, proceeds, trade.exchange())?;
        }
        Ok(())
    }

    /// Pay *amount* of *currency* out of the exchange's bags, oldest first.
    ///
    /// *fee_ratio* is the fraction of the payment that is a fee and earns
    /// no proceeds. The rate from the disposed currency to the base
    /// currency is taken from *custom_rate* if given, otherwise from the
    /// currency relation at *time*. One payment record is appended to the
    /// ledger per drained bag.
    ///
    /// # Returns
    /// The tuple `(short_term_profit, proceeds)`: the net proceeds of the
    /// short-term slices minus their cost basis, and the full net proceeds
    /// of the payment. Both use the identical fee treatment, so the first
    /// is the taxable gain while the second can serve as the cost basis of
    /// a newly acquired currency.
    #[allow(clippy::too_many_arguments)]
    fn pay(
        &mut self,
        time: DateTime<Utc>,
        currency: &CurrencyCode,
        amount: Decimal,
        exchange: &str,
        fee_ratio: Decimal,
        custom_rate: Option<Decimal>,
        kind: PaymentKind,
        buy_currency: CurrencyCode,
        buy_ratio: Decimal,
    ) -> Result<(Decimal, Decimal), EngineError> {
        if *currency == self.base {
            return Err(EngineError::InputShape(
                "Payments with the base currency are not relevant here.".to_string(),
            ));
        }
        if amount.is_zero() {
            return Ok((Decimal::ZERO, Decimal::ZERO));
        }
        let available = self.total_of(exchange, currency);
        if amount > available {
            return Err(EngineError::Insufficient(format!(
                "Amount to pay ({1} {0}) is higher than total available ({2} {0}) on {3}",
                currency, amount, available, exchange
            )));
        }
        let rate = match custom_rate {
            Some(rate) => rate,
            None => self.relation.get_rate(time, currency, &self.base)?,
        };
        let net_share = Decimal::ONE - fee_ratio;

        let bags = self.bags.get_mut(exchange).ok_or_else(|| {
            EngineError::Corruption(format!(
                "no bags on {} while totals show {} {}",
                exchange, available, currency
            ))
        })?;

        let mut to_pay = amount;
        let mut gross_revenue = Decimal::ZERO;
        let mut short_gross_revenue = Decimal::ZERO;
        let mut short_cost = Decimal::ZERO;
        let mut index = 0;
        while to_pay > Decimal::ZERO {
            let Some(bag) = bags.get_mut(index) else {
                return Err(EngineError::Corruption(format!(
                    "bag list for {} exhausted while paying {} {}",
                    exchange, to_pay, currency
                )));
            };
            if bag.currency() != currency {
                index += 1;
                continue;
            }

            let requested = to_pay;
            let (spent, spent_cost, remainder) = bag.spend(requested);
            let gross = quantize(spent * rate, self.precision);
            let net = quantize(gross * net_share, self.precision);
            let short_term = year_delta(bag.acquired_at(), time).abs() < self.short_term_years;

            gross_revenue += gross;
            if short_term {
                short_gross_revenue += gross;
                short_cost += spent_cost;
            }

            let row = PaymentReport {
                kind,
                exchange: exchange.to_string(),
                sell_time: time,
                currency: currency.clone(),
                to_pay: requested,
                fee_ratio,
                bag_time: bag.acquired_at(),
                bag_amount_before: bag.amount() + spent,
                bag_spent: spent,
                cost_currency: self.base.clone(),
                spent_cost,
                short_term,
                ex_rate: rate,
                proceeds: net,
                profit: net - spent_cost,
                buy_currency: buy_currency.clone(),
                buy_ratio,
            };
            let emptied = bag.is_empty();
            self.ledger.push(row);
            if emptied {
                bags.remove(index);
            } else {
                index += 1;
            }
            to_pay = remainder;
        }

        self.drop_exchange_if_empty(exchange);
        self.sub_total(exchange, currency, amount);

        let short_profit = quantize(short_gross_revenue * net_share, self.precision) - short_cost;
        let proceeds = quantize(gross_revenue * net_share, self.precision);
        Ok((short_profit, proceeds))
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_bag_id;
        self.next_bag_id += 1;
        id
    }

    fn add_profit(&mut self, year: i32, delta: Decimal) {
        *self.profit.entry(year).or_insert(Decimal::ZERO) += delta;
    }

    fn total_of(&self, exchange: &str, currency: &CurrencyCode) -> Decimal {
        self.totals
            .get(exchange)
            .and_then(|per_currency| per_currency.get(currency))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn add_total(&mut self, exchange: &str, currency: &CurrencyCode, delta: Decimal) {
        if delta.is_zero() {
            return;
        }
        *self
            .totals
            .entry(exchange.to_string())
            .or_default()
            .entry(currency.clone())
            .or_insert(Decimal::ZERO) += delta;
    }

    /// Decrease a total, removing drained entries so empty exchanges and
    /// currencies don't linger in the books.
    fn sub_total(&mut self, exchange: &str, currency: &CurrencyCode, delta: Decimal) {
        if delta.is_zero() {
            return;
        }
        if let Some(per_currency) = self.totals.get_mut(exchange) {
            if let Some(total) = per_currency.get_mut(currency) {
                *total -= delta;
                if total.is_zero() {
                    per_currency.remove(currency);
                }
            }
            if per_currency.is_empty() {
                self.totals.remove(exchange);
            }
        }
    }

    fn drop_exchange_if_empty(&mut self, exchange: &str) {
        if self.bags.get(exchange).is_some_and(|bags| bags.is_empty()) {
            self.bags.remove(exchange);
        }
    }

    fn snapshot_on_failure(&self) {
        if let Some(path) = self.snapshot_path.clone() {
            match self.save_snapshot_to(&path) {
                Ok(()) => log::info!("engine state dumped to {}", path.display()),
                Err(err) => log::warn!("could not dump state to {}: {}", path.display(), err),
            }
        }
    }
}

/// Round-half-even quantization applied to intermediate revenue products.
fn quantize(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(precision, RoundingStrategy::MidpointNearestEven)
}

/// Move *amount* of *currency* from the front of *source* into *dest*,
/// splitting the last contributing bag on the boundary. Bags of other
/// currencies are skipped. Returns the amount actually moved, which is less
/// than requested if *source* runs short.
fn move_bags(
    source: &mut Vec<Bag>,
    dest: &mut Vec<Bag>,
    currency: &CurrencyCode,
    amount: Decimal,
    next_bag_id: &mut u64,
) -> Result<Decimal, EngineError> {
    let mut remaining = amount;
    let mut index = 0;
    while remaining > Decimal::ZERO && index < source.len() {
        if source[index].currency() != currency {
            index += 1;
            continue;
        }
        if source[index].amount() <= remaining {
            let bag = source.remove(index);
            remaining -= bag.amount();
            dest.push(bag);
        } else {
            let bag = &mut source[index];
            let (spent, spent_cost, _) = bag.spend(remaining);
            let id = *next_bag_id;
            *next_bag_id += 1;
            dest.push(bag.split_of(id, spent, spent_cost)?);
            remaining = Decimal::ZERO;
        }
    }
    Ok(amount - remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::RateSeries;
    use chrono::{Duration, TimeZone};
    use gains_types::{CurrencyPair, RateSource};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn eur() -> CurrencyCode {
        CurrencyCode::new("EUR")
    }

    fn btc() -> CurrencyCode {
        CurrencyCode::new("BTC")
    }

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 1, 1, 12, 0, 0).unwrap() + Duration::days(n - 1)
    }

    /// Build a relation from `(base, quote, [(day, rate)])` series sampled
    /// at daily intervals.
    fn rates(series: &[(&str, &str, &[(i64, &str)])]) -> CurrencyRelation {
        let sources = series
            .iter()
            .map(|(base, quote, samples)| {
                let pair = CurrencyPair::new(CurrencyCode::new(base), CurrencyCode::new(quote));
                let mut series = RateSeries::new(pair, Duration::days(1));
                for (n, rate) in *samples {
                    series.insert_sample(day(*n), dec(rate));
                }
                Box::new(series) as Box<dyn RateSource>
            })
            .collect();
        CurrencyRelation::with_sources(sources)
    }

    fn trade(
        kind: TradeKind,
        n: i64,
        buy: (&str, &str),
        sell: (&str, &str),
        fee: (&str, &str),
        exchange: &str,
    ) -> Trade {
        Trade::new(
            kind,
            day(n),
            CurrencyCode::new(buy.0),
            dec(buy.1),
            CurrencyCode::new(sell.0),
            dec(sell.1),
            CurrencyCode::new(fee.0),
            dec(fee.1),
            exchange.into(),
            String::new(),
            String::new(),
        )
        .unwrap()
    }

    fn buy(n: i64, amount: &str, cost: &str, exchange: &str) -> Trade {
        trade(
            TradeKind::Sale,
            n,
            ("BTC", amount),
            ("EUR", cost),
            ("", "0"),
            exchange,
        )
    }

    /// Every currency's bag amounts must sum up to the tracked totals,
    /// including the in-transit row.
    fn assert_conservation(fifo: &BagFifo) {
        let mut recomputed: BTreeMap<String, BTreeMap<CurrencyCode, Decimal>> = BTreeMap::new();
        for (exchange, bags) in &fifo.bags {
            for bag in bags {
                *recomputed
                    .entry(exchange.clone())
                    .or_default()
                    .entry(bag.currency().clone())
                    .or_insert(Decimal::ZERO) += bag.amount();
            }
        }
        for bags in fifo.in_transit.values() {
            for bag in bags {
                *recomputed
                    .entry(IN_TRANSIT_KEY.to_string())
                    .or_default()
                    .entry(bag.currency().clone())
                    .or_insert(Decimal::ZERO) += bag.amount();
            }
        }
        let normalized: BTreeMap<_, BTreeMap<_, _>> = recomputed
            .into_iter()
            .map(|(exchange, mut per_currency)| {
                per_currency.retain(|_, amount| !amount.is_zero());
                (exchange, per_currency)
            })
            .filter(|(_, per_currency)| !per_currency.is_empty())
            .collect();
        assert_eq!(&normalized, fifo.totals(), "totals out of sync with bags");
    }

    /// Every non-empty bag must keep cost and amount coupled through its
    /// frozen unit price.
    fn assert_cost_coupling(fifo: &BagFifo) {
        let epsilon = dec("0.00000000000000000001");
        for bag in fifo
            .bags
            .values()
            .flatten()
            .chain(fifo.in_transit.values().flatten())
        {
            let drift = (bag.cost() - bag.amount() * bag.unit_price()).abs();
            assert!(
                drift <= epsilon,
                "bag {} drifted: cost {} vs {} x {}",
                bag.id(),
                bag.cost(),
                bag.amount(),
                bag.unit_price()
            );
        }
    }

    #[test]
    fn bag_spend_partial_and_full() {
        let mut bag = Bag::new(1, day(1), btc(), dec("2"), eur(), dec("1000")).unwrap();
        assert_eq!(bag.unit_price(), dec("500"));

        let (spent, spent_cost, remainder) = bag.spend(dec("0.5"));
        assert_eq!((spent, spent_cost, remainder), (dec("0.5"), dec("250.0"), Decimal::ZERO));
        assert_eq!(bag.amount(), dec("1.5"));
        assert_eq!(bag.cost(), dec("750.0"));
        assert_eq!(bag.unit_price(), dec("500"));

        // asking for more than the bag holds drains it and reports the rest
        let (spent, spent_cost, remainder) = bag.spend(dec("2"));
        assert_eq!((spent, spent_cost, remainder), (dec("1.5"), dec("750.0"), dec("0.5")));
        assert!(bag.is_empty());
        assert_eq!(bag.cost(), Decimal::ZERO);
        assert_eq!(bag.unit_price(), dec("500"));
    }

    #[test]
    fn bag_rejects_a_non_positive_amount() {
        assert!(Bag::new(1, day(1), btc(), Decimal::ZERO, eur(), dec("10")).is_err());
        assert!(Bag::new(1, day(1), btc(), dec("-1"), eur(), dec("10")).is_err());
    }

    #[test]
    fn bag_from_unit_price_computes_the_cost() {
        let bag = Bag::from_unit_price(1, day(1), btc(), dec("2"), eur(), dec("500")).unwrap();
        assert_eq!(bag.cost(), dec("1000"));
        assert_eq!(bag.unit_price(), dec("500"));
    }

    #[test]
    fn classifier_decision_table() {
        let base = eur();
        let cases = [
            (buy(1, "1", "1000", "Ex"), Intent::BuyWithBase),
            (
                trade(TradeKind::Distribution, 1, ("BTC", "1"), ("", "0"), ("", "0"), "Ex"),
                Intent::BuyWithBase,
            ),
            (
                trade(TradeKind::Sale, 1, ("", "0"), ("", "0"), ("BTC", "0.1"), "Ex"),
                Intent::FeeOnly,
            ),
            (
                trade(TradeKind::Sale, 1, ("", "0"), ("", "0"), ("", "0"), "Ex"),
                Intent::NoOp,
            ),
            (
                trade(TradeKind::Withdrawal, 1, ("", "0"), ("BTC", "1"), ("", "0"), "Ex"),
                Intent::Withdrawal,
            ),
            (
                trade(TradeKind::Deposit, 1, ("BTC", "1"), ("", "0"), ("", "0"), "Ex"),
                Intent::Deposit,
            ),
            (
                trade(TradeKind::Sale, 1, ("XMR", "10"), ("BTC", "1"), ("", "0"), "Ex"),
                Intent::Sale,
            ),
            // a payment disposes without buying, but is not a withdrawal
            (
                trade(TradeKind::Payment, 1, ("", "0"), ("BTC", "1"), ("", "0"), "Ex"),
                Intent::Sale,
            ),
        ];
        for (trade, expected) in cases {
            assert_eq!(classify(&trade, &base), expected, "for {}", trade);
        }
    }

    #[test]
    fn straight_round_trip_without_fees() {
        // S1: buy at 1000, sell at 3000 two days after the last sample refresh
        let relation = rates(&[("BTC", "EUR", &[(1, "1000"), (3, "2000"), (5, "3000")])]);
        let mut fifo = BagFifo::new(eur(), &relation);

        fifo.process_trade(&buy(1, "1", "1000", "Ex")).unwrap();
        assert_conservation(&fifo);
        let bag = &fifo.bags_on("Ex")[0];
        assert_eq!(bag.amount(), dec("1"));
        assert_eq!(bag.cost(), dec("1000"));
        assert_eq!(bag.unit_price(), dec("1000"));

        fifo.process_trade(&trade(
            TradeKind::Sale,
            5,
            ("EUR", "3000"),
            ("BTC", "1"),
            ("", "0"),
            "Ex",
        ))
        .unwrap();

        assert_eq!(fifo.profit_by_year()[&2017], dec("2000"));
        assert!(fifo.totals().is_empty());
        assert!(fifo.bags_on("Ex").is_empty());
        assert_conservation(&fifo);

        let rows = fifo.ledger().rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, PaymentKind::Sale);
        assert_eq!(rows[0].proceeds, dec("3000"));
        assert_eq!(rows[0].profit, dec("2000"));
        assert!(rows[0].short_term);
    }

    #[test]
    fn partial_disposal_after_a_year_is_long_term() {
        // S2: the sale happens more than one year after the acquisition
        let relation = rates(&[("BTC", "EUR", &[(1, "1000"), (400, "2000"), (410, "2000")])]);
        let mut fifo = BagFifo::new(eur(), &relation);

        fifo.process_trade(&buy(1, "2", "2000", "Ex")).unwrap();
        fifo.process_trade(&trade(
            TradeKind::Sale,
            410,
            ("EUR", "2000"),
            ("BTC", "1"),
            ("", "0"),
            "Ex",
        ))
        .unwrap();

        // long-term gains are not taxable
        assert_eq!(fifo.profit_by_year()[&2018], Decimal::ZERO);
        let bag = &fifo.bags_on("Ex")[0];
        assert_eq!(bag.amount(), dec("1"));
        assert_eq!(bag.cost(), dec("1000"));
        let rows = fifo.ledger().rows();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].short_term);
        assert_eq!(rows[0].proceeds, dec("2000"));
        assert_eq!(rows[0].bag_amount_before, dec("2"));
        assert_conservation(&fifo);
        assert_cost_coupling(&fifo);
    }

    #[test]
    fn sale_with_fee_in_the_sold_currency() {
        // S3: 0.01 BTC of the sold 1 BTC is a fee
        let relation = rates(&[("BTC", "EUR", &[(1, "1000"), (2, "1500")])]);
        let mut fifo = BagFifo::new(eur(), &relation);

        fifo.process_trade(&buy(1, "1", "1000", "Ex")).unwrap();
        fifo.process_trade(&trade(
            TradeKind::Sale,
            2,
            ("EUR", "1485"),
            ("BTC", "1"),
            ("BTC", "0.01"),
            "Ex",
        ))
        .unwrap();

        assert_eq!(fifo.profit_by_year()[&2017], dec("485"));
        assert!(fifo.totals().is_empty());
        let rows = fifo.ledger().rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fee_ratio, dec("0.01"));
        assert_eq!(rows[0].ex_rate, dec("1500"));
        assert_eq!(rows[0].proceeds, dec("1485"));
        assert_eq!(rows[0].profit, dec("485"));
    }

    #[test]
    fn withdraw_deposit_splits_the_bag() {
        // S4: transfer 0.4 BTC (0.01 fee) from ExA to ExB, sell there
        let relation = rates(&[(
            "BTC",
            "EUR",
            &[(1, "1000"), (2, "1000"), (3, "1000"), (4, "2000")],
        )]);
        let mut fifo = BagFifo::new(eur(), &relation);

        fifo.process_trade(&buy(1, "1", "1000", "ExA")).unwrap();
        fifo.process_trade(&trade(
            TradeKind::Withdrawal,
            2,
            ("", "0"),
            ("BTC", "0.4"),
            ("BTC", "0.01"),
            "ExA",
        ))
        .unwrap();
        assert_conservation(&fifo);
        assert_cost_coupling(&fifo);

        let on_a = fifo.bags_on("ExA");
        assert_eq!(on_a.len(), 1);
        assert_eq!(on_a[0].amount(), dec("0.60"));
        assert_eq!(on_a[0].cost(), dec("600.00"));
        let in_transit = fifo.in_transit_of(&btc());
        assert_eq!(in_transit.len(), 1);
        assert_eq!(in_transit[0].amount(), dec("0.39"));
        assert_eq!(in_transit[0].cost(), dec("390.00"));
        assert_eq!(in_transit[0].acquired_at(), day(1));
        // the 0.01 BTC fee at 1000 EUR/BTC is a 10 EUR loss
        assert_eq!(fifo.profit_by_year()[&2017], dec("-10.00"));

        fifo.process_trade(&trade(
            TradeKind::Deposit,
            3,
            ("BTC", "0.39"),
            ("", "0"),
            ("", "0"),
            "ExB",
        ))
        .unwrap();
        assert_conservation(&fifo);
        assert!(fifo.in_transit_of(&btc()).is_empty());
        assert_eq!(fifo.bags_on("ExB")[0].amount(), dec("0.39"));

        fifo.process_trade(&trade(
            TradeKind::Sale,
            4,
            ("EUR", "780"),
            ("BTC", "0.39"),
            ("", "0"),
            "ExB",
        ))
        .unwrap();
        assert!(fifo.bags_on("ExB").is_empty());
        // 780 proceeds - 390 cost - 10 fee loss = 380 for the year
        assert_eq!(fifo.profit_by_year()[&2017], dec("380.00"));
        assert_conservation(&fifo);
    }

    #[test]
    fn monotonic_time_violation_is_rejected() {
        // S6: a trade earlier than the last processed one must not book
        let relation = rates(&[("BTC", "EUR", &[(1, "1000"), (2, "1000")])]);
        let mut fifo = BagFifo::new(eur(), &relation);

        fifo.process_trade(&buy(2, "1", "1000", "Ex")).unwrap();
        let err = fifo.process_trade(&buy(1, "1", "1000", "Ex")).unwrap_err();
        assert!(matches!(err, EngineError::InputOrder(_)));

        // nothing was booked
        assert_eq!(fifo.bags_on("Ex").len(), 1);
        assert_eq!(fifo.totals()["Ex"][&btc()], dec("1"));
        assert_eq!(fifo.last_seen(), Some(day(2)));
    }

    #[test]
    fn rejected_trade_dumps_the_state() {
        let relation = rates(&[("BTC", "EUR", &[(1, "1000"), (2, "1000")])]);
        let path = std::env::temp_dir().join("fifo_gains_failure_dump.toml");
        std::fs::remove_file(&path).ok();

        let mut fifo =
            BagFifo::new(eur(), &relation).with_snapshot_path(Some(path.clone()));
        fifo.process_trade(&buy(2, "1", "1000", "Ex")).unwrap();
        assert!(fifo.process_trade(&buy(1, "1", "1000", "Ex")).is_err());

        let dumped = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        let restored = BagFifo::restore_str(&dumped, &relation).unwrap();
        assert_eq!(restored.totals(), fifo.totals());
    }

    #[test]
    fn withdrawing_more_than_available_is_rejected() {
        let relation = rates(&[("BTC", "EUR", &[(1, "1000"), (2, "1000")])]);
        let mut fifo = BagFifo::new(eur(), &relation);
        fifo.process_trade(&buy(1, "1", "1000", "Ex")).unwrap();
        let err = fifo
            .process_trade(&trade(
                TradeKind::Withdrawal,
                2,
                ("", "0"),
                ("BTC", "2"),
                ("", "0"),
                "Ex",
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::Insufficient(_)));
        assert_eq!(fifo.bags_on("Ex").len(), 1);
    }

    #[test]
    fn buying_the_base_currency_is_rejected() {
        let relation = rates(&[("BTC", "EUR", &[(1, "1000")])]);
        let mut fifo = BagFifo::new(eur(), &relation);
        let err = fifo
            .process_trade(&trade(
                TradeKind::Sale,
                1,
                ("EUR", "100"),
                ("EUR", "100"),
                ("", "0"),
                "Ex",
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::InputShape(_)));
    }

    #[test]
    fn missing_rate_is_fatal() {
        let relation = rates(&[("BTC", "EUR", &[(1, "1000")])]);
        let mut fifo = BagFifo::new(eur(), &relation);
        fifo.process_trade(&buy(1, "1", "1000", "Ex")).unwrap();
        // selling for a currency with no route needs a BTC rate at day 3,
        // which the series does not cover
        let err = fifo
            .process_trade(&trade(
                TradeKind::Sale,
                3,
                ("XMR", "10"),
                ("BTC", "0.5"),
                ("", "0"),
                "Ex",
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::Rate(RateError::NoRate { .. })));
    }

    #[test]
    fn distributions_create_zero_cost_bags() {
        let relation = rates(&[("BTC", "EUR", &[(1, "1000"), (2, "2000")])]);
        let mut fifo = BagFifo::new(eur(), &relation);
        fifo.process_trade(&trade(
            TradeKind::Distribution,
            1,
            ("BTC", "0.5"),
            ("", "0"),
            ("", "0"),
            "Ex",
        ))
        .unwrap();
        let bag = &fifo.bags_on("Ex")[0];
        assert_eq!(bag.cost(), Decimal::ZERO);
        assert_eq!(bag.unit_price(), Decimal::ZERO);

        // the full sale price of the distributed coins is profit
        fifo.process_trade(&trade(
            TradeKind::Sale,
            2,
            ("EUR", "1000"),
            ("BTC", "0.5"),
            ("", "0"),
            "Ex",
        ))
        .unwrap();
        assert_eq!(fifo.profit_by_year()[&2017], dec("1000"));
    }

    #[test]
    fn deposit_without_withdrawal_books_a_zero_cost_surplus() {
        let relation = rates(&[("BTC", "EUR", &[(1, "1000")])]);
        let mut fifo = BagFifo::new(eur(), &relation);
        fifo.process_trade(&trade(
            TradeKind::Deposit,
            1,
            ("BTC", "0.5"),
            ("", "0"),
            ("", "0"),
            "Ex",
        ))
        .unwrap();
        let bag = &fifo.bags_on("Ex")[0];
        assert_eq!(bag.amount(), dec("0.5"));
        assert_eq!(bag.cost(), Decimal::ZERO);
        assert_conservation(&fifo);
    }

    #[test]
    fn fee_only_trades_book_the_cost_as_loss() {
        let relation = rates(&[("BTC", "EUR", &[(1, "1000"), (2, "1200")])]);
        let mut fifo = BagFifo::new(eur(), &relation);
        fifo.process_trade(&buy(1, "1", "1000", "Ex")).unwrap();
        fifo.process_trade(&trade(
            TradeKind::Sale,
            2,
            ("", "0"),
            ("", "0"),
            ("BTC", "0.1"),
            "Ex",
        ))
        .unwrap();

        let bag = &fifo.bags_on("Ex")[0];
        assert_eq!(bag.amount(), dec("0.9"));
        assert_eq!(bag.cost(), dec("900.0"));
        assert_eq!(fifo.profit_by_year()[&2017], dec("-100.0"));
        let rows = fifo.ledger().rows();
        assert_eq!(rows[0].kind, PaymentKind::ExchangeFee);
        assert_eq!(rows[0].proceeds, Decimal::ZERO);
    }

    #[test]
    fn payments_dispose_without_buying() {
        let relation = rates(&[("BTC", "EUR", &[(1, "1000"), (2, "1200")])]);
        let mut fifo = BagFifo::new(eur(), &relation);
        fifo.process_trade(&buy(1, "1", "1000", "Ex")).unwrap();
        fifo.process_trade(&trade(
            TradeKind::Payment,
            2,
            ("", "0"),
            ("BTC", "0.5"),
            ("", "0"),
            "Ex",
        ))
        .unwrap();

        // 0.5 * 1200 - 500 = 100
        assert_eq!(fifo.profit_by_year()[&2017], dec("100.0"));
        let rows = fifo.ledger().rows();
        assert_eq!(rows[0].kind, PaymentKind::Payment);
        assert_eq!(rows[0].buy_ratio, Decimal::ZERO);
        assert_eq!(fifo.bags_on("Ex")[0].amount(), dec("0.5"));
    }

    #[test]
    fn sale_with_fee_in_a_native_token() {
        let relation = rates(&[
            ("BTC", "EUR", &[(1, "1000"), (2, "2000")]),
            ("BNB", "BTC", &[(1, "0.005"), (2, "0.005")]),
        ]);
        let mut fifo = BagFifo::new(eur(), &relation);
        fifo.process_trade(&buy(1, "1", "1000", "Ex")).unwrap();
        fifo.process_trade(&trade(
            TradeKind::Sale,
            1,
            ("BNB", "100"),
            ("EUR", "100"),
            ("", "0"),
            "Ex",
        ))
        .unwrap();

        // fee of 50 BNB = 0.25 BTC; ratio 0.25 / (0.75 + 0.25) = 0.25
        fifo.process_trade(&trade(
            TradeKind::Sale,
            2,
            ("XMR", "100"),
            ("BTC", "0.75"),
            ("BNB", "50"),
            "Ex",
        ))
        .unwrap();

        // the BNB fee is valued through the BNB->BTC->EUR recipe
        let rows = fifo.ledger().rows();
        let fee_row = rows
            .iter()
            .find(|row| row.kind == PaymentKind::ExchangeFee)
            .unwrap();
        assert_eq!(fee_row.currency, CurrencyCode::new("BNB"));
        assert_eq!(fee_row.ex_rate, dec("10.000"));
        assert_eq!(fee_row.profit, dec("-50"));

        let sale_row = rows.iter().find(|row| row.kind == PaymentKind::Sale).unwrap();
        assert_eq!(sale_row.fee_ratio, dec("0.25"));
        // gross 0.75 * 2000 = 1500, net 1125, cost 750
        assert_eq!(sale_row.proceeds, dec("1125.0000"));
        assert_eq!(sale_row.profit, dec("375.0000"));

        // the new XMR bag is priced at the full net proceeds
        let xmr_bag = fifo
            .bags_on("Ex")
            .iter()
            .find(|bag| *bag.currency() == CurrencyCode::new("XMR"))
            .unwrap();
        assert_eq!(xmr_bag.cost(), dec("1125.0000"));

        // -50 from the fee, +375 from the sale
        assert_eq!(fifo.profit_by_year()[&2017], dec("325.0000"));
        assert_conservation(&fifo);
        assert_cost_coupling(&fifo);
    }

    #[test]
    fn disposals_drain_the_oldest_bag_first() {
        let relation = rates(&[("BTC", "EUR", &[(1, "1000"), (2, "2000"), (3, "3000")])]);
        let mut fifo = BagFifo::new(eur(), &relation);
        fifo.process_trade(&buy(1, "1", "1000", "Ex")).unwrap();
        fifo.process_trade(&buy(2, "1", "2000", "Ex")).unwrap();
        fifo.process_trade(&trade(
            TradeKind::Sale,
            3,
            ("EUR", "4500"),
            ("BTC", "1.5"),
            ("", "0"),
            "Ex",
        ))
        .unwrap();

        // one and a half bags drained: 1 @ 1000 and 0.5 @ 2000
        let rows = fifo.ledger().rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bag_time, day(1));
        assert_eq!(rows[0].bag_spent, dec("1"));
        assert_eq!(rows[0].to_pay, dec("1.5"));
        assert_eq!(rows[1].bag_time, day(2));
        assert_eq!(rows[1].bag_spent, dec("0.5"));
        // 3000 - 1000 + 1500 - 1000 = 2500
        assert_eq!(fifo.profit_by_year()[&2017], dec("2500.0"));

        let remaining = fifo.bags_on("Ex");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].amount(), dec("0.5"));
        assert_eq!(remaining[0].unit_price(), dec("2000"));
        assert_conservation(&fifo);
    }

    #[test]
    fn deposits_keep_the_destination_sorted_by_purchase_time() {
        let relation = rates(&[(
            "BTC",
            "EUR",
            &[(1, "1000"), (2, "1000"), (3, "1000"), (4, "1000")],
        )]);
        let mut fifo = BagFifo::new(eur(), &relation);
        // an old bag leaves ExA while a newer one is bought on ExB
        fifo.process_trade(&buy(1, "1", "1000", "ExA")).unwrap();
        fifo.process_trade(&trade(
            TradeKind::Withdrawal,
            2,
            ("", "0"),
            ("BTC", "1"),
            ("", "0"),
            "ExA",
        ))
        .unwrap();
        fifo.process_trade(&buy(3, "1", "1000", "ExB")).unwrap();
        fifo.process_trade(&trade(
            TradeKind::Deposit,
            4,
            ("BTC", "1"),
            ("", "0"),
            ("", "0"),
            "ExB",
        ))
        .unwrap();

        let bags = fifo.bags_on("ExB");
        assert_eq!(bags.len(), 2);
        // the deposited day-1 bag sorts before the day-3 purchase
        assert_eq!(bags[0].acquired_at(), day(1));
        assert_eq!(bags[1].acquired_at(), day(3));
        assert_conservation(&fifo);
    }

    #[test]
    fn split_preserves_amount_cost_and_time() {
        let acquired = day(1);
        let mut source = vec![Bag::new(1, acquired, btc(), dec("2"), eur(), dec("1000")).unwrap()];
        let mut dest = Vec::new();
        let mut next_id = 2;

        let moved = move_bags(&mut source, &mut dest, &btc(), dec("0.75"), &mut next_id).unwrap();
        assert_eq!(moved, dec("0.75"));
        assert_eq!(next_id, 3);

        assert_eq!(source[0].amount(), dec("1.25"));
        assert_eq!(source[0].cost(), dec("625.00"));
        assert_eq!(dest[0].amount(), dec("0.75"));
        assert_eq!(dest[0].cost(), dec("375.00"));
        assert_eq!(dest[0].acquired_at(), acquired);
        assert_eq!(dest[0].unit_price(), source[0].unit_price());
        assert_ne!(dest[0].id(), source[0].id());
    }

    #[test]
    fn move_bags_skips_other_currencies() {
        let mut source = vec![
            Bag::new(1, day(1), CurrencyCode::new("XMR"), dec("5"), eur(), dec("50")).unwrap(),
            Bag::new(2, day(2), btc(), dec("1"), eur(), dec("1000")).unwrap(),
        ];
        let mut dest = Vec::new();
        let mut next_id = 3;
        let moved = move_bags(&mut source, &mut dest, &btc(), dec("1"), &mut next_id).unwrap();
        assert_eq!(moved, dec("1"));
        assert_eq!(source.len(), 1);
        assert_eq!(*source[0].currency(), CurrencyCode::new("XMR"));
        assert_eq!(*dest[0].currency(), btc());
    }

    #[test]
    fn unit_price_stays_frozen_through_the_pipeline() {
        let relation = rates(&[(
            "BTC",
            "EUR",
            &[(1, "1000"), (2, "1500"), (3, "1800"), (4, "2000")],
        )]);
        let mut fifo = BagFifo::new(eur(), &relation);
        fifo.process_trade(&buy(1, "2", "2000", "ExA")).unwrap();
        fifo.process_trade(&trade(
            TradeKind::Withdrawal,
            2,
            ("", "0"),
            ("BTC", "0.5"),
            ("BTC", "0.1"),
            "ExA",
        ))
        .unwrap();
        fifo.process_trade(&trade(
            TradeKind::Deposit,
            3,
            ("BTC", "0.4"),
            ("", "0"),
            ("", "0"),
            "ExB",
        ))
        .unwrap();
        fifo.process_trade(&trade(
            TradeKind::Sale,
            4,
            ("EUR", "500"),
            ("BTC", "0.25"),
            ("", "0"),
            "ExB",
        ))
        .unwrap();

        for bag in fifo
            .bags
            .values()
            .flatten()
            .chain(fifo.in_transit.values().flatten())
        {
            assert_eq!(bag.unit_price(), dec("1000"));
        }
        assert_conservation(&fifo);
        assert_cost_coupling(&fifo);
    }
}
