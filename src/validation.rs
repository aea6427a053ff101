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

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use gains_types::{CurrencyCode, Trade};
use rust_decimal::Decimal;

use crate::bags::{classify, Intent};

/// Validate the trade sequence before any of it is booked, and return the
/// set of involved currencies. There are several checks performed:
/// 1. The times should be monotonically increasing.
/// 2. No amount may be negative.
/// 3. Each trade's fields must be consistent with the intent it will be
///    booked as (e.g. a withdrawal must not dispose of the base currency,
///    a transfer fee must be paid in the transferred currency).
///
/// The engine re-validates while booking; this pass exists to reject
/// malformed input with a clear message before any state is built up.
///
/// # Arguments
/// * `trades` - A list of trades to validate, in ascending time order.
/// * `base` - The configured base currency.
///
/// # Returns
/// * `HashSet<CurrencyCode>` - If the trades are valid, the set of non-base
///   currencies that appear in them.
/// * `String` - If the trades are invalid, an error message.
pub fn context_validation(
    trades: &[Trade],
    base: &CurrencyCode,
) -> Result<HashSet<CurrencyCode>, String> {
    let mut previous_time: Option<DateTime<Utc>> = None;
    let mut currencies = HashSet::new();

    for trade in trades {
        if let Some(previous) = previous_time {
            if trade.time() < previous {
                return Err(format!(
                    "Date mismatch: expected >= {}, found {} in trade: {}",
                    previous.to_rfc3339(),
                    trade.time().to_rfc3339(),
                    trade
                ));
            }
        }
        previous_time = Some(trade.time());

        let (buy_currency, buy_amount) = trade.buy();
        let (sell_currency, sell_amount) = trade.sell();
        let (fee_currency, fee_amount) = trade.fee();
        if buy_amount < Decimal::ZERO || sell_amount < Decimal::ZERO || fee_amount < Decimal::ZERO
        {
            return Err(format!("Negative amount in trade: {}", trade));
        }
        for currency in [buy_currency, sell_currency, fee_currency] {
            if !currency.is_empty() && currency != base {
                currencies.insert(currency.clone());
            }
        }

        match classify(trade, base) {
            Intent::NoOp => continue,
            intent => {
                if trade.exchange().is_empty() {
                    return Err(format!("Trade names no exchange: {}", trade));
                }
                validate_intent(trade, intent, base)?;
            }
        }
    }

    Ok(currencies)
}

fn validate_intent(trade: &Trade, intent: Intent, base: &CurrencyCode) -> Result<(), String> {
    let (buy_currency, _) = trade.buy();
    let (sell_currency, _) = trade.sell();
    let (fee_currency, fee_amount) = trade.fee();

    match intent {
        Intent::BuyWithBase => {
            let (currency, amount) = trade.buy();
            if currency == base && amount > Decimal::ZERO {
                return Err(format!(
                    "Buying the base currency is not possible, found in trade: {}",
                    trade
                ));
            }
        }
        Intent::Withdrawal => {
            if sell_currency == base {
                return Err(format!(
                    "Withdrawing the base currency is not possible, found in trade: {}",
                    trade
                ));
            }
            if fee_amount > Decimal::ZERO && fee_currency != sell_currency {
                return Err(format!(
                    "Withdrawal fee must be paid in the withdrawn currency, \
                     found {} in trade: {}",
                    fee_currency, trade
                ));
            }
        }
        Intent::Deposit => {
            if buy_currency == base {
                return Err(format!(
                    "Depositing the base currency is not possible, found in trade: {}",
                    trade
                ));
            }
            if fee_amount > Decimal::ZERO && fee_currency != buy_currency {
                return Err(format!(
                    "Deposit fee must be paid in the deposited currency, \
                     found {} in trade: {}",
                    fee_currency, trade
                ));
            }
        }
        Intent::FeeOnly => {
            if fee_currency.is_empty() {
                return Err(format!("Fee without a fee currency in trade: {}", trade));
            }
        }
        Intent::Sale => {
            if fee_amount > Decimal::ZERO && fee_currency.is_empty() {
                return Err(format!("Fee without a fee currency in trade: {}", trade));
            }
        }
        Intent::NoOp => {}
    }
    Ok(())
}
