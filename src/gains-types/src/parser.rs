use chrono::Duration;
use rust_decimal::Decimal;

use crate::Trade;

/// Trait for parsing the underlying data source and returning a list of trades.
pub trait TradeSource {
    /// 'Parse' the underlying data source and return a list of trades.
    ///
    /// Each trade must be normalized on its own (see `Trade::new`), without
    /// any context of the other trades; ordering is handled by the provider.
    ///
    /// # Returns
    /// * `Vec<Trade>` - List of trades parsed from the data source.
    /// * `Box<dyn std::error::Error>` - If the data source could not be parsed.
    fn parse(&self) -> Result<Vec<Trade>, Box<dyn std::error::Error>>;
}

/// Wrapper around a `TradeSource` that delivers the parsed trades in
/// canonical processing order.
pub struct TradesProvider<P: TradeSource> {
    source: P,
}

impl<P: TradeSource> TradesProvider<P> {
    /// Parse the source and sort the trades for processing.
    pub fn get(&self) -> Result<Vec<Trade>, Box<dyn std::error::Error>> {
        let mut trades = self.source.parse()?;
        sort_trades(&mut trades);
        Ok(trades)
    }
}

impl<P: TradeSource> From<P> for TradesProvider<P> {
    fn from(source: P) -> Self {
        TradesProvider { source }
    }
}

/// Sort trades by time, keeping source order for equal instants, except that
/// a deposit never precedes a simultaneous withdrawal.
///
/// Some wallets register a deposit at exactly the same time the withdrawal
/// went out on the sending side, which would leave the relative order of the
/// two unclear. Biasing every deposit by +1 ns sorts it in after the
/// withdrawal it belongs to.
pub fn sort_trades(trades: &mut [Trade]) {
    trades.sort_by_key(|t| {
        if t.is_deposit_shaped() {
            t.time() + Duration::nanoseconds(1)
        } else {
            t.time()
        }
    });
}

/// Try to reconstruct withdrawal fees missing from the source data.
///
/// Some exchanges do not include withdrawal fees in their exported files.
/// Each withdrawal is matched with the first following deposit of the same
/// currency; the difference (withdrawn - deposited) is assigned as the
/// withdrawal fee if it is greater than zero. Call this only after all
/// transactions from every involved exchange and wallet were imported and
/// sorted.
///
/// A deposit larger than the candidate withdrawal cannot match; with
/// *lenient* set the pairing is skipped with a warning (the deposit is tried
/// against an earlier withdrawal), otherwise it is an error.
pub fn amend_withdrawal_fees(trades: &mut [Trade], lenient: bool) -> Result<(), String> {
    // Withdrawals and deposits in one list to keep their relative order:
    // (trade index, is_withdrawal, net withdrawn amount OR deposited amount)
    let mut transfers: Vec<(usize, bool, Decimal)> = Vec::new();
    for (i, t) in trades.iter().enumerate() {
        if t.is_withdrawal_shaped() {
            let (fee_currency, fee_amount) = t.fee();
            if fee_amount > Decimal::ZERO && fee_currency != t.sell().0 {
                return Err(format!(
                    "In trade {}, encountered withdrawal with different fee \
                     currency than withdrawn currency.",
                    i
                ));
            }
            transfers.push((i, true, t.sell().1 - fee_amount));
        } else if t.is_deposit_shaped() {
            transfers.push((i, false, t.buy().1));
        }
    }

    let mut unhandled_withdrawals: Vec<(usize, Decimal)> = Vec::new();
    let mut num_unmatched = 0usize;
    let mut num_feeless = 0usize;
    for (i, is_withdrawal, amount) in transfers {
        if is_withdrawal {
            unhandled_withdrawals.push((i, amount));
            num_unmatched += 1;
            num_feeless += trades[i].fee().1.is_zero() as usize;
            continue;
        }
        // a deposit; find the oldest matchable withdrawal
        let mut k = 0;
        while k < unhandled_withdrawals.len() {
            let (j, withdrawn) = unhandled_withdrawals[k];
            if trades[j].sell().0 != trades[i].buy().0 {
                k += 1;
            } else if withdrawn < amount {
                let errs = format!(
                    "The withdrawal from {} ({} {}, {}) is lower than the \
                     first deposit ({}, {} {}, {}) following it.",
                    trades[j].time(),
                    withdrawn,
                    trades[j].sell().0,
                    trades[j].exchange(),
                    trades[i].time(),
                    amount,
                    trades[i].buy().0,
                    trades[i].exchange()
                );
                if lenient {
                    log::warn!("{} Trying next withdrawal.", errs);
                    k += 1;
                } else {
                    return Err(errs);
                }
            } else {
                // found a match
                num_unmatched -= 1;
                num_feeless -= trades[j].fee().1.is_zero() as usize;
                if withdrawn > amount {
                    trades[j].amend_fee(withdrawn - amount);
                    log::info!("amended withdrawal: {}", trades[j]);
                }
                unhandled_withdrawals.remove(k);
                break;
            }
        }
    }

    if !unhandled_withdrawals.is_empty() {
        log::warn!(
            "{} withdrawals could not be matched with deposits, of which {} \
             have no assigned withdrawal fees.",
            num_unmatched,
            num_feeless
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CurrencyCode, TradeKind};
    use chrono::{DateTime, TimeZone, Utc};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 1, day, 12, 0, 0).unwrap()
    }

    fn transfer(
        kind: TradeKind,
        day: u32,
        buy: (&str, &str),
        sell: (&str, &str),
        fee: &str,
        exchange: &str,
    ) -> Trade {
        Trade::new(
            kind,
            at(day),
            CurrencyCode::new(buy.0),
            dec(buy.1),
            CurrencyCode::new(sell.0),
            dec(sell.1),
            CurrencyCode::new(sell.0),
            dec(fee),
            exchange.into(),
            String::new(),
            String::new(),
        )
        .unwrap()
    }

    #[test]
    fn deposits_sort_after_simultaneous_withdrawals() {
        let deposit = transfer(TradeKind::Deposit, 2, ("BTC", "1"), ("", "0"), "0", "ExB");
        let withdrawal = transfer(TradeKind::Withdrawal, 2, ("", "0"), ("BTC", "1"), "0", "ExA");
        let mut trades = vec![deposit.clone(), withdrawal.clone()];
        sort_trades(&mut trades);
        assert_eq!(trades, vec![withdrawal, deposit]);
    }

    #[test]
    fn missing_withdrawal_fee_is_reconstructed() {
        let mut trades = vec![
            transfer(TradeKind::Withdrawal, 2, ("", "0"), ("BTC", "1"), "0", "ExA"),
            transfer(TradeKind::Deposit, 3, ("BTC", "0.995"), ("", "0"), "0", "ExB"),
        ];
        amend_withdrawal_fees(&mut trades, false).unwrap();
        assert_eq!(trades[0].fee(), (&CurrencyCode::new("BTC"), dec("0.005")));
        assert_eq!(trades[1].fee().1, Decimal::ZERO);
    }

    #[test]
    fn withdrawal_with_declared_fee_is_left_alone() {
        let mut trades = vec![
            transfer(TradeKind::Withdrawal, 2, ("", "0"), ("BTC", "1"), "0.01", "ExA"),
            transfer(TradeKind::Deposit, 3, ("BTC", "0.99"), ("", "0"), "0", "ExB"),
        ];
        amend_withdrawal_fees(&mut trades, false).unwrap();
        assert_eq!(trades[0].fee().1, dec("0.01"));
    }

    #[test]
    fn deposit_larger_than_withdrawal_is_an_error() {
        let mut trades = vec![
            transfer(TradeKind::Withdrawal, 2, ("", "0"), ("BTC", "1"), "0", "ExA"),
            transfer(TradeKind::Deposit, 3, ("BTC", "2"), ("", "0"), "0", "ExB"),
        ];
        assert!(amend_withdrawal_fees(&mut trades, false).is_err());
        // lenient mode only logs and keeps going
        assert!(amend_withdrawal_fees(&mut trades, true).is_ok());
    }
}
