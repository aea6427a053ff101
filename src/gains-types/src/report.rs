use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::CurrencyCode;

/// The kind of event that drained value out of a bag.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum PaymentKind {
    #[serde(rename = "sale")]
    Sale,
    #[serde(rename = "withdrawal fee")]
    WithdrawalFee,
    #[serde(rename = "deposit fee")]
    DepositFee,
    #[serde(rename = "exchange fee")]
    ExchangeFee,
    #[serde(rename = "payment")]
    Payment,
}

impl Display for PaymentKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            PaymentKind::Sale => write!(f, "sale"),
            PaymentKind::WithdrawalFee => write!(f, "withdrawal fee"),
            PaymentKind::DepositFee => write!(f, "deposit fee"),
            PaymentKind::ExchangeFee => write!(f, "exchange fee"),
            PaymentKind::Payment => write!(f, "payment"),
        }
    }
}

/// A container for the values gathered while one bag is drained during a
/// payment, one entry per involved bag. The collected entries carry enough
/// information to reconstruct the full gain computation.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PaymentReport {
    pub kind: PaymentKind,
    pub exchange: String,
    /// Time of the disposal.
    pub sell_time: DateTime<Utc>,
    /// The disposed currency.
    pub currency: CurrencyCode,
    /// The amount that still had to be paid when this bag was reached.
    pub to_pay: Decimal,
    /// Fraction of the paid amount that is a fee.
    pub fee_ratio: Decimal,
    /// Purchase time of the drained bag.
    pub bag_time: DateTime<Utc>,
    /// Amount in the bag before this payment drained it.
    pub bag_amount_before: Decimal,
    /// Amount taken out of the bag.
    pub bag_spent: Decimal,
    pub cost_currency: CurrencyCode,
    /// Base cost of the spent amount.
    pub spent_cost: Decimal,
    /// Whether the bag was held for less than the short-term threshold.
    pub short_term: bool,
    /// Exchange rate from the disposed currency to the base currency at
    /// `sell_time`.
    pub ex_rate: Decimal,
    /// Base value received for the spent amount, net of fees.
    pub proceeds: Decimal,
    /// `proceeds - spent_cost`; negative for a loss.
    pub profit: Decimal,
    /// For sales only: the currency bought with the disposal.
    pub buy_currency: CurrencyCode,
    /// For sales only: the bought amount per unit of the disposed currency.
    pub buy_ratio: Decimal,
}
