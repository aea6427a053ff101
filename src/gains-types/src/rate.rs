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

use std::fmt::{self, Debug, Display, Formatter};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::CurrencyCode;

/// A directed currency pair: the rate of a pair converts one unit of `base`
/// into units of `quote`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    base: CurrencyCode,
    quote: CurrencyCode,
}

impl CurrencyPair {
    pub fn new(base: CurrencyCode, quote: CurrencyCode) -> Self {
        CurrencyPair { base, quote }
    }

    pub fn base(&self) -> &CurrencyCode {
        &self.base
    }

    pub fn quote(&self) -> &CurrencyCode {
        &self.quote
    }

    /// The same pair in the opposite direction.
    pub fn reversed(&self) -> Self {
        CurrencyPair {
            base: self.quote.clone(),
            quote: self.base.clone(),
        }
    }
}

impl Display for CurrencyPair {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}->{}", self.base, self.quote)
    }
}

/// Error raised when an exchange rate cannot be served.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum RateError {
    #[error("no conversion route from {from} to {to}")]
    NoRoute { from: CurrencyCode, to: CurrencyCode },
    #[error("no rate sample for {pair} at {time}")]
    NoRate {
        pair: CurrencyPair,
        time: DateTime<Utc>,
    },
}

/// Trait for providers of time-indexed exchange rates for a single directed
/// currency pair.
pub trait RateSource: Debug {
    /// The directed pair this source prices.
    fn pair(&self) -> &CurrencyPair;

    /// Get the exact rate at the given time.
    ///
    /// Returns the rate as a `Decimal`, or `RateError::NoRate` if the source
    /// has no sample covering *time*.
    fn get_price(&self, time: DateTime<Utc>) -> Result<Decimal, RateError>;
}
