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

use std::borrow::Cow;

/// Trait for the data that will be written to the capital gains CSV file.
///
/// Provides data for a single line in the CSV file.
pub trait LedgerLineData {
    /// The kind of disposal (e.g. sale or withdrawal fee).
    fn kind(&self) -> Cow<str>;

    /// Amount taken out of the bag.
    fn amount_spent(&self) -> Cow<str>;

    /// The disposed currency.
    fn currency(&self) -> Cow<str>;

    /// Purchase date of the drained bag.
    fn purchase_date(&self) -> Cow<str>;

    /// Date of the disposal.
    fn sell_date(&self) -> Cow<str>;

    /// Exchange the disposal happened on.
    fn exchange(&self) -> Cow<str>;

    /// Whether the gain is short-term taxable.
    fn short_term(&self) -> Cow<str>;

    /// Base cost of the spent amount.
    fn cost(&self) -> Cow<str>;

    /// Base value received, net of fees.
    fn proceeds(&self) -> Cow<str>;

    /// Proceeds minus cost.
    fn profit(&self) -> Cow<str>;
}

/// Helper for writing data to the CSV file.
///
/// Provides utility functions like converting data to a single line in the CSV file & generating the header.
pub struct CsvHelper<T: LedgerLineData> {
    delimiter: String,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: LedgerLineData> CsvHelper<T> {
    const HEADER_ELEMENTS: [&'static str; 10] = [
        "Kind",
        "Amount Spent",
        "Currency",
        "Purchase Date",
        "Sell Date",
        "Exchange",
        "Short Term",
        "Cost",
        "Proceeds",
        "Profit",
    ];

    /// Create a new `CsvHelper` instance.
    pub fn new(delimiter: String) -> Self {
        Self {
            delimiter,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Delimiter used in the CSV file.
    fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Discrete elements of the CSV header.
    pub fn csv_header_elements(&self) -> &[&str] {
        &Self::HEADER_ELEMENTS
    }

    /// Full CSV header, as a single string.
    pub fn csv_header(&self) -> String {
        self.csv_header_elements().join(self.delimiter())
    }

    /// Convert the data to the discrete elements of a single CSV line.
    pub fn to_csv_line_elements(&self, data: T) -> Vec<String> {
        vec![
            data.kind().into_owned(),
            data.amount_spent().into_owned(),
            data.currency().into_owned(),
            data.purchase_date().into_owned(),
            data.sell_date().into_owned(),
            data.exchange().into_owned(),
            data.short_term().into_owned(),
            data.cost().into_owned(),
            data.proceeds().into_owned(),
            data.profit().into_owned(),
        ]
    }

    /// Convert the data to a single line in the CSV file.
    pub fn to_csv_line(&self, data: T) -> String {
        self.to_csv_line_elements(data).join(self.delimiter())
    }
}
