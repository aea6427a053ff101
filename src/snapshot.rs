//! Text snapshots of the engine state.
//!
//! A snapshot is the engine's crash dump: whenever a trade is rejected the
//! full state is written out, so the offending input can be fixed and
//! processing resumed without replaying everything. The encoding is plain
//! self-describing TOML; stability across versions matters more than
//! compactness.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use gains_types::{CurrencyCode, PaymentReport};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bags::{Bag, BagFifo, EngineError, IN_TRANSIT_KEY};
use crate::relations::CurrencyRelation;
use crate::report::PaymentLedger;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    base_currency: CurrencyCode,
    last_seen: Option<DateTime<Utc>>,
    next_bag_id: u64,
    /// Short-term taxable profit per year, keyed by the 4-digit year.
    profit: BTreeMap<String, Decimal>,
    /// Totals as tracked while processing; checked against the bag lists
    /// on restore.
    totals: BTreeMap<String, BTreeMap<CurrencyCode, Decimal>>,
    exchanges: BTreeMap<String, Vec<Bag>>,
    in_transit: BTreeMap<CurrencyCode, Vec<Bag>>,
    ledger: Vec<PaymentReport>,
}

impl<'a> BagFifo<'a> {
    /// Serialize the full engine state into the snapshot text encoding.
    pub fn snapshot_string(&self) -> Result<String, Box<dyn std::error::Error>> {
        let file = SnapshotFile {
            base_currency: self.base.clone(),
            last_seen: self.last_seen,
            next_bag_id: self.next_bag_id,
            profit: self
                .profit
                .iter()
                .map(|(year, profit)| (year.to_string(), *profit))
                .collect(),
            totals: self.totals.clone(),
            exchanges: self.bags.clone(),
            in_transit: self.in_transit.clone(),
            ledger: self.ledger.rows().to_vec(),
        };
        Ok(toml::to_string_pretty(&file)?)
    }

    pub fn save_snapshot_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        std::fs::write(path, self.snapshot_string()?)?;
        Ok(())
    }

    /// Rebuild an engine from a snapshot file.
    ///
    /// The recorded totals are recomputed from the bag inventories; a
    /// snapshot whose totals disagree, or that holds a bag whose cost
    /// currency is not the base currency, is rejected as corrupt.
    pub fn restore_from(
        path: &Path,
        relation: &'a CurrencyRelation,
    ) -> Result<BagFifo<'a>, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Corruption(format!("cannot read snapshot {}: {}", path.display(), err))
        })?;
        Self::restore_str(&content, relation)
    }

    pub fn restore_str(
        content: &str,
        relation: &'a CurrencyRelation,
    ) -> Result<BagFifo<'a>, EngineError> {
        let file: SnapshotFile = toml::from_str(content)
            .map_err(|err| EngineError::Corruption(format!("unreadable snapshot: {}", err)))?;

        for bag in file
            .exchanges
            .values()
            .flatten()
            .chain(file.in_transit.values().flatten())
        {
            if *bag.cost_currency() != file.base_currency {
                return Err(EngineError::Corruption(format!(
                    "snapshot bag {} has cost currency {} instead of {}",
                    bag.id(),
                    bag.cost_currency(),
                    file.base_currency
                )));
            }
        }

        let recomputed = recompute_totals(&file);
        if recomputed != file.totals {
            return Err(EngineError::Corruption(
                "snapshot totals disagree with its bag inventories".to_string(),
            ));
        }

        let mut profit = BTreeMap::new();
        for (year, value) in &file.profit {
            let year: i32 = year.parse().map_err(|_| {
                EngineError::Corruption(format!("snapshot has a malformed year key '{}'", year))
            })?;
            profit.insert(year, *value);
        }

        let mut fifo = BagFifo::new(file.base_currency, relation);
        fifo.last_seen = file.last_seen;
        fifo.next_bag_id = file.next_bag_id;
        fifo.profit = profit;
        fifo.totals = file.totals;
        fifo.bags = file.exchanges;
        fifo.in_transit = file.in_transit;
        fifo.ledger = PaymentLedger::from_rows(file.ledger);
        Ok(fifo)
    }
}

fn recompute_totals(
    file: &SnapshotFile,
) -> BTreeMap<String, BTreeMap<CurrencyCode, Decimal>> {
    let mut totals: BTreeMap<String, BTreeMap<CurrencyCode, Decimal>> = BTreeMap::new();
    let mut add = |exchange: &str, currency: &CurrencyCode, amount: Decimal| {
        if amount.is_zero() {
            return;
        }
        *totals
            .entry(exchange.to_string())
            .or_default()
            .entry(currency.clone())
            .or_insert(Decimal::ZERO) += amount;
    };
    for (exchange, bags) in &file.exchanges {
        for bag in bags {
            add(exchange, bag.currency(), bag.amount());
        }
    }
    for bags in file.in_transit.values() {
        for bag in bags {
            add(IN_TRANSIT_KEY, bag.currency(), bag.amount());
        }
    }
    totals
}
