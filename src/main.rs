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

mod bags;
mod csv_parser;
mod rates;
mod relations;
mod report;
mod snapshot;
mod validation;

use std::path::{Path, PathBuf};

use bags::BagFifo;
use csv_parser::CsvTradeParser;
use gains_types::{amend_withdrawal_fees, CsvHelper, CurrencyCode, TradesProvider};
use rates::RateSeries;
use relations::CurrencyRelation;

use chrono::Duration;
use clap::Parser;
use env_logger::Env;
use serde::Deserialize;

/// Command-line arguments
#[derive(Debug, Parser)]
struct CmdArgs {
    /// Path to the .toml config file
    #[clap(short, long, default_value = "Config.toml")]
    config_path: String,

    /// Path to the capital gains ledger output file
    #[clap(short, long, default_value = "gains_ledger.csv")]
    ledger_output: String,

    /// Restore the engine from this snapshot before processing
    #[clap(short, long)]
    resume: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{}] - {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .init();

    // 0. Parse the config file
    let cmd_args = CmdArgs::parse();
    let toml_content = std::fs::read_to_string(cmd_args.config_path)?;
    let config: Config = toml::from_str(&toml_content)?;
    if config.decimal_precision > 28 {
        return Err(format!(
            "decimal_precision of {} exceeds the 28 representable places",
            config.decimal_precision
        )
        .into());
    }
    let base = CurrencyCode::new(&config.base_currency);

    log::info!("Configuration file loaded successfully.");

    // 1. Load the historical rate series & build the currency relation.
    let mut relation = CurrencyRelation::new();
    for entry in &config.rates {
        let series = RateSeries::from_csv_file(
            Path::new(&entry.file),
            &entry.unit,
            Duration::hours(entry.interval_hours),
        )?;
        relation.add_source(Box::new(series));
        log::info!("Loaded {} rates from file: {}", entry.unit, entry.file);
    }

    // 2. Parse the trades file and validate the data.
    // NOTE: If user wants to have a different data source, they should modify the line below with their own implementation.
    // The `CsvTradeParser` should be replaced with a custom type that implements the TradeSource trait.
    let provider: TradesProvider<_> = CsvTradeParser::new(&config.trades_file, config.skip_rows).into();
    let mut trades = provider.get()?;
    log::info!("Finished parsing {} trades.", trades.len());

    if config.amend_withdrawal_fees {
        amend_withdrawal_fees(&mut trades, false)?;
        log::info!("Withdrawal fee amendment completed.");
    }

    let currencies = validation::context_validation(&trades, &base)?;
    log::info!("Contextual validation completed successfully.");

    // Convenience for the user; sanity check.
    log::info!(
        "Parsed following unique currencies: {:?}",
        currencies.iter().map(|c| c.to_string()).collect::<Vec<_>>()
    );

    // 3. Create the engine & process the trades in FIFO manner.
    let mut fifo = match &cmd_args.resume {
        Some(path) => {
            let restored = BagFifo::restore_from(Path::new(path), &relation)?;
            if *restored.base() != base {
                return Err(format!(
                    "snapshot base currency {} does not match the configured {}",
                    restored.base(),
                    base
                )
                .into());
            }
            log::info!("Engine state restored from snapshot: {}", path);
            restored
        }
        None => BagFifo::new(base, &relation),
    }
    .with_snapshot_path(config.snapshot_path.clone().map(PathBuf::from))
    .with_short_term_years(config.short_term_years)
    .with_precision(config.decimal_precision);

    if let Some(last) = fifo.last_seen() {
        let before = trades.len();
        trades.retain(|trade| trade.time() >= last);
        if before != trades.len() {
            log::info!(
                "Skipped {} trades dated before the snapshot time {}.",
                before - trades.len(),
                last.to_rfc3339()
            );
        }
    }

    for trade in &trades {
        fifo.process_trade(trade)?;
    }
    log::info!(
        "Finished processing all trades; {} payment events recorded.",
        fifo.ledger().len()
    );

    log::info!("Yearly taxable profit:");
    fifo.yearly_profit_report()
        .iter()
        .for_each(|line| log::info!("{}", line));

    // 4. Generate the output CSV file.
    let csv_helper = CsvHelper::new(config.csv_delimiter.clone());
    let rows = if config.consolidate_ledger {
        fifo.ledger().consolidated()
    } else {
        fifo.ledger().rows()
    };
    let lines = rows
        .iter()
        .map(|row| csv_helper.to_csv_line(report::output_line(row)))
        .collect::<Vec<_>>();

    std::fs::write(
        &cmd_args.ledger_output,
        format!("{}\n{}\n", csv_helper.csv_header(), lines.join("\n")),
    )?;
    log::info!(
        "Capital gains ledger written to file: {}",
        cmd_args.ledger_output
    );

    Ok(())
}

#[derive(Debug, Deserialize)]
struct Config {
    /// The fiat currency gains and losses are reported in.
    base_currency: String,
    /// Path to the canonical trades CSV file.
    trades_file: String,
    /// Separator to use in the output CSV file.
    #[serde(default = "default_delimiter")]
    csv_delimiter: String,
    /// Where rejected-trade state dumps are written, if anywhere.
    #[serde(default)]
    snapshot_path: Option<String>,
    /// Bags held at least this many calendar years are long-term.
    #[serde(default = "default_short_term_years")]
    short_term_years: i32,
    /// Decimal places kept on intermediate revenue products.
    #[serde(default = "default_precision")]
    decimal_precision: u32,
    /// Leading header rows of the trades file.
    #[serde(default = "default_skip_rows")]
    skip_rows: usize,
    /// Reconstruct withdrawal fees missing from the source data.
    #[serde(default)]
    amend_withdrawal_fees: bool,
    /// Combine consecutive ledger slices per day in the output.
    #[serde(default = "default_consolidate")]
    consolidate_ledger: bool,
    /// Historical rate files to load.
    #[serde(default)]
    rates: Vec<RatesEntry>,
}

#[derive(Debug, Deserialize)]
struct RatesEntry {
    /// Path to a csv file of `unix_time, price, volume` rows.
    file: String,
    /// Pair the file prices, e.g. "EUR/BTC".
    unit: String,
    /// Sampling interval the file is resampled to.
    #[serde(default = "default_interval_hours")]
    interval_hours: i64,
}

fn default_delimiter() -> String {
    ", ".to_string()
}

fn default_short_term_years() -> i32 {
    1
}

fn default_precision() -> u32 {
    28
}

fn default_skip_rows() -> usize {
    1
}

fn default_consolidate() -> bool {
    true
}

fn default_interval_hours() -> i64 {
    1
}
