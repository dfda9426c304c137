//! Command-line parsing for the forecast pipeline.
//!
//! The CLI is a thin caller: it picks a target date or product, hands it to
//! the library, and prints what comes back. Flags override environment
//! configuration.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use crate::domain::Product;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "pricecast", version, about = "Daily probabilistic price forecasts with fallback")]
pub struct Cli {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate, validate and store forecasts for a target date.
    Run(RunArgs),
    /// Print the most recent stored forecast for a product.
    Latest(LatestArgs),
    /// Print the stored forecast for a date and product.
    Show(ShowArgs),
    /// Check the store index against the files on disk, and repair it.
    Reindex(ReindexArgs),
}

/// Options shared by every subcommand.
#[derive(Debug, Args, Clone)]
pub struct StoreArgs {
    /// Forecast store root (overrides PRICECAST_STORE_DIR).
    #[arg(long, global = true, value_name = "DIR")]
    pub store_dir: Option<PathBuf>,

    /// Samples per record (overrides PRICECAST_SAMPLES).
    #[arg(long, global = true)]
    pub samples: Option<usize>,
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Target date (YYYY-MM-DD); the horizon starts at 00:00 UTC.
    #[arg(long)]
    pub date: NaiveDate,

    /// Model coefficients JSON (overrides PRICECAST_MODELS).
    #[arg(long, value_name = "JSON")]
    pub models: Option<PathBuf>,

    /// Input dataset CSV (overrides PRICECAST_INPUT).
    #[arg(long, value_name = "CSV")]
    pub input: Option<PathBuf>,

    /// Products to forecast (repeatable; overrides PRICECAST_PRODUCTS).
    #[arg(short = 'p', long = "product", value_enum)]
    pub products: Vec<Product>,

    /// Run deadline in seconds (overrides PRICECAST_DEADLINE_SECS).
    #[arg(long)]
    pub deadline_secs: Option<u64>,

    /// Worker threads (0 = one per core).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Base seed for sample generation.
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct LatestArgs {
    #[arg(short = 'p', long, value_enum)]
    pub product: Product,

    /// Print every hour instead of the summary.
    #[arg(long)]
    pub full: bool,
}

#[derive(Debug, Args, Clone)]
pub struct ShowArgs {
    #[arg(long)]
    pub date: NaiveDate,

    #[arg(short = 'p', long, value_enum)]
    pub product: Product,

    /// Print every hour instead of the summary.
    #[arg(long)]
    pub full: bool,
}

#[derive(Debug, Args, Clone)]
pub struct ReindexArgs {
    /// Only report inconsistencies; do not rewrite the index.
    #[arg(long)]
    pub check: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_repeated_products_and_global_store() {
        let cli = Cli::parse_from([
            "pricecast", "run", "--date", "2026-05-01", "-p", "DALMP", "-p", "REGUP", "--store-dir", "/tmp/s",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.products, vec![Product::Dalmp, Product::RegUp]);
        assert_eq!(args.date, NaiveDate::from_ymd_opt(2026, 5, 1).unwrap());
        assert_eq!(cli.store.store_dir, Some(PathBuf::from("/tmp/s")));
    }

    #[test]
    fn product_codes_are_validated() {
        assert!(Cli::try_parse_from(["pricecast", "latest", "-p", "GAS"]).is_err());
    }
}
