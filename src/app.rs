//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments
//! - loads configuration (env, `.env`, then flags)
//! - runs the pipeline or reads the store
//! - prints reports

use clap::Parser;

use crate::cli::{Cli, Command, LatestArgs, ReindexArgs, RunArgs, ShowArgs, StoreArgs};
use crate::domain::{PipelineConfig, RunStatus};
use crate::error::AppError;

pub mod pipeline;

use pipeline::{PipelineOrchestrator, open_store};

/// Entry point for the `pricecast` binary.
pub fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env()?;
    apply_store_args(&mut config, &cli.store);

    match cli.command {
        Command::Run(args) => handle_run(config, args),
        Command::Latest(args) => handle_latest(&config, args),
        Command::Show(args) => handle_show(&config, args),
        Command::Reindex(args) => handle_reindex(&config, args),
    }
}

fn handle_run(mut config: PipelineConfig, args: RunArgs) -> Result<(), AppError> {
    apply_run_args(&mut config, &args);
    config.validate()?;

    let orchestrator = PipelineOrchestrator::from_config(config)?;
    let outcome = orchestrator.run(args.date);
    println!("{}", crate::report::format_run_summary(&outcome));

    match outcome.status {
        RunStatus::Generated | RunStatus::Fallback => Ok(()),
        RunStatus::Failed => Err(AppError::new(
            5,
            format!("Run for {} failed; no forecast stored.", args.date),
        )),
    }
}

fn handle_latest(config: &PipelineConfig, args: LatestArgs) -> Result<(), AppError> {
    let store = open_store(&config.store_dir, config.sample_count)?;
    let batch = store.retrieve_latest(args.product)?;
    println!("{}", crate::report::format_batch(&batch, args.full));
    Ok(())
}

fn handle_show(config: &PipelineConfig, args: ShowArgs) -> Result<(), AppError> {
    let store = open_store(&config.store_dir, config.sample_count)?;
    let batch = store.retrieve(args.date, args.product)?;
    println!("{}", crate::report::format_batch(&batch, args.full));
    Ok(())
}

fn handle_reindex(config: &PipelineConfig, args: ReindexArgs) -> Result<(), AppError> {
    let store = open_store(&config.store_dir, config.sample_count)?;
    let report = store.verify_index()?;
    print!("{}", crate::report::format_index_report(&report));

    if args.check {
        if report.is_consistent() {
            return Ok(());
        }
        return Err(AppError::new(4, "Store index is inconsistent."));
    }
    if !report.is_consistent() {
        let entries = store.rebuild_index()?;
        println!("Index rebuilt: {entries} entries.");
    }
    Ok(())
}

/// CLI flags take precedence over environment configuration.
pub fn apply_store_args(config: &mut PipelineConfig, args: &StoreArgs) {
    if let Some(dir) = &args.store_dir {
        config.store_dir = dir.clone();
    }
    if let Some(samples) = args.samples {
        config.sample_count = samples;
    }
}

pub fn apply_run_args(config: &mut PipelineConfig, args: &RunArgs) {
    if let Some(path) = &args.models {
        config.models_path = path.clone();
    }
    if let Some(path) = &args.input {
        config.input_path = path.clone();
    }
    if !args.products.is_empty() {
        let mut products = args.products.clone();
        products.sort();
        products.dedup();
        config.products = products;
    }
    if let Some(secs) = args.deadline_secs {
        config.deadline = std::time::Duration::from_secs(secs);
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Product;
    use chrono::NaiveDate;

    #[test]
    fn flags_override_config() {
        let mut config = PipelineConfig::default();
        let args = RunArgs {
            date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            models: None,
            input: Some("in.csv".into()),
            products: vec![Product::Rtlmp, Product::Dalmp, Product::Rtlmp],
            deadline_secs: Some(60),
            workers: None,
            seed: Some(7),
        };
        apply_run_args(&mut config, &args);
        assert_eq!(config.products, vec![Product::Dalmp, Product::Rtlmp]);
        assert_eq!(config.input_path, std::path::PathBuf::from("in.csv"));
        assert_eq!(config.deadline.as_secs(), 60);
        assert_eq!(config.seed, 7);
        assert_eq!(config.models_path, PipelineConfig::default().models_path);
    }
}
