//! `pricecast` library crate.
//!
//! The binary (`pricecast`) is a thin wrapper around this library so that:
//!
//! - the pipeline is testable without spawning processes
//! - a scheduler or dashboard can call `PipelineOrchestrator::run` and the
//!   store's read interface directly

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fallback;
pub mod features;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
pub mod validate;
