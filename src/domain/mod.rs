//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - typed model keys (`Product`, `HourEnding`, `ModelKey`)
//! - model and feature inputs (`ModelSpec`, `FeatureVector`)
//! - forecast outputs (`ForecastRecord`, `ForecastBatch`, `FallbackRecord`)
//! - run configuration (`PipelineConfig`)

pub mod config;
pub mod types;

pub use config::*;
pub use types::*;
