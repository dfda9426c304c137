//! Model registry and execution.
//!
//! Models are linear and supplied from outside; this module only looks them up
//! and turns them into probabilistic forecasts.

pub mod forecaster;
pub mod registry;

pub use forecaster::*;
pub use registry::*;
