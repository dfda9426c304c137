//! Input data: the standardized dataset consumed by feature assembly.

pub mod dataset;

pub use dataset::*;
