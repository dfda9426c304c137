//! Mathematical utilities: linear model evaluation.

pub mod linear;

pub use linear::*;
