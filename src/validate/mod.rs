//! Forecast validation.
//!
//! Four ordered checks over a whole batch:
//!
//! - completeness: every expected key present exactly once
//! - plausibility: values inside the product band and the outlier guard
//! - consistency: cross-product ordering rules
//! - schema: records survive the persisted row format
//!
//! Every check is a pure function of the batch and a `ValidationContext`.

pub mod checks;

pub use checks::*;
