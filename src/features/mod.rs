//! Feature assembly: one feature vector per (product, target hour).

pub mod builder;

pub use builder::*;
