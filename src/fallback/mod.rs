//! Fallback: substitute a prior stored forecast when generation fails.

pub mod coordinator;

pub use coordinator::*;
