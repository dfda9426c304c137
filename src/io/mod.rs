//! Forecast persistence.
//!
//! - persisted row layout and schema checks (`schema`)
//! - discovery index and latest pointers (`index`)
//! - per-date run locks (`lock`)
//! - the file-backed store itself (`store`)

pub mod index;
pub mod lock;
pub mod schema;
pub mod store;

pub use index::*;
pub use lock::*;
pub use schema::*;
pub use store::*;
