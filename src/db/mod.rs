//! Database module.
//!
//! Provides SQLite storage with embedded migrations and Parquet archival.

mod archive;
mod models;
mod store;

pub use archive::*;
pub use models::*;
pub use store::*;
