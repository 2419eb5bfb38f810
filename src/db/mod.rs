//! Database module for linkwatch.
//!
//! Provides SQLite storage for downtime intervals and the notification log.

mod models;
mod store;

pub use models::*;
pub use store::*;
