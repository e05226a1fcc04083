/// Persistence layer
///
/// Owns the SQLite pool and schema. Entity-specific queries live next to their
/// domain (`workflow::storage`, `drip::storage`).

pub mod database;

pub use database::{checked_after, from_millis, opt_from_millis, to_millis, Database, MAX_DELAY_DAYS};
