//! SQLite-backed [`DurableStore`](crate::DurableStore).
//!
//! Sums are kept in one table, `sum_table(key TEXT PRIMARY KEY, sum INTEGER)`. Each
//! upsert is a single `INSERT .. ON CONFLICT DO UPDATE` statement, so concurrent flushes
//! for the same key add up instead of overwriting each other.

mod sqlite_sum_store;
pub use sqlite_sum_store::*;
