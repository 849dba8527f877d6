//! SQLite storage layer.
//!
//! Session state persisted in SQLite with WAL mode and split read/write
//! connection pools.

pub mod pool;
pub mod state;
