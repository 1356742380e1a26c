//! # Drover Persistence
//!
//! Durable [`JobStore`](drover_queue::JobStore) implementations.
//!
//! Supports:
//! - SQLite (single node, or several processes sharing one database file)

pub mod sqlite;

pub use sqlite::{SqliteConfig, SqliteJobStore};
