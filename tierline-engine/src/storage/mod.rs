//! Storage tier: executes SQL against the `users` table.
//!
//! - [`QueryExecutor`] abstracts statement execution
//! - [`SqliteExecutor`] backs it with an in-memory SQLite database
//! - [`StorageNode`] serves `db:query` calls from coordinators and broadcasts
//!   `db:stats` snapshots

pub mod node;
pub mod sqlite;

pub use node::StorageNode;
pub use sqlite::SqliteExecutor;

use crate::protocol::QueryData;
use serde_json::Value;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Unsupported query parameter: {0}")]
    UnsupportedParameter(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Trait for statement execution backends.
pub trait QueryExecutor: Send + Sync {
    /// Execute one statement with positional parameters.
    ///
    /// Reads return their rows; anything else returns the last inserted row
    /// id and the number of changed rows.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryData, StorageError>;

    /// Number of rows in the `users` table.
    fn user_count(&self) -> Result<u64, StorageError>;
}
