//! Tierline Engine - a three-tier request relay
//!
//! Each tier runs as its own node and talks to the next over a framed event
//! channel. Calls flow down and replies flow back up, matched by correlation
//! id; broadcasts flow up unsolicited.
//!
//! # Architecture
//!
//! ```text
//!  HTTP clients      subscribers
//!        │                │
//!        ▼                ▼
//!  ┌──────────────────────────────┐
//!  │ Edge        (HTTP + events)  │  get-users / create-user
//!  └──────────────────────────────┘
//!        │  app:*        ▲  app:*-result, app:user-created,
//!        ▼               │  app:db-stats, app:status
//!  ┌──────────────────────────────┐
//!  │ Coordinator (operations)     │  operation → SQL
//!  └──────────────────────────────┘
//!        │  db:query     ▲  db:result, db:stats
//!        ▼               │
//!  ┌──────────────────────────────┐
//!  │ Storage     (in-memory SQL)  │
//!  └──────────────────────────────┘
//! ```

pub mod config;
pub mod coordinator;
pub mod edge;
pub mod error;
pub mod protocol;
pub mod storage;
mod task;

pub use config::TierlineConfig;
pub use coordinator::CoordinatorNode;
pub use edge::EdgeNode;
pub use error::{CallError, NodeError};
pub use storage::StorageNode;
