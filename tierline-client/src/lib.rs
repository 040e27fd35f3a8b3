//! Tierline Client Library
//!
//! Building blocks shared by every Tierline node and by external subscribers:
//!
//! - [`RelayMessage`] - the envelope carried by every event
//! - [`connect`] / [`EventListener`] - framed TCP event channels
//! - [`ConnectionHandle`] / [`MessageStream`] - outbound and inbound halves of a channel
//! - [`ConnectionRegistry`] - live connections and broadcast fan-out
//! - [`PendingCalls`] - correlation of downstream calls with their replies
//!
//! # Example: calling a downstream peer
//!
//! ```rust,ignore
//! use tierline_client::{connect, Continuation, PendingCalls, WireFormat};
//! use tokio::sync::oneshot;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut storage = connect("127.0.0.1:3002", "coordinator", WireFormat::default()).await?;
//!     let pending = PendingCalls::<serde_json::Value>::new();
//!
//!     let (tx, rx) = oneshot::channel();
//!     let query_id = pending.dispatch(Continuation::ResolveFuture(tx))?;
//!     storage.handle.emit("db:query", serde_json::json!({
//!         "queryId": query_id,
//!         "sql": "SELECT * FROM users",
//!         "params": [],
//!     }));
//!
//!     while let Some(msg) = storage.stream.next().await {
//!         if msg.event() == "db:result" {
//!             let id = serde_json::from_value(msg.payload["queryId"].clone())?;
//!             pending.resolve(id, msg.payload.clone());
//!             break;
//!         }
//!     }
//!     println!("{}", rx.await?);
//!     Ok(())
//! }
//! ```

mod connection;
mod correlation;
mod error;
mod message;
mod registry;
mod stream;

pub use connection::{connect, Connection, ConnectionHandle, EventListener, MAX_FRAME_SIZE};
pub use correlation::{CallId, Continuation, PendingCalls};
pub use error::{ClientError, CorrelationError};
pub use message::{RelayMessage, WireFormat};
pub use registry::ConnectionRegistry;
pub use stream::MessageStream;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
