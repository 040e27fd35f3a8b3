//! Tracking of live connections for broadcast fan-out.

use crate::connection::ConnectionHandle;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// The set of currently connected peers on one side of a node.
///
/// Cloning is cheap; all clones share the same set.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<u64, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a connection.
    pub fn insert(&self, handle: ConnectionHandle) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id(), handle);
    }

    /// Stop tracking a connection.
    pub fn remove(&self, id: u64) -> Option<ConnectionHandle> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no connection is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Emit an event to every tracked connection.
    ///
    /// Each emit is best effort and non-blocking, so one slow peer cannot hold
    /// up the others. Returns how many connections accepted the message.
    pub fn broadcast(&self, event: &str, payload: impl Serialize) -> usize {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Failed to serialize {} broadcast: {}", event, e);
                return 0;
            }
        };

        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let delivered = connections
            .values()
            .filter(|handle| handle.emit(event, &payload))
            .count();

        tracing::debug!(
            "Broadcast {} to {}/{} connection(s)",
            event,
            delivered,
            connections.len()
        );
        delivered
    }
}
