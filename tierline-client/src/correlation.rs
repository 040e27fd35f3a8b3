//! Pending-call correlation.
//!
//! A node that calls its downstream peer registers a [`Continuation`] under a
//! freshly generated [`CallId`], embeds the id in the outgoing event, and
//! resolves the entry when a reply carrying the same id comes back on the
//! channel. Replies may arrive in any order, interleaved with broadcasts.
//!
//! Guarantees:
//! - ids are unique for the lifetime of the table (monotonic counter)
//! - resolving removes the entry before the continuation fires, so each
//!   continuation fires at most once
//! - resolving an unknown id is a silent no-op (late or duplicate reply)
//!
//! Entries whose reply never arrives stay resident unless the owner runs
//! [`PendingCalls::expire`] (see [`PendingCalls::spawn_expiry`]).

use crate::connection::ConnectionHandle;
use crate::error::CorrelationError;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Identifier linking a call to its reply.
///
/// Serialized as a bare integer (`requestId` / `queryId` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do with a reply once it arrives.
#[derive(Debug)]
pub enum Continuation<R> {
    /// Complete an HTTP request that is awaiting the reply.
    RespondHttp(oneshot::Sender<R>),
    /// Emit the reply as `event` on a persistent connection.
    EmitToConnection {
        connection: ConnectionHandle,
        event: &'static str,
    },
    /// Resolve an internal future awaiting the reply.
    ResolveFuture(oneshot::Sender<R>),
}

impl<R: Serialize> Continuation<R> {
    /// Deliver `result` to the waiting party.
    ///
    /// Returns `false` when the destination is already gone (dropped receiver
    /// or closed connection); that case is not an error.
    pub fn fire(self, result: R) -> bool {
        match self {
            Self::RespondHttp(tx) | Self::ResolveFuture(tx) => tx.send(result).is_ok(),
            Self::EmitToConnection { connection, event } => connection.emit(event, &result),
        }
    }

    /// Short name of the continuation kind, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RespondHttp(_) => "respond-http",
            Self::EmitToConnection { .. } => "emit-to-connection",
            Self::ResolveFuture(_) => "resolve-future",
        }
    }
}

struct PendingEntry<R> {
    continuation: Continuation<R>,
    registered_at: Instant,
}

/// Node-local table of in-flight calls.
pub struct PendingCalls<R> {
    next_id: AtomicU64,
    entries: Mutex<HashMap<CallId, PendingEntry<R>>>,
}

impl<R> Default for PendingCalls<R> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<R: Serialize> PendingCalls<R> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh call id.
    pub fn next_id(&self) -> CallId {
        CallId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a continuation under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::DuplicateCall`] if `id` is already pending.
    /// Ids from [`next_id`](Self::next_id) never collide, so this indicates a
    /// caller bug.
    pub fn register(&self, id: CallId, continuation: Continuation<R>) -> Result<(), CorrelationError> {
        match self.lock().entry(id) {
            Entry::Occupied(_) => Err(CorrelationError::DuplicateCall(id)),
            Entry::Vacant(slot) => {
                tracing::debug!("Registered call {} ({})", id, continuation.kind());
                slot.insert(PendingEntry {
                    continuation,
                    registered_at: Instant::now(),
                });
                Ok(())
            }
        }
    }

    /// Generate an id and register `continuation` under it.
    ///
    /// # Errors
    ///
    /// Returns an error only if the generated id is already taken by a manual
    /// [`register`](Self::register).
    pub fn dispatch(&self, continuation: Continuation<R>) -> Result<CallId, CorrelationError> {
        let id = self.next_id();
        self.register(id, continuation)?;
        Ok(id)
    }

    /// Fire and remove the continuation registered under `id`.
    ///
    /// Returns `false` if no call with this id is pending.
    pub fn resolve(&self, id: CallId, result: R) -> bool {
        let entry = self.lock().remove(&id);
        let Some(entry) = entry else {
            tracing::debug!("Dropping reply for unknown call {}", id);
            return false;
        };

        let kind = entry.continuation.kind();
        if !entry.continuation.fire(result) {
            tracing::debug!("Caller of call {} ({}) is gone", id, kind);
        }
        true
    }

    /// Evict calls pending for at least `max_age`, firing each with the
    /// result produced by `on_timeout`.
    ///
    /// Returns the number of evicted calls.
    pub fn expire(&self, max_age: Duration, on_timeout: impl Fn(CallId) -> R) -> usize {
        let now = Instant::now();
        let expired: Vec<(CallId, PendingEntry<R>)> = {
            let mut entries = self.lock();
            let ids: Vec<CallId> = entries
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.registered_at) >= max_age)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            tracing::warn!("Call {} timed out after {:?}", id, max_age);
            entry.continuation.fire(on_timeout(id));
        }
        count
    }

    /// Whether a call with this id is pending.
    #[must_use]
    pub fn contains(&self, id: CallId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of pending calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no call is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, PendingEntry<R>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Serialize + Send + 'static> PendingCalls<R> {
    /// Periodically expire calls older than `max_age`.
    ///
    /// The sweep runs every `max_age / 2` (at least every 100ms) until the
    /// returned task is aborted.
    pub fn spawn_expiry(
        self: Arc<Self>,
        max_age: Duration,
        on_timeout: fn(CallId) -> R,
    ) -> JoinHandle<()> {
        let period = (max_age / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.expire(max_age, on_timeout);
            }
        })
    }
}
