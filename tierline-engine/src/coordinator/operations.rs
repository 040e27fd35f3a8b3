//! Translation of application operations into storage queries.

use crate::error::CallError;
use crate::protocol::{events, NewUser, QueryData, QueryRequest, QueryResult, User};
use serde_json::Value;
use std::sync::Arc;
use tierline_client::{ConnectionHandle, Continuation, PendingCalls};
use tokio::sync::oneshot;

pub const LIST_USERS_SQL: &str = "SELECT * FROM users ORDER BY created_at DESC, id DESC";
pub const INSERT_USER_SQL: &str = "INSERT INTO users (name, email) VALUES (?, ?)";
pub const SELECT_USER_SQL: &str = "SELECT * FROM users WHERE id = ?";

/// Issues `db:query` calls and awaits their `db:result`.
#[derive(Clone)]
pub struct StorageClient {
    connection: ConnectionHandle,
    pending: Arc<PendingCalls<QueryResult>>,
}

impl StorageClient {
    #[must_use]
    pub fn new(connection: ConnectionHandle, pending: Arc<PendingCalls<QueryResult>>) -> Self {
        Self {
            connection,
            pending,
        }
    }

    /// Run one statement on the storage node.
    ///
    /// # Errors
    ///
    /// Returns the storage node's error message, or [`CallError::Abandoned`]
    /// if the call was dropped without a reply.
    pub async fn query(&self, sql: &str, params: Vec<Value>) -> Result<QueryData, CallError> {
        let (tx, rx) = oneshot::channel();
        let query_id = self.pending.dispatch(Continuation::ResolveFuture(tx))?;

        let request = QueryRequest {
            query_id,
            sql: sql.to_string(),
            params,
        };
        if !self.connection.emit(events::DB_QUERY, &request) {
            self.pending.resolve(
                query_id,
                QueryResult::failed(query_id, "storage node unreachable"),
            );
        }

        let result = rx.await.map_err(|_| CallError::Abandoned)?;
        result.into_outcome().map_err(CallError::Remote)
    }
}

/// The coordinator's two operations.
pub struct UserOperations {
    storage: StorageClient,
}

impl UserOperations {
    #[must_use]
    pub fn new(storage: StorageClient) -> Self {
        Self { storage }
    }

    /// All users, newest first.
    pub async fn get_users(&self) -> Result<Vec<User>, CallError> {
        let data = self.storage.query(LIST_USERS_SQL, Vec::new()).await?;
        users_from(data)
    }

    /// Insert a user and read the stored record back.
    pub async fn create_user(&self, user: &NewUser) -> Result<User, CallError> {
        let written = self
            .storage
            .query(
                INSERT_USER_SQL,
                vec![Value::from(user.name.as_str()), Value::from(user.email.as_str())],
            )
            .await?;
        let QueryData::Write { last_id, .. } = written else {
            return Err(CallError::Malformed("insert returned rows".to_string()));
        };

        let rows = self
            .storage
            .query(SELECT_USER_SQL, vec![Value::from(last_id)])
            .await?;
        users_from(rows)?
            .into_iter()
            .next()
            .ok_or_else(|| CallError::Remote("created user not found".to_string()))
    }
}

fn users_from(data: QueryData) -> Result<Vec<User>, CallError> {
    let QueryData::Rows(rows) = data else {
        return Err(CallError::Malformed("expected rows".to_string()));
    };
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(Value::Object(row)).map_err(|e| CallError::Malformed(e.to_string()))
        })
        .collect()
}
