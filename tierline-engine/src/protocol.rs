//! Event names and payload schemas for every hop of the chain.
//!
//! Payloads travel as JSON values inside [`RelayMessage`](tierline_client::RelayMessage)
//! envelopes; each node decodes them into the structs below before acting on
//! them, so a malformed payload is rejected at the boundary where it arrives.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tierline_client::CallId;

/// Event names.
pub mod events {
    // Coordinator -> storage
    pub const DB_QUERY: &str = "db:query";
    // Storage -> coordinator
    pub const DB_RESULT: &str = "db:result";
    pub const DB_STATS: &str = "db:stats";

    // Edge -> coordinator
    pub const APP_GET_USERS: &str = "app:get-users";
    pub const APP_CREATE_USER: &str = "app:create-user";
    // Coordinator -> edge
    pub const APP_USERS_RESULT: &str = "app:users-result";
    pub const APP_CREATE_USER_RESULT: &str = "app:create-user-result";
    pub const APP_USER_CREATED: &str = "app:user-created";
    pub const APP_DB_STATS: &str = "app:db-stats";
    pub const APP_STATUS: &str = "app:status";

    // Subscriber -> edge
    pub const GET_USERS: &str = "get-users";
    pub const CREATE_USER: &str = "create-user";
    // Edge -> subscriber
    pub const USERS_DATA: &str = "users-data";
    pub const USER_CREATED_RESPONSE: &str = "user-created-response";
    pub const USER_CREATED: &str = "user-created";
    pub const DB_STATS_UPDATE: &str = "db-stats";
    pub const APP_STATUS_UPDATE: &str = "app-status";
}

/// Read a correlation id out of a payload that failed to decode as a whole.
pub fn readable_call_id(payload: &Value, field: &str) -> Option<CallId> {
    payload
        .get(field)
        .and_then(|id| serde_json::from_value(id.clone()).ok())
}

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// `db:query` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query_id: CallId,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Successful outcome of one statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryData {
    /// Rows produced by a read statement.
    Rows(Vec<Row>),
    /// Effect of a write statement.
    Write {
        #[serde(rename = "lastID")]
        last_id: i64,
        changes: u64,
    },
}

/// `db:result` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub query_id: CallId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<QueryData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    #[must_use]
    pub fn ok(query_id: CallId, data: QueryData) -> Self {
        Self {
            query_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(query_id: CallId, error: impl Into<String>) -> Self {
        Self {
            query_id,
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Collapse into the statement outcome.
    ///
    /// # Errors
    ///
    /// Returns the reported error message when `success` is false, or a
    /// description of the problem when a successful result carries no data.
    pub fn into_outcome(self) -> Result<QueryData, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err("query succeeded without data".to_string()),
            (false, _) => Err(self.error.unwrap_or_else(|| "unknown error".to_string())),
        }
    }
}

/// `db:stats` / `app:db-stats` / `db-stats` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbStats {
    pub user_count: u64,
    pub timestamp: String,
}

/// `app:status` / `app-status` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppStatus {
    pub status: String,
    pub connections: usize,
    pub timestamp: String,
}

/// A stored user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub created_at: String,
}

/// Input for `create-user`; `id` and `created_at` are assigned by storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

impl NewUser {
    /// Reject records with a blank name or email.
    ///
    /// # Errors
    ///
    /// Returns a caller-facing message naming the first missing field.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".to_string());
        }
        if self.email.trim().is_empty() {
            return Err("email is required".to_string());
        }
        Ok(())
    }
}

/// `app:get-users` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUsersCall {
    pub request_id: CallId,
}

/// `app:create-user` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserCall {
    pub request_id: CallId,
    pub user: NewUser,
}

/// A reply body tagged with the id of the call it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppReply<T> {
    pub request_id: CallId,
    #[serde(flatten)]
    pub reply: T,
}

/// Reply body of `get-users`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsersReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<User>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UsersReply {
    #[must_use]
    pub fn ok(users: Vec<User>) -> Self {
        Self {
            success: true,
            users: Some(users),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            users: None,
            error: Some(error.into()),
        }
    }

    /// # Errors
    ///
    /// Returns the reported error message for a failed reply.
    pub fn into_result(self) -> Result<Vec<User>, String> {
        if self.success {
            Ok(self.users.unwrap_or_default())
        } else {
            Err(self.error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

/// Reply body of `create-user`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateUserReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CreateUserReply {
    #[must_use]
    pub fn ok(user: User) -> Self {
        Self {
            success: true,
            user: Some(user),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            user: None,
            error: Some(error.into()),
        }
    }

    /// # Errors
    ///
    /// Returns the reported error message for a failed reply, or when a
    /// successful reply carries no record.
    pub fn into_result(self) -> Result<User, String> {
        match (self.success, self.user) {
            (true, Some(user)) => Ok(user),
            (true, None) => Err("reply carried no user".to_string()),
            (false, _) => Err(self.error.unwrap_or_else(|| "unknown error".to_string())),
        }
    }
}

/// Current UTC time as RFC 3339 with millisecond precision.
#[must_use]
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
