//! Coordinator tier: turns application calls from edge nodes into storage
//! queries and relays storage broadcasts upward.

pub mod operations;

pub use operations::{StorageClient, UserOperations};

use crate::config::CoordinatorConfig;
use crate::error::NodeError;
use crate::protocol::{
    events, readable_call_id, timestamp_now, AppReply, AppStatus, CreateUserCall,
    CreateUserReply, DbStats, GetUsersCall, QueryResult, UsersReply,
};
use crate::task::AbortOnDrop;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tierline_client::{
    connect, Connection, ConnectionHandle, ConnectionRegistry, EventListener, MessageStream,
    PendingCalls, WireFormat,
};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// Name stamped on every event this node emits.
pub const SOURCE: &str = "coordinator";

/// The coordinator tier.
pub struct CoordinatorNode {
    listener: EventListener,
    storage: Connection,
    status_interval: Duration,
    call_timeout: Option<Duration>,
}

impl CoordinatorNode {
    /// Connect to the storage node and bind the edge listener.
    ///
    /// # Errors
    ///
    /// Returns an error if storage is unreachable or the address cannot be
    /// bound. There is no retry.
    pub async fn bind(config: &CoordinatorConfig, format: WireFormat) -> Result<Self, NodeError> {
        let storage = connect(&config.storage_addr, SOURCE, format)
            .await
            .map_err(|source| NodeError::Connect {
                peer: "storage",
                source,
            })?;
        info!("Connected to storage node at {}", config.storage_addr);

        let listener = EventListener::bind(&config.listen, SOURCE, format)
            .await
            .map_err(|e| NodeError::bind(&config.listen, e))?;

        Ok(Self {
            listener,
            storage,
            status_interval: config.status_interval(),
            call_timeout: config.call_timeout(),
        })
    }

    /// Address edge nodes should connect to.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, NodeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve edge nodes until the task is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails to report its address.
    pub async fn run(self) -> Result<(), NodeError> {
        info!("Coordinator node listening on {}", self.local_addr()?);

        let Connection {
            handle: storage,
            stream: storage_events,
        } = self.storage;
        let pending = Arc::new(PendingCalls::<QueryResult>::new());
        let edges = ConnectionRegistry::new();
        let operations = Arc::new(UserOperations::new(StorageClient::new(
            storage,
            Arc::clone(&pending),
        )));

        let mut background = vec![
            AbortOnDrop(tokio::spawn(relay_storage_events(
                storage_events,
                Arc::clone(&pending),
                edges.clone(),
            ))),
            AbortOnDrop(tokio::spawn(broadcast_status(
                edges.clone(),
                self.status_interval,
            ))),
        ];
        if let Some(max_age) = self.call_timeout {
            background.push(AbortOnDrop(Arc::clone(&pending).spawn_expiry(
                max_age,
                |query_id| QueryResult::failed(query_id, "storage query timed out"),
            )));
        }

        loop {
            match self.listener.accept().await {
                Ok(connection) => {
                    tokio::spawn(serve_edge(
                        connection,
                        Arc::clone(&operations),
                        edges.clone(),
                    ));
                }
                Err(e) => warn!("Failed to accept edge connection: {}", e),
            }
        }
    }
}

/// Route `db:result` replies to pending calls and relay `db:stats` upward.
async fn relay_storage_events(
    mut stream: MessageStream,
    pending: Arc<PendingCalls<QueryResult>>,
    edges: ConnectionRegistry,
) {
    while let Some(message) = stream.next().await {
        match message.event() {
            events::DB_RESULT => match message.payload_as::<QueryResult>() {
                Ok(result) => {
                    pending.resolve(result.query_id, result);
                }
                Err(e) => warn!("Malformed db:result: {}", e),
            },
            events::DB_STATS => match message.payload_as::<DbStats>() {
                Ok(stats) => {
                    edges.broadcast(events::APP_DB_STATS, &stats);
                }
                Err(e) => warn!("Malformed db:stats: {}", e),
            },
            other => debug!("Ignoring {} from storage", other),
        }
    }
    error!("Lost connection to storage node");
}

async fn broadcast_status(edges: ConnectionRegistry, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let status = AppStatus {
            status: "healthy".to_string(),
            connections: edges.len(),
            timestamp: timestamp_now(),
        };
        edges.broadcast(events::APP_STATUS, &status);
    }
}

async fn serve_edge(
    connection: Connection,
    operations: Arc<UserOperations>,
    edges: ConnectionRegistry,
) {
    let Connection { handle, mut stream } = connection;
    info!("Edge node connected from {}", handle.peer_addr());
    edges.insert(handle.clone());

    while let Some(message) = stream.next().await {
        match message.event() {
            events::APP_GET_USERS => match message.payload_as::<GetUsersCall>() {
                Ok(call) => {
                    tokio::spawn(get_users(call, Arc::clone(&operations), handle.clone()));
                }
                Err(e) => {
                    warn!("Malformed app:get-users from {}: {}", handle.peer_addr(), e);
                    if let Some(request_id) = readable_call_id(message.payload(), "requestId") {
                        handle.emit(
                            events::APP_USERS_RESULT,
                            AppReply {
                                request_id,
                                reply: UsersReply::failed(format!("malformed call: {e}")),
                            },
                        );
                    }
                }
            },
            events::APP_CREATE_USER => match message.payload_as::<CreateUserCall>() {
                Ok(call) => {
                    tokio::spawn(create_user(
                        call,
                        Arc::clone(&operations),
                        handle.clone(),
                        edges.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Malformed app:create-user from {}: {}", handle.peer_addr(), e);
                    if let Some(request_id) = readable_call_id(message.payload(), "requestId") {
                        handle.emit(
                            events::APP_CREATE_USER_RESULT,
                            AppReply {
                                request_id,
                                reply: CreateUserReply::failed(format!("malformed call: {e}")),
                            },
                        );
                    }
                }
            },
            other => debug!("Ignoring {} from {}", other, handle.peer_addr()),
        }
    }

    edges.remove(handle.id());
    info!("Edge node {} disconnected", handle.peer_addr());
}

async fn get_users(call: GetUsersCall, operations: Arc<UserOperations>, caller: ConnectionHandle) {
    let reply = match operations.get_users().await {
        Ok(users) => UsersReply::ok(users),
        Err(e) => {
            warn!("get-users {} failed: {}", call.request_id, e);
            UsersReply::failed(e.to_string())
        }
    };
    caller.emit(
        events::APP_USERS_RESULT,
        AppReply {
            request_id: call.request_id,
            reply,
        },
    );
}

/// Insert, broadcast the new record to every edge, then answer the caller.
async fn create_user(
    call: CreateUserCall,
    operations: Arc<UserOperations>,
    caller: ConnectionHandle,
    edges: ConnectionRegistry,
) {
    let reply = match operations.create_user(&call.user).await {
        Ok(user) => {
            info!("Created user {} ({})", user.id, user.email);
            edges.broadcast(events::APP_USER_CREATED, &user);
            CreateUserReply::ok(user)
        }
        Err(e) => {
            warn!("create-user {} failed: {}", call.request_id, e);
            CreateUserReply::failed(e.to_string())
        }
    };
    caller.emit(
        events::APP_CREATE_USER_RESULT,
        AppReply {
            request_id: call.request_id,
            reply,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::protocol::{NewUser, User};
    use crate::storage::StorageNode;
    use serde_json::json;
    use tierline_client::{CallId, RelayMessage};

    async fn chain(
        status_interval_secs: u64,
    ) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        let storage = StorageNode::bind(
            &StorageConfig {
                listen: "127.0.0.1:0".to_string(),
                stats_interval_secs: 60,
            },
            WireFormat::Messagepack,
        )
        .await?;
        let storage_addr = storage.local_addr()?.to_string();
        tokio::spawn(storage.run());

        let coordinator = CoordinatorNode::bind(
            &CoordinatorConfig {
                listen: "127.0.0.1:0".to_string(),
                storage_addr,
                status_interval_secs,
                call_timeout_secs: None,
            },
            WireFormat::Messagepack,
        )
        .await?;
        let addr = coordinator.local_addr()?;
        tokio::spawn(coordinator.run());
        Ok(addr)
    }

    async fn next_event(
        connection: &mut Connection,
        event: &str,
    ) -> Result<RelayMessage, Box<dyn std::error::Error>> {
        let deadline = Duration::from_secs(5);
        loop {
            let message = tokio::time::timeout(deadline, connection.stream.next())
                .await?
                .ok_or("coordinator closed")?;
            if message.event() == event {
                return Ok(message);
            }
        }
    }

    #[tokio::test]
    async fn test_get_users_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let addr = chain(60).await?.to_string();
        let mut edge = connect(&addr, "edge", WireFormat::Messagepack).await?;

        edge.handle.emit(events::APP_GET_USERS, json!({"requestId": 41}));
        let reply: AppReply<UsersReply> =
            next_event(&mut edge, events::APP_USERS_RESULT).await?.payload_as()?;

        assert_eq!(reply.request_id, CallId::new(41));
        assert_eq!(reply.reply.into_result()?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_user_broadcasts_before_reply() -> Result<(), Box<dyn std::error::Error>> {
        let addr = chain(60).await?.to_string();
        let mut caller = connect(&addr, "edge", WireFormat::Messagepack).await?;
        let mut observer = connect(&addr, "edge", WireFormat::Messagepack).await?;
        // Both edges registered before the call goes out.
        tokio::time::sleep(Duration::from_millis(50)).await;

        caller.handle.emit(
            events::APP_CREATE_USER,
            CreateUserCall {
                request_id: CallId::new(1),
                user: NewUser {
                    name: "Ada".to_string(),
                    email: "ada@example.com".to_string(),
                },
            },
        );

        let first = tokio::time::timeout(Duration::from_secs(5), caller.stream.next())
            .await?
            .ok_or("coordinator closed")?;
        assert_eq!(first.event(), events::APP_USER_CREATED);
        let broadcast: User = first.payload_as()?;

        let reply: AppReply<CreateUserReply> =
            next_event(&mut caller, events::APP_CREATE_USER_RESULT).await?.payload_as()?;
        assert_eq!(reply.reply.into_result()?, broadcast);

        let observed: User = next_event(&mut observer, events::APP_USER_CREATED)
            .await?
            .payload_as()?;
        assert_eq!(observed, broadcast);
        Ok(())
    }

    #[tokio::test]
    async fn test_interleaved_calls_resolve_by_id() -> Result<(), Box<dyn std::error::Error>> {
        let addr = chain(60).await?.to_string();
        let mut edge = connect(&addr, "edge", WireFormat::Messagepack).await?;

        for request_id in 1..=5 {
            edge.handle
                .emit(events::APP_GET_USERS, json!({ "requestId": request_id }));
        }

        let mut seen = Vec::new();
        while seen.len() < 5 {
            let reply: AppReply<UsersReply> =
                next_event(&mut edge, events::APP_USERS_RESULT).await?.payload_as()?;
            assert!(reply.reply.success);
            seen.push(reply.request_id.get());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn test_status_broadcast_counts_edges() -> Result<(), Box<dyn std::error::Error>> {
        let addr = chain(1).await?.to_string();
        let mut edge = connect(&addr, "edge", WireFormat::Messagepack).await?;

        let status: AppStatus = next_event(&mut edge, events::APP_STATUS).await?.payload_as()?;
        assert_eq!(status.status, "healthy");
        assert_eq!(status.connections, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_calls_with_id_get_failure() -> Result<(), Box<dyn std::error::Error>> {
        let addr = chain(60).await?.to_string();
        let mut edge = connect(&addr, "edge", WireFormat::Messagepack).await?;

        edge.handle.emit(
            events::APP_CREATE_USER,
            json!({"requestId": 9, "user": {"name": 5, "email": "a@x.com"}}),
        );
        let created: AppReply<CreateUserReply> =
            next_event(&mut edge, events::APP_CREATE_USER_RESULT).await?.payload_as()?;
        assert_eq!(created.request_id, CallId::new(9));
        assert!(!created.reply.success);

        // No id to answer to: dropped, and the connection keeps serving.
        edge.handle.emit(events::APP_GET_USERS, json!({"requestId": "ten"}));
        edge.handle.emit(events::APP_GET_USERS, json!({"requestId": 10}));
        let listed: AppReply<UsersReply> =
            next_event(&mut edge, events::APP_USERS_RESULT).await?.payload_as()?;
        assert_eq!(listed.request_id, CallId::new(10));
        assert!(listed.reply.success);
        Ok(())
    }
}
