//! Edge tier: the HTTP API and the subscriber port.
//!
//! Every request becomes one call on the coordinator channel. HTTP requests
//! wait for the reply on a oneshot; subscriber requests get the reply emitted
//! back on their own connection. Coordinator broadcasts are renamed and fanned
//! out to every subscriber.

mod http;

use crate::config::EdgeConfig;
use crate::error::NodeError;
use crate::protocol::{
    events, AppReply, AppStatus, CreateUserCall, CreateUserReply, DbStats, GetUsersCall, NewUser,
    User, UsersReply,
};
use crate::task::AbortOnDrop;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tierline_client::{
    connect, CallId, Connection, ConnectionHandle, ConnectionRegistry, Continuation,
    EventListener, MessageStream, PendingCalls, WireFormat,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Name stamped on every event this node emits.
pub const SOURCE: &str = "edge";

/// Reply to an edge call, as delivered to its continuation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CallReply {
    Users(UsersReply),
    CreatedUser(CreateUserReply),
    /// The call expired or could not be sent.
    Failed(FailedCall),
}

/// `{success:false, error}` body for a call that never got a reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedCall {
    pub success: bool,
    pub error: String,
}

impl CallReply {
    fn timed_out(request_id: CallId) -> Self {
        Self::Failed(FailedCall {
            success: false,
            error: format!("request {request_id} timed out"),
        })
    }

    fn failed(message: &str) -> Self {
        Self::Failed(FailedCall {
            success: false,
            error: message.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns the failure message carried by the reply.
    pub fn into_users(self) -> Result<Vec<User>, String> {
        match self {
            Self::Users(reply) => reply.into_result(),
            Self::CreatedUser(_) => Err("mismatched reply".to_string()),
            Self::Failed(reply) => Err(reply.error),
        }
    }

    /// # Errors
    ///
    /// Returns the failure message carried by the reply.
    pub fn into_user(self) -> Result<User, String> {
        match self {
            Self::CreatedUser(reply) => reply.into_result(),
            Self::Users(_) => Err("mismatched reply".to_string()),
            Self::Failed(reply) => Err(reply.error),
        }
    }
}

/// State shared by the HTTP handlers and subscriber connections.
pub(crate) struct EdgeState {
    coordinator: ConnectionHandle,
    pending: Arc<PendingCalls<CallReply>>,
    subscribers: ConnectionRegistry,
}

impl EdgeState {
    /// Send `app:get-users`; the reply fires `continuation`.
    pub(crate) fn get_users(&self, continuation: Continuation<CallReply>) {
        match self.pending.dispatch(continuation) {
            Ok(request_id) => {
                self.send_call(request_id, events::APP_GET_USERS, &GetUsersCall { request_id });
            }
            Err(e) => error!("Failed to register get-users call: {}", e),
        }
    }

    /// Send `app:create-user`; the reply fires `continuation`.
    pub(crate) fn create_user(&self, user: NewUser, continuation: Continuation<CallReply>) {
        match self.pending.dispatch(continuation) {
            Ok(request_id) => {
                self.send_call(
                    request_id,
                    events::APP_CREATE_USER,
                    &CreateUserCall { request_id, user },
                );
            }
            Err(e) => error!("Failed to register create-user call: {}", e),
        }
    }

    fn send_call(&self, request_id: CallId, event: &str, payload: impl Serialize) {
        debug!("Calling {} as request {}", event, request_id);
        if !self.coordinator.emit(event, payload) {
            self.pending
                .resolve(request_id, CallReply::failed("coordinator node unreachable"));
        }
    }
}

/// The edge tier.
pub struct EdgeNode {
    http: TcpListener,
    subscribers: EventListener,
    coordinator: Connection,
    call_timeout: Option<std::time::Duration>,
}

impl EdgeNode {
    /// Connect to the coordinator and bind both listeners.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator is unreachable or an address
    /// cannot be bound. There is no retry.
    pub async fn bind(config: &EdgeConfig, format: WireFormat) -> Result<Self, NodeError> {
        let coordinator = connect(&config.coordinator_addr, SOURCE, format)
            .await
            .map_err(|source| NodeError::Connect {
                peer: "coordinator",
                source,
            })?;
        info!("Connected to coordinator node at {}", config.coordinator_addr);

        let http = TcpListener::bind(&config.http_listen)
            .await
            .map_err(|source| NodeError::Bind {
                addr: config.http_listen.clone(),
                source,
            })?;
        let subscribers = EventListener::bind(&config.subscriber_listen, SOURCE, format)
            .await
            .map_err(|e| NodeError::bind(&config.subscriber_listen, e))?;

        Ok(Self {
            http,
            subscribers,
            coordinator,
            call_timeout: config.call_timeout(),
        })
    }

    /// Address of the HTTP API.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has no local address.
    pub fn http_addr(&self) -> Result<SocketAddr, NodeError> {
        Ok(self.http.local_addr()?)
    }

    /// Address subscribers should connect to.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has no local address.
    pub fn subscriber_addr(&self) -> Result<SocketAddr, NodeError> {
        Ok(self.subscribers.local_addr()?)
    }

    /// Serve HTTP and subscribers until the task is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP server fails.
    pub async fn run(self) -> Result<(), NodeError> {
        info!(
            "Edge node serving HTTP on {} and subscribers on {}",
            self.http_addr()?,
            self.subscriber_addr()?
        );

        let Connection {
            handle: coordinator,
            stream: coordinator_events,
        } = self.coordinator;
        let state = Arc::new(EdgeState {
            coordinator,
            pending: Arc::new(PendingCalls::new()),
            subscribers: ConnectionRegistry::new(),
        });

        let mut background = vec![
            AbortOnDrop(tokio::spawn(relay_coordinator_events(
                coordinator_events,
                Arc::clone(&state),
            ))),
            AbortOnDrop(tokio::spawn(accept_subscribers(
                self.subscribers,
                Arc::clone(&state),
            ))),
        ];
        if let Some(max_age) = self.call_timeout {
            background.push(AbortOnDrop(
                Arc::clone(&state.pending).spawn_expiry(max_age, CallReply::timed_out),
            ));
        }

        axum::serve(self.http, http::router(state)).await?;
        Ok(())
    }
}

/// Route call replies to pending calls and fan broadcasts out to subscribers.
async fn relay_coordinator_events(mut stream: MessageStream, state: Arc<EdgeState>) {
    while let Some(message) = stream.next().await {
        match message.event() {
            events::APP_USERS_RESULT => match message.payload_as::<AppReply<UsersReply>>() {
                Ok(reply) => {
                    state
                        .pending
                        .resolve(reply.request_id, CallReply::Users(reply.reply));
                }
                Err(e) => warn!("Malformed app:users-result: {}", e),
            },
            events::APP_CREATE_USER_RESULT => {
                match message.payload_as::<AppReply<CreateUserReply>>() {
                    Ok(reply) => {
                        state
                            .pending
                            .resolve(reply.request_id, CallReply::CreatedUser(reply.reply));
                    }
                    Err(e) => warn!("Malformed app:create-user-result: {}", e),
                }
            }
            events::APP_USER_CREATED => match message.payload_as::<User>() {
                Ok(user) => {
                    state.subscribers.broadcast(events::USER_CREATED, &user);
                }
                Err(e) => warn!("Malformed app:user-created: {}", e),
            },
            events::APP_DB_STATS => match message.payload_as::<DbStats>() {
                Ok(stats) => {
                    state.subscribers.broadcast(events::DB_STATS_UPDATE, &stats);
                }
                Err(e) => warn!("Malformed app:db-stats: {}", e),
            },
            events::APP_STATUS => match message.payload_as::<AppStatus>() {
                Ok(status) => {
                    state.subscribers.broadcast(events::APP_STATUS_UPDATE, &status);
                }
                Err(e) => warn!("Malformed app:status: {}", e),
            },
            other => debug!("Ignoring {} from coordinator", other),
        }
    }
    error!("Lost connection to coordinator node");
}

async fn accept_subscribers(listener: EventListener, state: Arc<EdgeState>) {
    loop {
        match listener.accept().await {
            Ok(connection) => {
                tokio::spawn(serve_subscriber(connection, Arc::clone(&state)));
            }
            Err(e) => warn!("Failed to accept subscriber: {}", e),
        }
    }
}

async fn serve_subscriber(connection: Connection, state: Arc<EdgeState>) {
    let Connection { handle, mut stream } = connection;
    info!("Subscriber connected from {}", handle.peer_addr());
    state.subscribers.insert(handle.clone());

    while let Some(message) = stream.next().await {
        match message.event() {
            events::GET_USERS => state.get_users(Continuation::EmitToConnection {
                connection: handle.clone(),
                event: events::USERS_DATA,
            }),
            events::CREATE_USER => {
                let user = match message.payload_as::<NewUser>() {
                    Ok(user) => user,
                    Err(e) => {
                        handle.emit(
                            events::USER_CREATED_RESPONSE,
                            CreateUserReply::failed(format!("invalid create-user payload: {e}")),
                        );
                        continue;
                    }
                };
                if let Err(reason) = user.validate() {
                    handle.emit(events::USER_CREATED_RESPONSE, CreateUserReply::failed(reason));
                    continue;
                }
                state.create_user(
                    user,
                    Continuation::EmitToConnection {
                        connection: handle.clone(),
                        event: events::USER_CREATED_RESPONSE,
                    },
                );
            }
            other => debug!("Ignoring {} from subscriber {}", other, handle.peer_addr()),
        }
    }

    state.subscribers.remove(handle.id());
    info!("Subscriber {} disconnected", handle.peer_addr());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::oneshot;

    /// Edge state wired to an in-process stand-in for the coordinator.
    async fn state_with_peer(
    ) -> Result<(Arc<EdgeState>, Connection, MessageStream), Box<dyn std::error::Error>> {
        let listener = EventListener::bind("127.0.0.1:0", "coordinator", WireFormat::Json).await?;
        let addr = listener.local_addr()?.to_string();
        let (client, server) = tokio::join!(connect(&addr, SOURCE, WireFormat::Json), listener.accept());
        let client = client?;
        let state = Arc::new(EdgeState {
            coordinator: client.handle,
            pending: Arc::new(PendingCalls::new()),
            subscribers: ConnectionRegistry::new(),
        });
        Ok((state, server?, client.stream))
    }

    #[test]
    fn test_call_reply_serializes_as_body() -> Result<(), Box<dyn std::error::Error>> {
        let reply = CallReply::Users(UsersReply::ok(Vec::new()));
        assert_eq!(serde_json::to_value(&reply)?, json!({"success": true, "users": []}));

        let expired = CallReply::timed_out(CallId::new(3));
        assert_eq!(
            serde_json::to_value(&expired)?,
            json!({"success": false, "error": "request 3 timed out"})
        );
        Ok(())
    }

    #[test]
    fn test_mismatched_reply_is_failure() {
        let reply = CallReply::Users(UsersReply::ok(Vec::new()));
        assert!(reply.into_user().is_err());
    }

    #[tokio::test]
    async fn test_reply_routed_to_matching_call() -> Result<(), Box<dyn std::error::Error>> {
        let (state, mut coordinator, stream) = state_with_peer().await?;
        tokio::spawn(relay_coordinator_events(stream, Arc::clone(&state)));

        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        state.get_users(Continuation::RespondHttp(tx_a));
        state.get_users(Continuation::RespondHttp(tx_b));

        let first: GetUsersCall = coordinator.stream.next().await.ok_or("closed")?.payload_as()?;
        let second: GetUsersCall = coordinator.stream.next().await.ok_or("closed")?.payload_as()?;
        assert_ne!(first.request_id, second.request_id);

        // Answer out of order.
        coordinator.handle.emit(
            events::APP_USERS_RESULT,
            AppReply {
                request_id: second.request_id,
                reply: UsersReply::failed("second"),
            },
        );
        coordinator.handle.emit(
            events::APP_USERS_RESULT,
            AppReply {
                request_id: first.request_id,
                reply: UsersReply::failed("first"),
            },
        );

        assert_eq!(rx_a.await?.into_users(), Err("first".to_string()));
        assert_eq!(rx_b.await?.into_users(), Err("second".to_string()));
        assert!(state.pending.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_call_resolves_with_timeout() -> Result<(), Box<dyn std::error::Error>> {
        let (state, _coordinator, _stream) = state_with_peer().await?;
        let _expiry = AbortOnDrop(
            Arc::clone(&state.pending)
                .spawn_expiry(std::time::Duration::from_millis(50), CallReply::timed_out),
        );

        let (tx, rx) = oneshot::channel();
        state.get_users(Continuation::RespondHttp(tx));

        let reply = tokio::time::timeout(std::time::Duration::from_secs(2), rx).await??;
        assert!(matches!(reply, CallReply::Failed(ref t) if !t.success));
        assert!(state.pending.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_broadcasts_renamed_for_subscribers() -> Result<(), Box<dyn std::error::Error>> {
        let (state, coordinator, stream) = state_with_peer().await?;
        tokio::spawn(relay_coordinator_events(stream, Arc::clone(&state)));

        let listener = EventListener::bind("127.0.0.1:0", SOURCE, WireFormat::Json).await?;
        let addr = listener.local_addr()?.to_string();
        tokio::spawn(accept_subscribers(listener, Arc::clone(&state)));
        let mut subscriber = connect(&addr, "subscriber", WireFormat::Json).await?;
        while state.subscribers.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        coordinator.handle.emit(
            events::APP_DB_STATS,
            DbStats {
                user_count: 4,
                timestamp: "2024-01-01T00:00:00.000Z".to_string(),
            },
        );
        coordinator.handle.emit(
            events::APP_STATUS,
            json!({"status": "healthy", "connections": 1, "timestamp": "2024-01-01T00:00:00.000Z"}),
        );

        let stats = subscriber.stream.next().await.ok_or("closed")?;
        assert_eq!(stats.event(), events::DB_STATS_UPDATE);
        assert_eq!(stats.payload()["userCount"], 4);
        let status = subscriber.stream.next().await.ok_or("closed")?;
        assert_eq!(status.event(), events::APP_STATUS_UPDATE);
        assert!(state.pending.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_subscriber_create_is_rejected_locally() -> Result<(), Box<dyn std::error::Error>>
    {
        let (state, mut coordinator, _stream) = state_with_peer().await?;
        let listener = EventListener::bind("127.0.0.1:0", SOURCE, WireFormat::Json).await?;
        let addr = listener.local_addr()?.to_string();
        tokio::spawn(accept_subscribers(listener, Arc::clone(&state)));
        let mut subscriber = connect(&addr, "subscriber", WireFormat::Json).await?;

        subscriber
            .handle
            .emit(events::CREATE_USER, json!({"name": "", "email": "a@x.com"}));
        let response = subscriber.stream.next().await.ok_or("closed")?;
        assert_eq!(response.event(), events::USER_CREATED_RESPONSE);
        let reply: CreateUserReply = response.payload_as()?;
        assert_eq!(reply.into_result(), Err("name is required".to_string()));

        assert!(state.pending.is_empty());
        assert!(coordinator.stream.try_next().is_none());
        Ok(())
    }
}
