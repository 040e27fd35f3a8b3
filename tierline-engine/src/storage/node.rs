//! Storage node: answers `db:query` calls and broadcasts `db:stats`.

use super::{QueryExecutor, SqliteExecutor};
use crate::config::StorageConfig;
use crate::error::NodeError;
use crate::protocol::{
    events, readable_call_id, timestamp_now, DbStats, QueryRequest, QueryResult,
};
use crate::task::AbortOnDrop;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tierline_client::{
    Connection, ConnectionHandle, ConnectionRegistry, EventListener, RelayMessage, WireFormat,
};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// Name stamped on every event this node emits.
pub const SOURCE: &str = "storage";

/// The storage tier.
pub struct StorageNode {
    listener: EventListener,
    executor: Arc<dyn QueryExecutor>,
    coordinators: ConnectionRegistry,
    stats_interval: Duration,
}

impl StorageNode {
    /// Bind the coordinator listener over a fresh seeded database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or the address
    /// cannot be bound.
    pub async fn bind(config: &StorageConfig, format: WireFormat) -> Result<Self, NodeError> {
        let executor = Arc::new(SqliteExecutor::in_memory()?);
        Self::with_executor(config, format, executor).await
    }

    /// Bind the coordinator listener over the given executor.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn with_executor(
        config: &StorageConfig,
        format: WireFormat,
        executor: Arc<dyn QueryExecutor>,
    ) -> Result<Self, NodeError> {
        let listener = EventListener::bind(&config.listen, SOURCE, format)
            .await
            .map_err(|e| NodeError::bind(&config.listen, e))?;

        Ok(Self {
            listener,
            executor,
            coordinators: ConnectionRegistry::new(),
            stats_interval: config.stats_interval(),
        })
    }

    /// Address coordinators should connect to.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, NodeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve coordinators until the task is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails to report its address.
    pub async fn run(self) -> Result<(), NodeError> {
        info!("Storage node listening on {}", self.local_addr()?);

        let stats = tokio::spawn(broadcast_stats(
            Arc::clone(&self.executor),
            self.coordinators.clone(),
            self.stats_interval,
        ));
        let _stats_guard = AbortOnDrop(stats);

        loop {
            match self.listener.accept().await {
                Ok(connection) => {
                    tokio::spawn(serve_coordinator(
                        connection,
                        Arc::clone(&self.executor),
                        self.coordinators.clone(),
                    ));
                }
                Err(e) => warn!("Failed to accept coordinator connection: {}", e),
            }
        }
    }
}

async fn serve_coordinator(
    connection: Connection,
    executor: Arc<dyn QueryExecutor>,
    coordinators: ConnectionRegistry,
) {
    let Connection { handle, mut stream } = connection;
    info!("Coordinator connected from {}", handle.peer_addr());
    coordinators.insert(handle.clone());

    while let Some(message) = stream.next().await {
        match message.event() {
            events::DB_QUERY => handle_query(&handle, executor.as_ref(), &message),
            other => debug!("Ignoring {} from {}", other, handle.peer_addr()),
        }
    }

    coordinators.remove(handle.id());
    info!("Coordinator {} disconnected", handle.peer_addr());
}

/// Execute one `db:query` and emit exactly one `db:result` for it.
fn handle_query(handle: &ConnectionHandle, executor: &dyn QueryExecutor, message: &RelayMessage) {
    let request: QueryRequest = match message.payload_as() {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed db:query from {}: {}", handle.peer_addr(), e);
            // Still answer when the id is readable so the caller is not left waiting.
            if let Some(query_id) = readable_call_id(message.payload(), "queryId") {
                handle.emit(
                    events::DB_RESULT,
                    QueryResult::failed(query_id, format!("malformed query: {e}")),
                );
            }
            return;
        }
    };

    debug!("Query {}: {}", request.query_id, request.sql);
    let result = match executor.execute(&request.sql, &request.params) {
        Ok(data) => QueryResult::ok(request.query_id, data),
        Err(e) => {
            warn!("Query {} failed: {}", request.query_id, e);
            QueryResult::failed(request.query_id, e.to_string())
        }
    };
    handle.emit(events::DB_RESULT, &result);
}

async fn broadcast_stats(
    executor: Arc<dyn QueryExecutor>,
    coordinators: ConnectionRegistry,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        match executor.user_count() {
            Ok(user_count) => {
                let stats = DbStats {
                    user_count,
                    timestamp: timestamp_now(),
                };
                coordinators.broadcast(events::DB_STATS, &stats);
            }
            Err(e) => error!("Skipping db:stats, user count failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QueryData;
    use serde_json::json;
    use tierline_client::{connect, CallId};

    async fn start(stats_interval_secs: u64) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        let config = StorageConfig {
            listen: "127.0.0.1:0".to_string(),
            stats_interval_secs,
        };
        let node = StorageNode::bind(&config, WireFormat::Json).await?;
        let addr = node.local_addr()?;
        tokio::spawn(node.run());
        Ok(addr)
    }

    async fn next_result(
        connection: &mut Connection,
    ) -> Result<QueryResult, Box<dyn std::error::Error>> {
        loop {
            let message = connection.stream.next().await.ok_or("storage closed")?;
            if message.event() == events::DB_RESULT {
                return Ok(message.payload_as()?);
            }
        }
    }

    #[tokio::test]
    async fn test_query_gets_exactly_one_result() -> Result<(), Box<dyn std::error::Error>> {
        let addr = start(60).await?;
        let mut coordinator = connect(&addr.to_string(), "coordinator", WireFormat::Json).await?;

        coordinator.handle.emit(
            events::DB_QUERY,
            json!({"queryId": 7, "sql": "SELECT * FROM users", "params": []}),
        );
        let result = next_result(&mut coordinator).await?;

        assert_eq!(result.query_id, CallId::new(7));
        assert!(result.success);
        assert!(matches!(result.data, Some(QueryData::Rows(ref rows)) if rows.len() == 2));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_query_reports_error() -> Result<(), Box<dyn std::error::Error>> {
        let addr = start(60).await?;
        let mut coordinator = connect(&addr.to_string(), "coordinator", WireFormat::Json).await?;

        coordinator.handle.emit(
            events::DB_QUERY,
            json!({"queryId": 1, "sql": "SELECT * FROM missing", "params": []}),
        );
        let result = next_result(&mut coordinator).await?;

        assert!(!result.success);
        assert!(result.error.ok_or("no error")?.contains("no such table"));
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_query_with_id_gets_failure() -> Result<(), Box<dyn std::error::Error>> {
        let addr = start(60).await?;
        let mut coordinator = connect(&addr.to_string(), "coordinator", WireFormat::Json).await?;

        coordinator
            .handle
            .emit(events::DB_QUERY, json!({"queryId": 4, "params": []}));
        let result = next_result(&mut coordinator).await?;

        assert_eq!(result.query_id, CallId::new(4));
        assert!(!result.success);
        Ok(())
    }

    #[tokio::test]
    async fn test_stats_broadcast_to_every_coordinator() -> Result<(), Box<dyn std::error::Error>> {
        let addr = start(1).await?;
        let mut first = connect(&addr.to_string(), "coordinator", WireFormat::Json).await?;
        let mut second = connect(&addr.to_string(), "coordinator", WireFormat::Json).await?;

        for connection in [&mut first, &mut second] {
            let message = tokio::time::timeout(Duration::from_secs(5), connection.stream.next())
                .await?
                .ok_or("storage closed")?;
            assert_eq!(message.event(), events::DB_STATS);
            let stats: DbStats = message.payload_as()?;
            assert_eq!(stats.user_count, 2);
        }
        Ok(())
    }
}
