//! Framed TCP event channels.
//!
//! Every channel carries length-delimited frames, one [`RelayMessage`] per
//! frame, encoded with the configured [`WireFormat`]. Both sides of a channel
//! get the same shape of object back:
//! - [`ConnectionHandle`] - cloneable, non-blocking outbound half
//! - [`MessageStream`] - inbound half, ends when the peer goes away

use crate::error::ClientError;
use crate::message::{RelayMessage, WireFormat};
use crate::stream::MessageStream;
use crate::Result;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Default timeout for establishing a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Messages queued for a peer before emits start being dropped.
const OUTBOUND_CAPACITY: usize = 1024;

/// Messages buffered from a peer before the reader applies backpressure.
const INBOUND_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Outbound half of a connection.
///
/// Emitting never waits on the peer: messages go into a bounded queue drained
/// by a dedicated writer task. A full queue or a closed connection drops the
/// message.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: u64,
    peer: SocketAddr,
    source: Arc<str>,
    outbound: mpsc::Sender<RelayMessage>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        peer: SocketAddr,
        source: &str,
        outbound: mpsc::Sender<RelayMessage>,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            source: Arc::from(source),
            outbound,
        }
    }

    /// Process-unique identifier of this connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address of the remote end.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Name stamped into the `source` of every emitted message.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the writer side has shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Emit an event with the given payload.
    ///
    /// Returns `true` if the message was queued for delivery.
    pub fn emit(&self, event: &str, payload: impl Serialize) -> bool {
        let message = RelayMessage::new(event)
            .with_source(&self.source)
            .with_payload(payload);
        self.send(message)
    }

    /// Queue a prebuilt message for delivery.
    ///
    /// Returns `true` if the message was queued.
    pub fn send(&self, message: RelayMessage) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                tracing::warn!(
                    "Outbound queue to {} is full, dropping {}",
                    self.peer,
                    message.event
                );
                false
            }
            Err(TrySendError::Closed(message)) => {
                tracing::debug!(
                    "Connection {} to {} is closed, dropping {}",
                    self.id,
                    self.peer,
                    message.event
                );
                false
            }
        }
    }
}

/// Both halves of an established event channel.
pub struct Connection {
    /// Outbound half.
    pub handle: ConnectionHandle,
    /// Inbound half.
    pub stream: MessageStream,
}

impl Connection {
    /// Split a connected socket into reader and writer tasks.
    fn spawn(socket: TcpStream, source: &str, format: WireFormat) -> Result<Self> {
        let peer = socket.peer_addr()?;
        socket.set_nodelay(true)?;
        let (reader, writer) = socket.into_split();

        let (out_tx, mut out_rx) = mpsc::channel::<RelayMessage>(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);

        let mut frames_out = FramedWrite::new(writer, frame_codec());
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let bytes = match message.encode(format) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("Failed to encode {} for {}: {}", message.event, peer, e);
                        continue;
                    }
                };
                if let Err(e) = frames_out.send(Bytes::from(bytes)).await {
                    tracing::debug!("Write to {} failed: {}", peer, e);
                    break;
                }
            }
            let _ = SinkExt::<Bytes>::close(&mut frames_out).await;
        });

        let mut frames_in = FramedRead::new(reader, frame_codec());
        tokio::spawn(async move {
            while let Some(frame) = frames_in.next().await {
                match frame {
                    Ok(bytes) => match RelayMessage::decode(&bytes, format) {
                        Ok(message) => {
                            if in_tx.send(message).await.is_err() {
                                break; // Receiver dropped
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Dropping undecodable frame from {}: {}", peer, e);
                        }
                    },
                    Err(e) => {
                        tracing::debug!("Connection to {} closed: {}", peer, e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            handle: ConnectionHandle::new(peer, source, out_tx),
            stream: MessageStream::new(in_rx),
        })
    }
}

/// Open an event channel to a listening peer.
///
/// `source` names this side of the channel in every message it emits.
///
/// # Errors
///
/// Returns an error if the peer cannot be reached within the connect timeout.
pub async fn connect(addr: &str, source: &str, format: WireFormat) -> Result<Connection> {
    let socket = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ClientError::ConnectionFailed {
            addr: addr.to_string(),
            reason: "timed out".to_string(),
        })?
        .map_err(|e| ClientError::ConnectionFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

    tracing::debug!("Connected to {} as {}", addr, source);
    Connection::spawn(socket, source, format)
}

/// Accepts inbound event channels.
pub struct EventListener {
    listener: TcpListener,
    source: String,
    format: WireFormat,
}

impl EventListener {
    /// Bind a listener on `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: &str, source: &str, format: WireFormat) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            source: source.to_string(),
            format,
        })
    }

    /// The address actually bound (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wire format used for accepted connections.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Wait for the next peer.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails.
    pub async fn accept(&self) -> Result<Connection> {
        let (socket, _) = self.listener.accept().await?;
        Connection::spawn(socket, &self.source, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn pair(format: WireFormat) -> Result<(Connection, Connection)> {
        let listener = EventListener::bind("127.0.0.1:0", "server", format).await?;
        let addr = listener.local_addr()?.to_string();
        let (client, server) = tokio::join!(connect(&addr, "client", format), listener.accept());
        Ok((client?, server?))
    }

    #[tokio::test]
    async fn test_events_flow_both_ways() -> std::result::Result<(), Box<dyn std::error::Error>> {
        for format in [WireFormat::Json, WireFormat::Messagepack] {
            let (mut client, mut server) = pair(format).await?;

            assert!(client.handle.emit("db:query", json!({"queryId": 1})));
            let received = server.stream.next().await.ok_or("server stream ended")?;
            assert_eq!(received.event, "db:query");
            assert_eq!(received.source, "client");
            assert_eq!(received.payload["queryId"], 1);

            assert!(server.handle.emit("db:result", json!({"queryId": 1, "success": true})));
            let reply = client.stream.next().await.ok_or("client stream ended")?;
            assert_eq!(reply.event, "db:result");
            assert_eq!(reply.source, "server");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_ends_when_peer_drops() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let (client, mut server) = pair(WireFormat::Json).await?;
        drop(client);
        assert!(server.stream.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_emit_after_close_is_noop() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = ConnectionHandle::new("127.0.0.1:9".parse().unwrap(), "edge", tx);

        assert!(handle.is_closed());
        assert!(!handle.emit("users-data", json!({"success": true})));
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new("127.0.0.1:9".parse().unwrap(), "edge", tx);

        assert!(handle.emit("db-stats", json!({"userCount": 1})));
        assert!(!handle.emit("db-stats", json!({"userCount": 2})));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        drop(listener);

        let result = connect(&addr, "edge", WireFormat::Json).await;
        assert!(matches!(result, Err(ClientError::ConnectionFailed { .. })));
        Ok(())
    }
}
