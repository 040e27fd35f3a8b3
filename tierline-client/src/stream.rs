//! Message stream for receiving events from a peer.

use crate::message::RelayMessage;
use tokio::sync::mpsc;

/// An async stream of messages received on one connection.
///
/// Returned as the inbound half of every [`Connection`](crate::Connection).
/// Use `next()` to receive the next message.
///
/// # Example
///
/// ```rust,ignore
/// let mut connection = tierline_client::connect(addr, "edge", WireFormat::default()).await?;
///
/// while let Some(msg) = connection.stream.next().await {
///     println!("Received: {}", msg.event());
/// }
/// ```
pub struct MessageStream {
    /// The receiver channel for incoming messages.
    receiver: mpsc::Receiver<RelayMessage>,
}

impl MessageStream {
    /// Create a new message stream from a receiver channel.
    pub(crate) fn new(receiver: mpsc::Receiver<RelayMessage>) -> Self {
        Self { receiver }
    }

    /// Receive the next message from the stream.
    ///
    /// Returns `None` once the peer has closed the connection.
    pub async fn next(&mut self) -> Option<RelayMessage> {
        self.receiver.recv().await
    }

    /// Try to receive the next message without blocking.
    ///
    /// Returns `None` if no message is available.
    pub fn try_next(&mut self) -> Option<RelayMessage> {
        self.receiver.try_recv().ok()
    }
}
