//! Node-level errors.

use crate::storage::StorageError;
use thiserror::Error;
use tierline_client::{ClientError, CorrelationError};

/// Failures that stop a node from starting or serving.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {peer} node: {source}")]
    Connect {
        peer: &'static str,
        #[source]
        source: ClientError,
    },

    #[error("Channel error: {0}")]
    Client(#[from] ClientError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    pub(crate) fn bind(addr: &str, source: ClientError) -> Self {
        match source {
            ClientError::IoError(source) => Self::Bind {
                addr: addr.to_string(),
                source,
            },
            other => Self::Client(other),
        }
    }
}

/// Failure of one downstream call, as reported to the caller.
///
/// Every variant becomes the `error` string of a `success:false` reply.
#[derive(Debug, Error)]
pub enum CallError {
    /// The downstream node reported a failure.
    #[error("{0}")]
    Remote(String),

    #[error("{0}")]
    Correlation(#[from] CorrelationError),

    /// The reply arrived but did not have the expected shape.
    #[error("Unexpected reply: {0}")]
    Malformed(String),

    /// The continuation was dropped without a reply.
    #[error("Call abandoned before a reply arrived")]
    Abandoned,
}
