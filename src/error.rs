use thiserror::Error;

/// Errors surfaced by bus operations.
///
/// Every public operation on [`BusClient`](crate::BusClient) is fallible and
/// maps to one of these kinds. [`BusError::ConnectionLost`] is the only
/// transport-classified failure: it is what the reconnect-once policy acts
/// on, and it is never returned to callers directly — after the bounded
/// retry it is converted into the failing operation's own kind
/// (`Send`, `Consume`, `Declaration`, `Ack`).
#[derive(Error, Debug)]
pub enum BusError {
    /// The transport could not be established (auth failure, network
    /// unreachable, malformed endpoint).
    #[error("connection failed: {0}")]
    Connection(String),

    /// An established transport failed mid-operation. Retryable: triggers
    /// exactly one reconnect-and-retry before being reclassified.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No connection is open. Returned by operations invoked before
    /// `connect()` or after `stop()`.
    #[error("client is not connected")]
    NotConnected,

    /// Durable declaration of a queue failed, typically a property conflict
    /// with an existing declaration.
    #[error("queue declaration failed for {queue}: {reason}")]
    Declaration { queue: String, reason: String },

    /// Publish failed after the one reconnect retry. The message was not
    /// enqueued and was not buffered locally.
    #[error("send to {queue} failed: {reason}")]
    Send { queue: String, reason: String },

    /// The receive loop aborted after the one reconnect retry.
    #[error("consume from {queue} failed: {reason}")]
    Consume { queue: String, reason: String },

    /// The broker rejected an ack or nack.
    #[error("acknowledgment failed: {0}")]
    Ack(String),

    /// The delivery handle was issued by a superseded connection. The
    /// message will be redelivered by the broker; it must not be
    /// acknowledged against the new connection.
    #[error("delivery handle is stale: connection was superseded")]
    StaleDelivery,
}

impl BusError {
    /// Whether this failure is transport-classified, i.e. eligible for the
    /// one-shot reconnect-and-retry.
    pub fn is_transport_lost(&self) -> bool {
        matches!(self, BusError::ConnectionLost(_))
    }
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Opaque failure returned by a consume handler.
///
/// The client interprets only success/failure: success acknowledges the
/// message, failure rejects it back onto the queue. The inner error is
/// logged, never inspected.
#[derive(Debug)]
pub struct HandlerError(Box<dyn std::error::Error + Send + Sync>);

impl HandlerError {
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(err.into())
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        Self::new(msg)
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        Self::new(msg)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn only_connection_lost_is_transport_classified() {
        // ---
        assert!(BusError::ConnectionLost("reset".into()).is_transport_lost());
        assert!(!BusError::Connection("refused".into()).is_transport_lost());
        assert!(!BusError::NotConnected.is_transport_lost());
        assert!(!BusError::StaleDelivery.is_transport_lost());
        assert!(!BusError::Send {
            queue: "q".into(),
            reason: "boom".into()
        }
        .is_transport_lost());
    }

    #[test]
    fn handler_error_wraps_any_error() {
        // ---
        let err = HandlerError::new("payload rejected");
        assert_eq!(err.to_string(), "payload rejected");

        let io = std::io::Error::other("disk full");
        let err = HandlerError::new(io);
        assert_eq!(err.to_string(), "disk full");
    }
}
