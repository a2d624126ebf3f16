//! Domain message types.
//!
//! These are the types exchanged between callers and the transport layer.
//! They are deliberately small: bodies are opaque byte payloads, queue names
//! are opaque identifiers, and the delivery handle carries just enough state
//! to enforce the stale-handle invariant. No payload interpretation or
//! validation happens at this level.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A queue identifier.
///
/// Names a destination on the broker. Interpretation is transport-specific
/// (AMQP queue name, service-bus entity name), but the client treats it as
/// an opaque identifier. Queues named by a `QueueName` are declared durable
/// before first use.
///
/// Cheap to clone and safe to share across threads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct QueueName(pub Arc<str>);

impl QueueName {
    /// Borrow the queue name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for QueueName
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        QueueName(value.into())
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation identifier attached to an outbound message.
///
/// Carried in broker message properties so that downstream consumers can
/// relate messages to one another. Producers typically
/// [`generate`](Self::generate) one; inbound ids are whatever the broker
/// delivered, so the value is an opaque string, not necessarily a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generate a fresh random correlation ID (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    /// Borrow the correlation ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for CorrelationId
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        CorrelationId(value.into())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message to be published.
///
/// Immutable once constructed. The body is an already-serialized payload
/// (typically JSON) supplied by the caller; the client does not interpret
/// it.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    /// Opaque payload bytes.
    pub body: Bytes,
    /// Optional correlation identifier, carried in message properties.
    pub correlation_id: Option<CorrelationId>,
}

impl OutboundMessage {
    /// Create a message from an opaque payload.
    pub fn new(body: impl Into<Bytes>) -> Self {
        // ---
        Self {
            body: body.into(),
            correlation_id: None,
        }
    }

    /// Attach a correlation identifier.
    pub fn with_correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Opaque token correlating a delivered message to the connection that
/// delivered it.
///
/// Required for ack/reject. Valid only while the originating connection is
/// open: the client bumps `epoch` on every successful reconnect, and an
/// acknowledgment carrying a handle from an earlier epoch fails with
/// [`BusError::StaleDelivery`](crate::BusError::StaleDelivery) rather than
/// acking against the wrong connection. In-flight unacknowledged messages
/// are returned to the broker on disconnect; that is broker-side behavior,
/// not client state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub(crate) epoch: u64,
    pub(crate) tag: u64,
}

impl DeliveryHandle {
    pub(crate) fn new(epoch: u64, tag: u64) -> Self {
        Self { epoch, tag }
    }
}

/// A message delivered to a consumer.
///
/// Transient: scoped to a single receive. Holds the delivery handle needed
/// to ack or reject it.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Opaque payload bytes as published.
    pub body: Bytes,
    /// Correlation identifier, if the producer attached one.
    pub correlation_id: Option<CorrelationId>,
    /// Handle for ack/reject, tied to the delivering connection.
    pub delivery: DeliveryHandle,
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn generated_correlation_ids_do_not_collide() {
        // ---
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn correlation_id_carries_broker_supplied_values_verbatim() {
        // ---
        // Inbound ids are opaque strings; nothing requires UUID shape.
        let id = CorrelationId::from("order-7/attempt-2");
        assert_eq!(id.as_str(), "order-7/attempt-2");
        assert_eq!(id.to_string(), "order-7/attempt-2");
    }

    #[test]
    fn queue_name_from_str_and_display() {
        // ---
        let q = QueueName::from("orders");
        assert_eq!(q.as_str(), "orders");
        assert_eq!(q.to_string(), "orders");
        assert_eq!(q, QueueName::from(String::from("orders")));
    }

    #[test]
    fn outbound_message_builder() {
        // ---
        let msg = OutboundMessage::new(&b"{\"id\":\"object 1\"}"[..])
            .with_correlation_id("corr-1");

        assert_eq!(msg.body.as_ref(), b"{\"id\":\"object 1\"}");
        assert_eq!(msg.correlation_id.as_ref().map(|c| c.as_str()), Some("corr-1"));
    }
}
