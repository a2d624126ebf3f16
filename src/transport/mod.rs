//! Transport abstractions and implementations.
//!
//! This module defines the seam between [`BusClient`](crate::BusClient) and
//! concrete broker backends. The client layer depends only on the
//! [`BusConnector`] / [`BusConnection`] traits; everything broker-specific
//! (AMQP channels, delivery tags, queue declaration options) stays behind
//! them.
//!
//! A connection provides best-effort operations against one open transport
//! session. Reconnection, stale-handle detection, and the retry policy are
//! handled by the client layer, never here: a connection that fails stays
//! failed, and the client obtains a fresh one from the connector.
//!
//! The in-memory broker is the reference implementation of these semantics.
//! The AMQP implementation (feature `amqp`) approximates it as closely as
//! the protocol allows and documents its deviations.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{CorrelationId, OutboundMessage, QueueName, Result};

mod memory;
pub use memory::MemoryBroker;

#[cfg(feature = "amqp")]
mod amqp;

#[cfg(feature = "amqp")]
pub use amqp::create_amqp_connector;

/// A raw delivery as produced by a transport, before the client stamps it
/// with the connection epoch.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Opaque payload bytes as published.
    pub body: Bytes,
    /// Correlation identifier from message properties, if present.
    pub correlation_id: Option<CorrelationId>,
    /// Transport-level delivery tag, unique per connection.
    pub tag: u64,
}

/// Handle returned from a successful `open_consumer` call.
///
/// Deliveries arrive on `inbox` in broker order. The channel closing is the
/// transport's signal that the underlying session failed or was shut down;
/// the client reacts by reconnecting once.
pub struct ConsumerHandle {
    /// Receiver channel for deliveries from the consumed queue.
    pub inbox: mpsc::Receiver<Delivery>,
}

/// One open transport session against a broker.
///
/// Implementations must ensure that:
/// - `declare_durable` is idempotent: redeclaring with identical properties
///   succeeds; a property conflict is a `Declaration` error.
/// - `publish` either enqueues the whole message or fails; no partial
///   enqueue is observable.
/// - Delivery tags are meaningful only on the connection that issued them.
/// - Mid-session transport failures surface as
///   [`BusError::ConnectionLost`](crate::BusError::ConnectionLost) so the
///   client can classify them as retryable.
#[async_trait::async_trait]
pub trait BusConnection: Send + Sync {
    /// Idempotently declare `queue` as durable.
    async fn declare_durable(&self, queue: &QueueName) -> Result<()>;

    /// Publish a message to `queue`. The queue must already be declared.
    async fn publish(&self, queue: &QueueName, msg: &OutboundMessage) -> Result<()>;

    /// Start consuming from `queue` with manual acknowledgment.
    async fn open_consumer(&self, queue: &QueueName) -> Result<ConsumerHandle>;

    /// Acknowledge the delivery with the given tag.
    async fn ack(&self, tag: u64) -> Result<()>;

    /// Negatively acknowledge the delivery with the given tag.
    ///
    /// `requeue = true` returns the message to the queue for redelivery;
    /// `requeue = false` routes it to the dead-letter destination.
    async fn nack(&self, tag: u64, requeue: bool) -> Result<()>;

    /// Close the session. Unacknowledged deliveries return to the broker.
    async fn close(&self) -> Result<()>;
}

/// Factory for transport sessions.
///
/// The client calls `connect()` once up front and again on every reconnect;
/// each call must yield a fresh, independent session.
#[async_trait::async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> Result<ConnectionPtr>;
}

/// Shared connection pointer. Cheap to clone; the client replaces it
/// wholesale on reconnect.
pub type ConnectionPtr = Arc<dyn BusConnection>;

/// Shared connector pointer.
pub type ConnectorPtr = Arc<dyn BusConnector>;
