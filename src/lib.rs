//! Resilient message-bus client with durable queues and explicit
//! acknowledgment.
//!
//! This library wraps a single broker connection with reconnect-on-failure
//! semantics and a uniform send/consume/ack contract. On any
//! transport-classified failure, an operation transparently reconnects
//! exactly once and retries once before surfacing a typed error; no
//! failure is ever swallowed, and no unsent message is ever buffered.
//!
//! Delivery is at-least-once: unacknowledged messages return to the broker
//! on disconnect and may be redelivered, so consume handlers must be
//! idempotent.

// Import all sub modules once...
mod client;
mod config;
mod error;
mod message;
mod transport;

// Re-export main types
pub use client::BusClient;
pub use config::BusConfig;
pub use error::{BusError, HandlerError, Result};

pub use message::{
    //
    CorrelationId,
    DeliveryHandle,
    InboundMessage,
    OutboundMessage,
    QueueName,
};

// --- transport seam re-exports
pub use transport::{
    //
    BusConnection,
    BusConnector,
    ConnectionPtr,
    ConnectorPtr,
    ConsumerHandle,
    Delivery,
    MemoryBroker,
};

#[cfg(feature = "amqp")]
pub use transport::create_amqp_connector;
