//! In-memory broker and transport.
//!
//! The memory transport is the **reference implementation** of the
//! transport contract. It simulates a durable-queue broker entirely within
//! the process: FIFO queues, per-consumer prefetch, manual ack/nack,
//! dead-lettering, and return-to-queue of unacknowledged deliveries when a
//! connection closes.
//!
//! It also provides fault injection (failing the next N connects or
//! publishes, killing open connections) and queue inspection, so the
//! reconnect behavior of the client layer can be exercised without a real
//! broker.

mod broker;
mod transport;

pub use broker::MemoryBroker;
