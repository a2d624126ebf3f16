//! Connector and connection over the in-memory broker.
//!
//! Connections are thin handles onto the shared [`BrokerState`]: each one
//! carries an id registered in the broker's open set, and every operation
//! checks that registration first. A connection the broker has killed
//! reports `ConnectionLost` on use, which is what lets the client layer
//! exercise its reconnect path deterministically in tests.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::transport::{BusConnection, BusConnector, ConnectionPtr, ConsumerHandle};
use crate::{BusError, OutboundMessage, QueueName, Result};

use super::broker::{BrokerState, ConsumerSlot, QueueState, StoredMessage};

pub(super) struct MemoryConnector {
    pub(super) state: Arc<Mutex<BrokerState>>,
    pub(super) prefetch: usize,
}

#[async_trait::async_trait]
impl BusConnector for MemoryConnector {
    async fn connect(&self) -> Result<ConnectionPtr> {
        // ---
        let mut state = self.state.lock().await;

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(BusError::Connection("memory broker unreachable".into()));
        }

        let id = state.next_connection_id;
        state.next_connection_id += 1;
        state.open.insert(id);

        debug!(connection_id = id, "memory connection opened");

        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
            id,
            prefetch: self.prefetch,
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
    prefetch: usize,
}

impl MemoryConnection {
    /// Fail with `ConnectionLost` if the broker no longer considers this
    /// connection open (killed, or closed by the client).
    fn check_open(&self, state: &BrokerState) -> Result<()> {
        // ---
        if state.open.contains(&self.id) {
            Ok(())
        } else {
            Err(BusError::ConnectionLost("connection closed".into()))
        }
    }
}

#[async_trait::async_trait]
impl BusConnection for MemoryConnection {
    async fn declare_durable(&self, queue: &QueueName) -> Result<()> {
        // ---
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        let entry = state
            .queues
            .entry(queue.as_str().to_string())
            .or_insert_with(|| QueueState {
                durable: true,
                ..QueueState::default()
            });

        if !entry.durable {
            return Err(BusError::Declaration {
                queue: queue.to_string(),
                reason: "queue already exists with durable=false".into(),
            });
        }

        Ok(())
    }

    async fn publish(&self, queue: &QueueName, msg: &OutboundMessage) -> Result<()> {
        // ---
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(BusError::ConnectionLost("stream reset by broker".into()));
        }

        let Some(entry) = state.queues.get_mut(queue.as_str()) else {
            return Err(BusError::Send {
                queue: queue.to_string(),
                reason: "queue not declared".into(),
            });
        };

        entry.ready.push_back(StoredMessage {
            body: msg.body.clone(),
            correlation_id: msg.correlation_id.clone(),
        });

        state.pump(queue.as_str());
        Ok(())
    }

    async fn open_consumer(&self, queue: &QueueName) -> Result<ConsumerHandle> {
        // ---
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        // Channel capacity matches prefetch: pump() never has more than
        // `prefetch` deliveries outstanding, so try_send cannot fail on a
        // live receiver.
        let (tx, rx) = mpsc::channel(self.prefetch);

        let Some(entry) = state.queues.get_mut(queue.as_str()) else {
            return Err(BusError::Consume {
                queue: queue.to_string(),
                reason: "queue not declared".into(),
            });
        };

        entry.consumer = Some(ConsumerSlot {
            connection_id: self.id,
            tx,
            prefetch: self.prefetch,
        });

        state.pump(queue.as_str());
        Ok(ConsumerHandle { inbox: rx })
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        // ---
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        let mut owner = None;
        for (name, entry) in state.queues.iter() {
            if let Some(unacked) = entry.unacked.get(&tag) {
                if unacked.connection_id != self.id {
                    return Err(BusError::Ack(format!(
                        "delivery tag {tag} belongs to another connection"
                    )));
                }
                owner = Some(name.clone());
                break;
            }
        }

        let Some(name) = owner else {
            return Err(BusError::Ack(format!("unknown delivery tag {tag}")));
        };

        state
            .queues
            .get_mut(&name)
            .expect("queue exists")
            .unacked
            .remove(&tag);

        state.pump(&name);
        Ok(())
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<()> {
        // ---
        let mut state = self.state.lock().await;
        self.check_open(&state)?;

        let mut owner = None;
        for (name, entry) in state.queues.iter() {
            if let Some(unacked) = entry.unacked.get(&tag) {
                if unacked.connection_id != self.id {
                    return Err(BusError::Ack(format!(
                        "delivery tag {tag} belongs to another connection"
                    )));
                }
                owner = Some(name.clone());
                break;
            }
        }

        let Some(name) = owner else {
            return Err(BusError::Ack(format!("unknown delivery tag {tag}")));
        };

        let entry = state.queues.get_mut(&name).expect("queue exists");
        let unacked = entry.unacked.remove(&tag).expect("tag exists");
        if requeue {
            entry.ready.push_front(unacked.message);
        } else {
            entry.dead.push(unacked.message);
        }

        state.pump(&name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        let mut state = self.state.lock().await;
        if state.open.contains(&self.id) {
            state.release_connection(self.id);
            debug!(connection_id = self.id, "memory connection closed");
        }
        Ok(())
    }
}
