//! Shared broker state for the in-memory transport.
//!
//! One [`MemoryBroker`] plays the role of the broker process: it owns the
//! queues and outlives any number of connections. Connections created from
//! its connector share this state, so a client that reconnects talks to the
//! same queues, exactly as it would against a real broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::transport::{ConnectorPtr, Delivery};
use crate::CorrelationId;

use super::transport::MemoryConnector;

/// A stored message body plus its properties.
#[derive(Clone, Debug)]
pub(super) struct StoredMessage {
    pub(super) body: Bytes,
    pub(super) correlation_id: Option<CorrelationId>,
}

/// The single registered consumer of a queue.
pub(super) struct ConsumerSlot {
    pub(super) connection_id: u64,
    pub(super) tx: mpsc::Sender<Delivery>,
    pub(super) prefetch: usize,
}

/// An unacknowledged delivery awaiting ack/nack.
pub(super) struct Unacked {
    pub(super) connection_id: u64,
    pub(super) message: StoredMessage,
}

#[derive(Default)]
pub(super) struct QueueState {
    pub(super) durable: bool,
    pub(super) ready: VecDeque<StoredMessage>,
    pub(super) unacked: HashMap<u64, Unacked>,
    pub(super) dead: Vec<StoredMessage>,
    pub(super) consumer: Option<ConsumerSlot>,
}

pub(super) struct BrokerState {
    pub(super) queues: HashMap<String, QueueState>,
    pub(super) open: HashSet<u64>,
    pub(super) next_tag: u64,
    pub(super) next_connection_id: u64,
    pub(super) fail_connects: u32,
    pub(super) fail_publishes: u32,
}

impl BrokerState {
    fn new() -> Self {
        // ---
        Self {
            queues: HashMap::new(),
            open: HashSet::new(),
            next_tag: 0,
            next_connection_id: 0,
            fail_connects: 0,
            fail_publishes: 0,
        }
    }

    /// Move ready messages to the queue's consumer, respecting prefetch.
    ///
    /// A consumer whose channel has closed is dropped here; its queue keeps
    /// accumulating ready messages until a new consumer registers.
    pub(super) fn pump(&mut self, queue: &str) {
        // ---
        loop {
            let tag = self.next_tag;

            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            let Some(slot) = state.consumer.as_ref() else {
                return;
            };

            let connection_id = slot.connection_id;
            let in_flight = state
                .unacked
                .values()
                .filter(|u| u.connection_id == connection_id)
                .count();
            if in_flight >= slot.prefetch || state.ready.is_empty() {
                return;
            }

            let message = state.ready.pop_front().expect("ready is non-empty");
            let delivery = Delivery {
                body: message.body.clone(),
                correlation_id: message.correlation_id.clone(),
                tag,
            };

            match state
                .consumer
                .as_ref()
                .expect("consumer checked above")
                .tx
                .try_send(delivery)
            {
                Ok(()) => {
                    state.unacked.insert(
                        tag,
                        Unacked {
                            connection_id,
                            message,
                        },
                    );
                    self.next_tag += 1;
                }
                Err(_) => {
                    // Receiver gone: unregister the consumer, keep the message.
                    state.ready.push_front(message);
                    state.consumer = None;
                    return;
                }
            }
        }
    }

    /// Tear down one connection: unregister its consumers and return its
    /// unacknowledged deliveries to the front of their queues, in delivery
    /// order.
    pub(super) fn release_connection(&mut self, connection_id: u64) {
        // ---
        self.open.remove(&connection_id);

        let mut touched = Vec::new();
        for (name, state) in self.queues.iter_mut() {
            if state
                .consumer
                .as_ref()
                .is_some_and(|slot| slot.connection_id == connection_id)
            {
                state.consumer = None;
            }

            let mut returned: Vec<(u64, StoredMessage)> = Vec::new();
            state.unacked.retain(|tag, unacked| {
                if unacked.connection_id == connection_id {
                    returned.push((*tag, unacked.message.clone()));
                    false
                } else {
                    true
                }
            });

            if !returned.is_empty() {
                returned.sort_by_key(|(tag, _)| *tag);
                for (_, message) in returned.into_iter().rev() {
                    state.ready.push_front(message);
                }
                touched.push(name.clone());
            }
        }

        for name in touched {
            self.pump(&name);
        }
    }
}

/// An in-process broker.
///
/// Cheap to clone; clones share the same queues. Create connectors from it
/// with [`connector`](Self::connector) and hand them to
/// [`BusClient`](crate::BusClient).
///
/// # Example
///
/// ```
/// # use busline::{BusClient, MemoryBroker, OutboundMessage};
/// # async fn example() -> busline::Result<()> {
/// let broker = MemoryBroker::new();
/// let client = BusClient::new(broker.connector());
/// client.connect().await?;
/// client.send(&"jobs".into(), &OutboundMessage::new("payload")).await?;
/// assert_eq!(broker.queue_len("jobs").await, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryBroker {
    pub(super) state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create an empty broker with no queues.
    pub fn new() -> Self {
        // ---
        Self {
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }

    /// Create a connector for this broker with a prefetch of one.
    pub fn connector(&self) -> ConnectorPtr {
        self.connector_with_prefetch(1)
    }

    /// Create a connector with an explicit consumer prefetch count.
    pub fn connector_with_prefetch(&self, prefetch: u16) -> ConnectorPtr {
        // ---
        Arc::new(MemoryConnector {
            state: Arc::clone(&self.state),
            prefetch: prefetch.max(1) as usize,
        })
    }

    /// Number of messages currently held by `queue` (ready plus
    /// unacknowledged). Zero for an undeclared queue.
    pub async fn queue_len(&self, queue: &str) -> usize {
        // ---
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0)
    }

    /// Number of dead-lettered messages for `queue`.
    pub async fn dead_letter_len(&self, queue: &str) -> usize {
        // ---
        let state = self.state.lock().await;
        state.queues.get(queue).map(|q| q.dead.len()).unwrap_or(0)
    }

    /// Whether `queue` currently has a registered consumer.
    pub async fn has_consumer(&self, queue: &str) -> bool {
        // ---
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer.is_some())
    }

    /// Whether `queue` exists and is durable.
    pub async fn declared_durable(&self, queue: &str) -> bool {
        // ---
        let state = self.state.lock().await;
        state.queues.get(queue).is_some_and(|q| q.durable)
    }

    /// Fail the next `n` connection attempts with a connection error.
    pub async fn fail_next_connects(&self, n: u32) {
        self.state.lock().await.fail_connects = n;
    }

    /// Fail the next `n` publishes with a transport-classified error.
    pub async fn fail_next_publishes(&self, n: u32) {
        self.state.lock().await.fail_publishes = n;
    }

    /// Forcibly close every open connection, as a broker restart or network
    /// partition would. Unacknowledged deliveries return to their queues;
    /// consumer channels close.
    pub async fn kill_connections(&self) {
        // ---
        let mut state = self.state.lock().await;
        let ids: Vec<u64> = state.open.iter().copied().collect();
        for id in ids {
            state.release_connection(id);
        }
    }

    /// Seed a non-durable queue, for exercising declaration conflicts.
    pub async fn seed_transient_queue(&self, queue: &str) {
        // ---
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_string()).or_default().durable = false;
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}
