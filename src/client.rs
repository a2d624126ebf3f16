//! The resilient bus client.
//!
//! [`BusClient`] wraps one transport connection with reconnect-on-failure
//! semantics and a uniform send/consume/ack contract. Reconnection never
//! leaks to callers: a transport failure inside any operation triggers
//! exactly one reconnect and one retry of the full operation, after which
//! the operation's own error kind surfaces.
//!
//! # Concurrency
//!
//! All methods take `&self`; the connection is held behind an async
//! `RwLock` so that replacement during reconnect cannot be observed
//! half-done. One logical producer or consumer context should use the
//! client at a time. [`start_consuming`](BusClient::start_consuming) blocks
//! its task until [`stop`](BusClient::stop) is called from another task;
//! the shutdown signal is checked between deliveries, never mid-message.

use std::future::Future;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::transport::{BusConnection as _, BusConnector as _};
use crate::transport::{ConnectionPtr, ConnectorPtr, ConsumerHandle};
use crate::{
    BusError, DeliveryHandle, HandlerError, InboundMessage, OutboundMessage, QueueName, Result,
};

struct ClientState {
    connection: Option<ConnectionPtr>,
    /// Bumped on every successful connect. Delivery handles carry the epoch
    /// they were issued under; a mismatch marks them stale.
    epoch: u64,
}

/// A message-bus client that self-heals on transport failure.
///
/// Construct with a connector for the chosen backend, then `connect()`
/// before use. The client is `Send + Sync`; wrap it in an `Arc` to call
/// `stop()` from another task while a consume loop is running.
///
/// # Example
///
/// ```
/// # use busline::{BusClient, MemoryBroker, OutboundMessage, QueueName};
/// # async fn example() -> busline::Result<()> {
/// let broker = MemoryBroker::new();
/// let client = BusClient::new(broker.connector());
/// client.connect().await?;
///
/// let queue = QueueName::from("jobs");
/// client.ensure_durable(&queue).await?;
/// client.send(&queue, &OutboundMessage::new("{\"id\":\"object 1\"}")).await?;
/// client.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct BusClient {
    connector: ConnectorPtr,
    state: RwLock<ClientState>,
    shutdown: watch::Sender<bool>,
}

impl BusClient {
    /// Create a client over the given connector. No connection is opened
    /// until [`connect`](Self::connect).
    pub fn new(connector: ConnectorPtr) -> Self {
        // ---
        let (shutdown, _) = watch::channel(false);
        Self {
            connector,
            state: RwLock::new(ClientState {
                connection: None,
                epoch: 0,
            }),
            shutdown,
        }
    }

    /// Establish a fresh connection, replacing any prior one.
    ///
    /// Any in-flight unacknowledged deliveries on the prior connection
    /// return to the broker; delivery handles issued under it become stale.
    pub async fn connect(&self) -> Result<()> {
        // ---
        let connection = self.connector.connect().await?;

        let mut state = self.state.write().await;
        let previous = state.connection.replace(connection);
        state.epoch += 1;
        let epoch = state.epoch;
        drop(state);

        if let Some(old) = previous {
            // Best effort; the old session may already be dead.
            if let Err(err) = old.close().await {
                debug!(error = %err, "closing superseded connection failed");
            }
        }

        self.shutdown.send_replace(false);
        info!(epoch, "connected to broker");
        Ok(())
    }

    /// Close the connection. Idempotent; a running consume loop returns
    /// `Ok(())` once it observes the shutdown signal.
    ///
    /// After `stop()`, operations fail with [`BusError::NotConnected`]
    /// until [`connect`](Self::connect) is called again.
    pub async fn stop(&self) {
        // ---
        self.shutdown.send_replace(true);

        let connection = self.state.write().await.connection.take();
        match connection {
            Some(conn) => {
                if let Err(err) = conn.close().await {
                    warn!(error = %err, "error closing connection");
                }
                info!("bus client stopped");
            }
            None => debug!("stop called with no open connection"),
        }
    }

    /// Idempotently declare `queue` as durable.
    ///
    /// Safe to call repeatedly for the same identifier; redeclaration with
    /// identical properties is not an error. Follows the one-shot
    /// reconnect-and-retry policy on transport failure.
    pub async fn ensure_durable(&self, queue: &QueueName) -> Result<()> {
        // ---
        self.with_reconnect(|conn, _| {
            let queue = queue.clone();
            async move { conn.declare_durable(&queue).await }
        })
        .await
        .map_err(|err| match err {
            BusError::ConnectionLost(reason) | BusError::Connection(reason) => {
                BusError::Declaration {
                    queue: queue.to_string(),
                    reason,
                }
            }
            other => other,
        })
    }

    /// Declare `queue` durable, then publish `msg` to it.
    ///
    /// On transport failure the client reconnects once and retries the full
    /// operation (declaration plus publish) once. If the retry also fails,
    /// [`BusError::Send`] surfaces and the message is not enqueued; the
    /// client never buffers unsent messages.
    pub async fn send(&self, queue: &QueueName, msg: &OutboundMessage) -> Result<()> {
        // ---
        self.with_reconnect(|conn, _| {
            let queue = queue.clone();
            let msg = msg.clone();
            async move {
                conn.declare_durable(&queue).await?;
                conn.publish(&queue, &msg).await
            }
        })
        .await
        .map(|()| debug!(queue = %queue, "message published"))
        .map_err(|err| match err {
            BusError::ConnectionLost(reason) | BusError::Connection(reason) => BusError::Send {
                queue: queue.to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Consume from `queue`, invoking `handler` per delivered message.
    ///
    /// Blocks the calling task. Handler success acknowledges the message;
    /// handler failure rejects it back onto the queue for redelivery (the
    /// broker may redeliver, so handlers must be idempotent). A transport
    /// failure mid-loop triggers one reconnect and consumer reopen; if that
    /// fails, [`BusError::Consume`] surfaces and the loop terminates.
    ///
    /// Returns `Ok(())` when [`stop`](Self::stop) is observed. The shutdown
    /// signal is only checked between deliveries.
    pub async fn start_consuming<F, Fut>(&self, queue: &QueueName, mut handler: F) -> Result<()>
    where
        F: FnMut(InboundMessage) -> Fut + Send,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
    {
        // ---
        let mut shutdown = self.shutdown.subscribe();

        let (mut conn, mut epoch, mut consumer) = self.open_consumer(queue).await?;
        info!(queue = %queue, "waiting for messages");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(queue = %queue, "consume loop stopping");
                        return Ok(());
                    }
                }

                delivery = consumer.inbox.recv() => {
                    let Some(delivery) = delivery else {
                        // Inbox closed: either stop() tore the connection
                        // down, or the transport failed mid-loop.
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                        warn!(queue = %queue, "transport failed mid-loop, reconnecting once");
                        self.connect().await.map_err(|err| BusError::Consume {
                            queue: queue.to_string(),
                            reason: err.to_string(),
                        })?;
                        (conn, epoch, consumer) =
                            self.open_consumer(queue).await.map_err(|err| BusError::Consume {
                                queue: queue.to_string(),
                                reason: err.to_string(),
                            })?;
                        continue;
                    };

                    let message = InboundMessage {
                        body: delivery.body,
                        correlation_id: delivery.correlation_id,
                        delivery: DeliveryHandle::new(epoch, delivery.tag),
                    };

                    let outcome = match handler(message).await {
                        Ok(()) => {
                            debug!(queue = %queue, tag = delivery.tag, "handler ok, acknowledging");
                            conn.ack(delivery.tag).await
                        }
                        Err(err) => {
                            warn!(queue = %queue, tag = delivery.tag, error = %err,
                                  "handler failed, rejecting with requeue");
                            conn.nack(delivery.tag, true).await
                        }
                    };

                    if let Err(err) = outcome {
                        if err.is_transport_lost() {
                            // The broker returns the unacked message; one
                            // reconnect, then resume consuming.
                            warn!(queue = %queue, "transport failed during ack, reconnecting once");
                            self.connect().await.map_err(|err| BusError::Consume {
                                queue: queue.to_string(),
                                reason: err.to_string(),
                            })?;
                            (conn, epoch, consumer) =
                                self.open_consumer(queue).await.map_err(|err| BusError::Consume {
                                    queue: queue.to_string(),
                                    reason: err.to_string(),
                                })?;
                        } else {
                            return Err(BusError::Consume {
                                queue: queue.to_string(),
                                reason: err.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Explicitly acknowledge a delivered message.
    ///
    /// For callers managing acknowledgment outside `start_consuming`'s
    /// auto-ack behavior. Fails with [`BusError::StaleDelivery`] if the
    /// delivery handle belongs to a superseded connection; it is never
    /// acknowledged against the current one.
    pub async fn acknowledge(&self, msg: &InboundMessage) -> Result<()> {
        // ---
        let handle = msg.delivery;
        self.with_reconnect(move |conn, epoch| async move {
            if handle.epoch != epoch {
                return Err(BusError::StaleDelivery);
            }
            conn.ack(handle.tag).await
        })
        .await
        .map_err(reclassify_ack)
    }

    /// Negatively acknowledge a delivered message.
    ///
    /// `requeue = true` returns the message to the queue for redelivery;
    /// `requeue = false` routes it to the dead-letter destination. Stale
    /// handles fail with [`BusError::StaleDelivery`].
    pub async fn reject(&self, msg: &InboundMessage, requeue: bool) -> Result<()> {
        // ---
        let handle = msg.delivery;
        self.with_reconnect(move |conn, epoch| async move {
            if handle.epoch != epoch {
                return Err(BusError::StaleDelivery);
            }
            conn.nack(handle.tag, requeue).await
        })
        .await
        .map_err(reclassify_ack)
    }

    /// Snapshot the current connection and epoch.
    async fn current(&self) -> Result<(ConnectionPtr, u64)> {
        // ---
        let state = self.state.read().await;
        match &state.connection {
            Some(conn) => Ok((conn.clone(), state.epoch)),
            None => Err(BusError::NotConnected),
        }
    }

    /// Run an operation with the one-shot reconnect policy.
    ///
    /// Attempts `op` against the current connection. On a
    /// transport-classified failure, reconnects exactly once and retries
    /// `op` exactly once against the fresh connection; any further failure
    /// propagates. This bounds retry cost to O(1) per call site — there is
    /// no background retry.
    async fn with_reconnect<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(ConnectionPtr, u64) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // ---
        let (conn, epoch) = self.current().await?;
        match op(conn, epoch).await {
            Err(err) if err.is_transport_lost() => {
                warn!(error = %err, "transport failure, reconnecting once");
                self.connect().await?;
                let (conn, epoch) = self.current().await?;
                op(conn, epoch).await
            }
            other => other,
        }
    }

    /// Declare `queue` durable and open a consumer on it, with the one-shot
    /// reconnect policy applied to the whole sequence.
    async fn open_consumer(&self, queue: &QueueName) -> Result<(ConnectionPtr, u64, ConsumerHandle)> {
        // ---
        self.with_reconnect(|conn, epoch| {
            let queue = queue.clone();
            async move {
                conn.declare_durable(&queue).await?;
                let consumer = conn.open_consumer(&queue).await?;
                Ok((conn, epoch, consumer))
            }
        })
        .await
        .map_err(|err| match err {
            BusError::ConnectionLost(reason) | BusError::Connection(reason) => BusError::Consume {
                queue: queue.to_string(),
                reason,
            },
            other => other,
        })
    }
}

fn reclassify_ack(err: BusError) -> BusError {
    match err {
        BusError::ConnectionLost(reason) | BusError::Connection(reason) => BusError::Ack(reason),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::MemoryBroker;

    #[tokio::test]
    async fn operations_require_connect() {
        // ---
        let broker = MemoryBroker::new();
        let client = BusClient::new(broker.connector());

        let queue = QueueName::from("q");
        let err = client
            .send(&queue, &OutboundMessage::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected));

        let err = client.ensure_durable(&queue).await.unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
    }

    #[tokio::test]
    async fn connect_replaces_connection_and_bumps_epoch() {
        // ---
        let broker = MemoryBroker::new();
        let client = BusClient::new(broker.connector());

        client.connect().await.unwrap();
        let (_, first) = client.current().await.unwrap();
        client.connect().await.unwrap();
        let (_, second) = client.current().await.unwrap();

        assert_eq!(second, first + 1);
    }

    /// Deliver one message at the transport level, without acking, and wrap
    /// it the way the consume loop would.
    async fn receive_one(client: &BusClient, queue: &QueueName) -> InboundMessage {
        // ---
        let (conn, epoch) = client.current().await.unwrap();
        let mut consumer = conn.open_consumer(queue).await.unwrap();
        let delivery = consumer.inbox.recv().await.unwrap();
        InboundMessage {
            body: delivery.body,
            correlation_id: delivery.correlation_id,
            delivery: DeliveryHandle::new(epoch, delivery.tag),
        }
    }

    #[tokio::test]
    async fn explicit_acknowledge_removes_message() {
        // ---
        let broker = MemoryBroker::new();
        let client = BusClient::new(broker.connector());
        client.connect().await.unwrap();

        let queue = QueueName::from("q");
        client
            .send(&queue, &OutboundMessage::new("one"))
            .await
            .unwrap();

        let msg = receive_one(&client, &queue).await;
        client.acknowledge(&msg).await.unwrap();
        assert_eq!(broker.queue_len("q").await, 0);

        // A second ack of the same delivery is an error, not a silent no-op.
        let err = client.acknowledge(&msg).await.unwrap_err();
        assert!(matches!(err, BusError::Ack(_)));
    }

    #[tokio::test]
    async fn reject_with_requeue_returns_message() {
        // ---
        let broker = MemoryBroker::new();
        let client = BusClient::new(broker.connector());
        client.connect().await.unwrap();

        let queue = QueueName::from("q");
        client
            .send(&queue, &OutboundMessage::new("bounce"))
            .await
            .unwrap();

        let msg = receive_one(&client, &queue).await;
        client.reject(&msg, true).await.unwrap();

        assert_eq!(broker.queue_len("q").await, 1);
        assert_eq!(broker.dead_letter_len("q").await, 0);
    }

    #[tokio::test]
    async fn reject_without_requeue_dead_letters() {
        // ---
        let broker = MemoryBroker::new();
        let client = BusClient::new(broker.connector());
        client.connect().await.unwrap();

        let queue = QueueName::from("q");
        client
            .send(&queue, &OutboundMessage::new("poison"))
            .await
            .unwrap();

        let msg = receive_one(&client, &queue).await;
        client.reject(&msg, false).await.unwrap();

        assert_eq!(broker.queue_len("q").await, 0);
        assert_eq!(broker.dead_letter_len("q").await, 1);
    }

    #[tokio::test]
    async fn stale_handle_is_never_acked_against_new_connection() {
        // ---
        let broker = MemoryBroker::new();
        let client = BusClient::new(broker.connector());
        client.connect().await.unwrap();

        let queue = QueueName::from("q");
        client
            .send(&queue, &OutboundMessage::new("orphan"))
            .await
            .unwrap();

        let msg = receive_one(&client, &queue).await;

        // Supersede the connection that issued the handle.
        client.connect().await.unwrap();

        let err = client.acknowledge(&msg).await.unwrap_err();
        assert!(matches!(err, BusError::StaleDelivery));
        let err = client.reject(&msg, true).await.unwrap_err();
        assert!(matches!(err, BusError::StaleDelivery));

        // The broker got the message back; it is not lost.
        assert_eq!(broker.queue_len("q").await, 1);
    }

    #[tokio::test]
    async fn ack_on_lost_connection_reconnects_then_reports_stale() {
        // ---
        // The ack path follows the uniform reconnect algorithm, but the
        // post-reconnect retry finds the handle stale: the reconnect
        // restores the client without acking against the new connection.
        // ---
        let broker = MemoryBroker::new();
        let client = BusClient::new(broker.connector());
        client.connect().await.unwrap();

        let queue = QueueName::from("q");
        client
            .send(&queue, &OutboundMessage::new("in flight"))
            .await
            .unwrap();

        let msg = receive_one(&client, &queue).await;

        // Kill the transport out from under the still-current handle.
        broker.kill_connections().await;

        let err = client.acknowledge(&msg).await.unwrap_err();
        assert!(matches!(err, BusError::StaleDelivery));

        // The broker kept the message, and the reconnect left the client
        // usable for subsequent operations.
        assert_eq!(broker.queue_len("q").await, 1);
        client
            .send(&queue, &OutboundMessage::new("next"))
            .await
            .unwrap();
        assert_eq!(broker.queue_len("q").await, 2);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        // ---
        let broker = MemoryBroker::new();
        let client = BusClient::new(broker.connector());

        client.connect().await.unwrap();
        client.stop().await;
        client.stop().await;

        assert!(matches!(
            client.current().await,
            Err(BusError::NotConnected)
        ));
    }
}
