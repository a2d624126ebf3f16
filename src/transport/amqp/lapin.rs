//! AMQP transport implementation using `lapin`.
//!
//! One [`BusConnection`] corresponds to one AMQP connection with a single
//! channel. The client layer owns reconnection; this module only has to
//! classify failures honestly: errors on an established channel surface as
//! `ConnectionLost` (retryable), declaration property conflicts as
//! `Declaration`, and connect-time failures as `Connection`.
//!
//! ## Queue and delivery semantics
//!
//! - Queues are declared `durable: true`, non-exclusive, no auto-delete.
//! - Published messages are marked persistent (delivery mode 2), so the
//!   durable-queue guarantee holds across broker restarts.
//! - Consumers use manual acknowledgment with the configured prefetch
//!   (default 1, which serializes processing).
//! - `nack` with `requeue: false` relies on the queue's dead-letter
//!   exchange configuration; without one the broker drops the message.
//!   Dead-letter topology is broker configuration, not client state.
//!
//! Incoming deliveries are pumped from the lapin consumer stream into an
//! mpsc channel by a background task; the channel closing is the signal to
//! the client layer that the session died.

use lapin::{
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::transport::{
    BusConnection, BusConnector, ConnectionPtr, ConnectorPtr, ConsumerHandle, Delivery,
};
use crate::{BusConfig, BusError, CorrelationId, OutboundMessage, QueueName, Result};

/// Create an AMQP connector from the given configuration.
///
/// No connection is opened here; the client layer drives `connect()` both
/// initially and on every reconnect.
pub fn create_amqp_connector(config: &BusConfig) -> ConnectorPtr {
    // ---
    Arc::new(AmqpConnector {
        uri: broker_uri(config),
        client_id: config.client_id.clone(),
        prefetch: config.prefetch.max(1),
    })
}

/// Assemble the broker URI from the configuration parts.
///
/// A configured endpoint that already carries a scheme is used verbatim;
/// otherwise host, port, virtual host, credentials and heartbeat are
/// composed into an `amqp://` URI.
fn broker_uri(config: &BusConfig) -> String {
    // ---
    if config.endpoint.contains("://") {
        return config.endpoint.clone();
    }

    let auth = match (&config.username, &config.password) {
        (Some(user), Some(pass)) => format!("{user}:{pass}@"),
        _ => String::new(),
    };
    let port = config.port.unwrap_or(5672);
    let vhost = match &config.virtual_host {
        // AMQP URIs carry the vhost percent-encoded; "/" is %2f.
        Some(vhost) => vhost.replace('/', "%2f"),
        None => "%2f".to_string(),
    };
    let heartbeat = match config.heartbeat_secs {
        Some(secs) => format!("?heartbeat={secs}"),
        None => String::new(),
    };

    format!(
        "amqp://{auth}{host}:{port}/{vhost}{heartbeat}",
        host = config.endpoint
    )
}

struct AmqpConnector {
    uri: String,
    client_id: String,
    prefetch: u16,
}

#[async_trait::async_trait]
impl BusConnector for AmqpConnector {
    async fn connect(&self) -> Result<ConnectionPtr> {
        // ---
        info!(client_id = %self.client_id, "connecting to AMQP broker");

        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|err| BusError::Connection(format!("amqp: connect failed: {err}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|err| BusError::Connection(format!("amqp: channel creation failed: {err}")))?;

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| BusError::Connection(format!("amqp: qos setup failed: {err}")))?;

        info!(client_id = %self.client_id, prefetch = self.prefetch, "connected to AMQP broker");

        Ok(Arc::new(AmqpConnection {
            connection,
            channel,
            client_id: self.client_id.clone(),
            prefetch: self.prefetch,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    channel: Channel,
    client_id: String,
    prefetch: u16,
}

/// Whether a lapin error means the established session is gone, as opposed
/// to the broker refusing the specific operation.
fn is_session_lost(err: &lapin::Error) -> bool {
    // ---
    matches!(
        err,
        lapin::Error::IOError(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::InvalidChannelState(_)
    )
}

fn lost(err: &lapin::Error) -> BusError {
    BusError::ConnectionLost(format!("amqp: {err}"))
}

#[async_trait::async_trait]
impl BusConnection for AmqpConnection {
    async fn declare_durable(&self, queue: &QueueName) -> Result<()> {
        // ---
        let options = QueueDeclareOptions {
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: false,
            nowait: false,
        };

        self.channel
            .queue_declare(queue.as_str().into(), options, FieldTable::default())
            .await
            .map_err(|err| {
                if is_session_lost(&err) {
                    lost(&err)
                } else {
                    // Typically PRECONDITION_FAILED: the queue exists with
                    // conflicting properties.
                    BusError::Declaration {
                        queue: queue.to_string(),
                        reason: format!("amqp: {err}"),
                    }
                }
            })?;

        debug!(queue = %queue, "declared durable queue");
        Ok(())
    }

    async fn publish(&self, queue: &QueueName, msg: &OutboundMessage) -> Result<()> {
        // ---
        // Persistent delivery into the default exchange; routing key is the
        // queue name.
        let mut properties = BasicProperties::default().with_delivery_mode(2);
        if let Some(correlation_id) = &msg.correlation_id {
            properties =
                properties.with_correlation_id(ShortString::from(correlation_id.to_string()));
        }

        self.channel
            .basic_publish(
                "".into(),
                queue.as_str().into(),
                BasicPublishOptions::default(),
                &msg.body,
                properties,
            )
            .await
            .map_err(|err| lost(&err))?;

        debug!(queue = %queue, "published message");
        Ok(())
    }

    async fn open_consumer(&self, queue: &QueueName) -> Result<ConsumerHandle> {
        // ---
        let consumer = self
            .channel
            .basic_consume(
                queue.as_str().into(),
                &format!("{}-consumer", self.client_id),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                if is_session_lost(&err) {
                    lost(&err)
                } else {
                    BusError::Consume {
                        queue: queue.to_string(),
                        reason: format!("amqp: {err}"),
                    }
                }
            })?;

        info!(queue = %queue, "started consuming");

        let (tx, rx) = mpsc::channel(self.prefetch.max(1) as usize);
        let client_id = self.client_id.clone();
        let queue_name = queue.to_string();

        tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        let correlation_id = delivery
                            .properties
                            .correlation_id()
                            .as_ref()
                            .map(|id| CorrelationId::from(id.as_str()));

                        let delivery = Delivery {
                            body: Bytes::from(delivery.data),
                            correlation_id,
                            tag: delivery.delivery_tag,
                        };

                        if tx.send(delivery).await.is_err() {
                            // Receiver dropped; the consume loop moved on.
                            break;
                        }
                    }
                    Err(err) => {
                        error!(client_id = %client_id, queue = %queue_name,
                               error = %err, "consumer stream error");
                        break;
                    }
                }
            }

            debug!(client_id = %client_id, queue = %queue_name, "consumer pump ended");
        });

        Ok(ConsumerHandle { inbox: rx })
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        // ---
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|err| {
                if is_session_lost(&err) {
                    lost(&err)
                } else {
                    BusError::Ack(format!("amqp: {err}"))
                }
            })
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<()> {
        // ---
        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };

        self.channel
            .basic_nack(tag, options)
            .await
            .map_err(|err| {
                if is_session_lost(&err) {
                    lost(&err)
                } else {
                    BusError::Ack(format!("amqp: {err}"))
                }
            })
    }

    async fn close(&self) -> Result<()> {
        // ---
        // The session may already be dead; a failed close is not an error
        // worth surfacing to stop().
        let _ = self.channel.close(200, "client stop".into()).await;
        let _ = self.connection.close(200, "client stop".into()).await;
        Ok(())
    }
}
