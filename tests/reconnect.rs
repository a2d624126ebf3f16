// tests/reconnect.rs

//! Reconnect-once behavior under injected transport failures.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, timeout};

use busline::BusConnection as _;
use busline::{BusClient, BusError, MemoryBroker, OutboundMessage, QueueName};

/// Poll `cond` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(2), async {
        loop {
            if cond().await {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn send_survives_one_transport_failure() {
    // ---
    // Transport fails on attempt 1, succeeds after the reconnect: the send
    // succeeds and the message is enqueued exactly once.
    // ---
    let broker = MemoryBroker::new();
    let queue = QueueName::from("q");

    let client = BusClient::new(broker.connector());
    client.connect().await.expect("connect failed");

    broker.fail_next_publishes(1).await;
    client
        .send(&queue, &OutboundMessage::new("payload"))
        .await
        .expect("send should succeed after one reconnect");

    assert_eq!(broker.queue_len("q").await, 1);
}

#[tokio::test]
async fn send_fails_when_retry_also_fails() {
    // ---
    // Transport fails on attempt 1 and on the post-reconnect retry: a
    // SendError surfaces and nothing is enqueued.
    // ---
    let broker = MemoryBroker::new();
    let queue = QueueName::from("q");

    let client = BusClient::new(broker.connector());
    client.connect().await.expect("connect failed");

    broker.fail_next_publishes(2).await;
    let err = client
        .send(&queue, &OutboundMessage::new("payload"))
        .await
        .expect_err("send should fail after exhausted retry");

    assert!(matches!(err, BusError::Send { .. }));
    assert_eq!(broker.queue_len("q").await, 0);
}

#[tokio::test]
async fn send_fails_when_reconnect_fails() {
    // ---
    let broker = MemoryBroker::new();
    let queue = QueueName::from("q");

    let client = BusClient::new(broker.connector());
    client.connect().await.expect("connect failed");

    broker.fail_next_publishes(1).await;
    broker.fail_next_connects(1).await;

    let err = client
        .send(&queue, &OutboundMessage::new("payload"))
        .await
        .expect_err("send should fail when reconnect fails");

    assert!(matches!(err, BusError::Send { .. }));
    assert_eq!(broker.queue_len("q").await, 0);
}

#[tokio::test]
async fn ensure_durable_reports_declaration_error_when_reconnect_fails() {
    // ---
    // The declaration hits a dead connection and the reconnect fails too:
    // the caller gets a Declaration error, not a raw connection error.
    // ---
    let broker = MemoryBroker::new();

    let client = BusClient::new(broker.connector());
    client.connect().await.expect("connect failed");

    broker.kill_connections().await;
    broker.fail_next_connects(1).await;

    let err = client
        .ensure_durable(&QueueName::from("q"))
        .await
        .expect_err("declaration should fail when reconnect fails");

    assert!(matches!(err, BusError::Declaration { .. }));
}

#[tokio::test]
async fn consume_reports_consume_error_when_reconnect_fails_at_open() {
    // ---
    let broker = MemoryBroker::new();
    let queue = QueueName::from("q");

    let client = BusClient::new(broker.connector());
    client.connect().await.expect("connect failed");

    broker.kill_connections().await;
    broker.fail_next_connects(1).await;

    let err = client
        .start_consuming(&queue, |_msg| async { Ok::<(), busline::HandlerError>(()) })
        .await
        .expect_err("consume should fail when reconnect fails");

    assert!(matches!(err, BusError::Consume { .. }));
}

#[tokio::test]
async fn consume_loop_reconnects_after_killed_connection() {
    // ---
    // Arrange: consumer running, then the broker drops every connection.
    // ---
    let broker = MemoryBroker::new();
    let queue = QueueName::from("q");

    let consumer = Arc::new(BusClient::new(broker.connector()));
    consumer.connect().await.expect("consumer connect failed");

    let seen = Arc::new(Mutex::new(0u32));

    let loop_handle = tokio::spawn({
        let consumer = Arc::clone(&consumer);
        let seen = Arc::clone(&seen);
        let queue = queue.clone();
        async move {
            consumer
                .start_consuming(&queue, move |_msg| {
                    let seen = Arc::clone(&seen);
                    async move {
                        *seen.lock().unwrap() += 1;
                        Ok(())
                    }
                })
                .await
        }
    });

    assert!(
        eventually(|| {
            let broker = broker.clone();
            async move { broker.has_consumer("q").await }
        })
        .await
    );

    // ---
    // Act: kill the connection, then publish from a fresh producer.
    // ---
    broker.kill_connections().await;

    let producer = BusClient::new(broker.connector());
    producer.connect().await.expect("producer connect failed");
    producer
        .send(&queue, &OutboundMessage::new("after the partition"))
        .await
        .expect("send failed");

    // ---
    // Assert: the loop reconnected once and kept consuming.
    // ---
    assert!(
        eventually(|| {
            let seen = Arc::clone(&seen);
            async move { *seen.lock().unwrap() == 1 }
        })
        .await
    );

    consumer.stop().await;
    loop_handle
        .await
        .expect("consume task panicked")
        .expect("consume loop failed");
}

#[tokio::test]
async fn consume_loop_terminates_when_reconnect_fails() {
    // ---
    let broker = MemoryBroker::new();
    let queue = QueueName::from("q");

    let consumer = Arc::new(BusClient::new(broker.connector()));
    consumer.connect().await.expect("consumer connect failed");

    let loop_handle = tokio::spawn({
        let consumer = Arc::clone(&consumer);
        let queue = queue.clone();
        async move {
            consumer
                .start_consuming(&queue, |_msg| async { Ok::<(), busline::HandlerError>(()) })
                .await
        }
    });

    assert!(
        eventually(|| {
            let broker = broker.clone();
            async move { broker.has_consumer("q").await }
        })
        .await
    );

    broker.fail_next_connects(1).await;
    broker.kill_connections().await;

    let result = timeout(Duration::from_secs(2), loop_handle)
        .await
        .expect("consume loop did not terminate")
        .expect("consume task panicked");

    assert!(matches!(result, Err(BusError::Consume { .. })));
}

#[tokio::test]
async fn killed_connection_returns_unacked_messages() {
    // ---
    // A message delivered but never acknowledged goes back onto the queue
    // when its connection dies; nothing is lost.
    // ---
    let broker = MemoryBroker::new();
    let queue = QueueName::from("q");

    let producer = BusClient::new(broker.connector());
    producer.connect().await.expect("producer connect failed");
    producer
        .send(&queue, &OutboundMessage::new("in flight"))
        .await
        .expect("send failed");

    // Deliver without acking by consuming at the transport level.
    let conn = broker
        .connector()
        .connect()
        .await
        .expect("raw connect failed");
    let mut handle = conn.open_consumer(&queue).await.expect("open consumer failed");
    let delivery = handle.inbox.recv().await.expect("no delivery");
    assert_eq!(delivery.body.as_ref(), b"in flight");
    assert_eq!(broker.queue_len("q").await, 1); // unacked, still owned by the queue

    broker.kill_connections().await;
    assert_eq!(broker.queue_len("q").await, 1); // back in ready
}
