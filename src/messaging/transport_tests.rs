//! End-to-end tests running a [Sender] against a [Receiver] over real TCP connections

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Instant};

use crate::messaging::config::TransportConfig;
use crate::messaging::connector::{BoxedConnection, Connector, TcpConnector};
use crate::messaging::envelope::{Envelope, OutboundRequest};
use crate::messaging::receiver::Receiver;
use crate::messaging::sender::Sender;

async fn bind_local() -> Receiver {
    Receiver::bind("127.0.0.1:0", Arc::new(TransportConfig::new())).await.unwrap()
}

async fn recv_within(receiver: &mut Receiver, duration: Duration) -> Envelope {
    timeout(duration, receiver.recv()).await
        .expect("timed out waiting for an envelope")
        .expect("inbound queue was closed")
}

/// an address where nothing listens
async fn unused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

#[tokio::test]
async fn test_envelope_arrives_at_receiver() {
    let mut receiver = bind_local().await;
    let sender = Sender::new(Arc::new(TransportConfig::new())).unwrap();

    let sent = Envelope::new(1, 7, "ping");
    sender.send(OutboundRequest::new(receiver.local_addr().to_string(), sent.clone())).await;

    assert_eq!(recv_within(&mut receiver, Duration::from_secs(5)).await, sent);
    sender.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_envelopes_arrive_in_submission_order() {
    let mut receiver = bind_local().await;
    let sender = Sender::new(Arc::new(TransportConfig::new())).unwrap();
    let destination = receiver.local_addr().to_string();

    for n in 0..100 {
        sender.send_to(destination.clone(), Envelope::new(1, 7, n.to_string())).await;
    }

    for n in 0..100 {
        let envelope = recv_within(&mut receiver, Duration::from_secs(5)).await;
        assert_eq!(envelope.payload().as_ref(), n.to_string().as_bytes());
    }
    sender.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_destination_drops_envelope() {
    let mut receiver = bind_local().await;
    let sender = Sender::new(Arc::new(TransportConfig::new())).unwrap();
    let nowhere = unused_addr().await;

    timeout(Duration::from_secs(1), sender.send_to(nowhere.clone(), Envelope::new(1, 7, "lost"))).await
        .expect("submitting must not block");
    timeout(Duration::from_secs(1), sender.send_to(nowhere, Envelope::new(1, 7, "lost too"))).await
        .expect("submitting must not block");

    assert!(timeout(Duration::from_millis(300), receiver.recv()).await.is_err());
    sender.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_delivers_pending_envelopes() {
    let mut receiver = bind_local().await;
    let sender = Sender::new(Arc::new(TransportConfig::new())).unwrap();
    let destination = receiver.local_addr().to_string();

    for n in 0..10 {
        sender.send_to(destination.clone(), Envelope::new(2, 1, n.to_string())).await;
    }
    sender.shutdown().await.unwrap();

    for n in 0..10 {
        let envelope = recv_within(&mut receiver, Duration::from_secs(5)).await;
        assert_eq!(envelope, Envelope::new(2, 1, n.to_string()));
    }
}

#[tokio::test]
async fn test_two_nodes_exchange_envelopes() {
    let mut receiver_a = bind_local().await;
    let mut receiver_b = bind_local().await;
    let sender_a = Sender::new(Arc::new(TransportConfig::new())).unwrap();
    let sender_b = Sender::new(Arc::new(TransportConfig::new())).unwrap();

    sender_a.send_to(receiver_b.local_addr().to_string(), Envelope::new(1, 1, "hello b")).await;
    sender_b.send_to(receiver_a.local_addr().to_string(), Envelope::new(2, 1, "hello a")).await;

    assert_eq!(recv_within(&mut receiver_b, Duration::from_secs(5)).await, Envelope::new(1, 1, "hello b"));
    assert_eq!(recv_within(&mut receiver_a, Duration::from_secs(5)).await, Envelope::new(2, 1, "hello a"));

    sender_a.shutdown().await.unwrap();
    sender_b.shutdown().await.unwrap();
}


/// Delays connecting to one specific destination
struct DelayingConnector {
    slow_destination: String,
    delay: Duration,
}
#[async_trait]
impl Connector for DelayingConnector {
    async fn connect(&self, destination: &str) -> anyhow::Result<BoxedConnection> {
        if destination == self.slow_destination {
            sleep(self.delay).await;
        }
        TcpConnector.connect(destination).await
    }
}

#[tokio::test]
async fn test_slow_destination_does_not_block_others() {
    let mut slow_receiver = bind_local().await;
    let mut fast_receiver = bind_local().await;
    let slow = slow_receiver.local_addr().to_string();
    let fast = fast_receiver.local_addr().to_string();

    let connector = Arc::new(DelayingConnector {
        slow_destination: slow.clone(),
        delay: Duration::from_millis(1500),
    });
    let sender = Sender::with_connector(Arc::new(TransportConfig::new()), connector).unwrap();

    let start = Instant::now();
    for n in 0..5 {
        sender.send_to(slow.clone(), Envelope::new(1, 1, n.to_string())).await;
        sender.send_to(fast.clone(), Envelope::new(1, 2, n.to_string())).await;
    }

    for n in 0..5 {
        let envelope = recv_within(&mut fast_receiver, Duration::from_millis(1000)).await;
        assert_eq!(envelope, Envelope::new(1, 2, n.to_string()));
    }
    assert!(start.elapsed() < Duration::from_millis(1500));

    for n in 0..5 {
        let envelope = recv_within(&mut slow_receiver, Duration::from_secs(5)).await;
        assert_eq!(envelope, Envelope::new(1, 1, n.to_string()));
    }
    sender.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_closed_connection_is_reopened_on_next_send() {
    let mut receiver = bind_local().await;
    let sender = Sender::new(Arc::new(TransportConfig::new())).unwrap();
    let destination = receiver.local_addr().to_string();

    sender.send_to(destination.clone(), Envelope::new(1, 1, "first")).await;
    assert_eq!(recv_within(&mut receiver, Duration::from_secs(5)).await, Envelope::new(1, 1, "first"));

    sender.close(destination.clone()).await;
    sender.send_to(destination.clone(), Envelope::new(1, 1, "second")).await;
    assert_eq!(recv_within(&mut receiver, Duration::from_secs(5)).await, Envelope::new(1, 1, "second"));

    sender.shutdown().await.unwrap();
}


/// Delays the first connect attempt
#[derive(Default)]
struct SlowFirstConnector {
    connected_before: AtomicBool,
}
#[async_trait]
impl Connector for SlowFirstConnector {
    async fn connect(&self, destination: &str) -> anyhow::Result<BoxedConnection> {
        if !self.connected_before.swap(true, Ordering::AcqRel) {
            sleep(Duration::from_millis(500)).await;
        }
        TcpConnector.connect(destination).await
    }
}

#[tokio::test]
async fn test_envelopes_before_and_after_close_arrive_in_order() {
    let mut receiver = bind_local().await;
    let destination = receiver.local_addr().to_string();
    let sender = Sender::with_connector(Arc::new(TransportConfig::new()), Arc::new(SlowFirstConnector::default())).unwrap();

    sender.send_to(destination.clone(), Envelope::new(1, 1, "first")).await;
    sender.close(destination.clone()).await;
    sender.send_to(destination.clone(), Envelope::new(1, 1, "second")).await;

    assert_eq!(recv_within(&mut receiver, Duration::from_secs(5)).await, Envelope::new(1, 1, "first"));
    assert_eq!(recv_within(&mut receiver, Duration::from_secs(5)).await, Envelope::new(1, 1, "second"));
    sender.shutdown().await.unwrap();
}
