//! Integration tests for the gateway side of a tunnel
//!
//! A raw framed TCP client stands in for the tunnel client so every packet on
//! the wire is under the test's control.

use futures::SinkExt;
use hostgate_control::{
    ControlError, Dispatcher, ServiceRegistry, TunnelHandler, TunnelListener, TunnelServerConfig,
};
use hostgate_proto::{FrameReader, Packet, PacketCodec, TunnelRequest, TunnelResponse};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::FramedWrite;
use tracing::info;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

async fn start_gateway(config: TunnelServerConfig) -> (SocketAddr, ServiceRegistry) {
    let registry = ServiceRegistry::new();
    let handler = Arc::new(TunnelHandler::new(config, registry.clone()));

    let listener = TunnelListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.serve(handler));

    (addr, registry)
}

struct RawClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FramedWrite<OwnedWriteHalf, PacketCodec>,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FrameReader::new(read_half),
            writer: FramedWrite::new(write_half, PacketCodec::new()),
        }
    }

    async fn send(&mut self, packet: Packet) {
        self.writer.send(packet).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Packet> {
        timeout(Duration::from_secs(5), self.reader.next_packet())
            .await
            .expect("timed out waiting for a packet")
            .ok()
            .flatten()
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_handshake_without_key_registers() {
    init_tracing();
    let (addr, registry) = start_gateway(TunnelServerConfig::default()).await;

    let mut client = RawClient::connect(addr).await;
    client.send(Packet::handshake("orders", None)).await;

    wait_until(|| registry.lookup("orders").is_some()).await;
    assert_eq!(registry.count(), 1);
}

#[tokio::test]
async fn test_wrong_key_is_closed_silently() {
    init_tracing();
    let (addr, registry) = start_gateway(TunnelServerConfig {
        auth_key: Some("s3cret".to_string()),
        ..Default::default()
    })
    .await;

    let mut client = RawClient::connect(addr).await;
    client.send(Packet::handshake("orders", Some("guess"))).await;

    assert_eq!(client.recv().await, None);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_matching_key_registers() {
    init_tracing();
    let (addr, registry) = start_gateway(TunnelServerConfig {
        auth_key: Some("s3cret".to_string()),
        ..Default::default()
    })
    .await;

    let mut client = RawClient::connect(addr).await;
    client.send(Packet::handshake("orders", Some("s3cret"))).await;

    wait_until(|| registry.lookup("orders").is_some()).await;
}

#[tokio::test]
async fn test_ping_is_answered_with_same_time() {
    init_tracing();
    let (addr, _registry) = start_gateway(TunnelServerConfig::default()).await;

    let mut client = RawClient::connect(addr).await;
    client.send(Packet::Ping { time: 1_700_000_000_000 }).await;

    assert_eq!(
        client.recv().await,
        Some(Packet::Pong {
            time: 1_700_000_000_000
        })
    );
}

#[tokio::test]
async fn test_responses_in_reverse_order_reach_their_waiters() {
    init_tracing();
    let (addr, registry) = start_gateway(TunnelServerConfig::default()).await;

    let mut client = RawClient::connect(addr).await;
    client.send(Packet::handshake("orders", None)).await;
    wait_until(|| registry.lookup("orders").is_some()).await;

    let dispatcher = Dispatcher::new(registry.clone());
    let first_id = dispatcher.next_request_id();
    let second_id = dispatcher.next_request_id();
    let first = dispatcher
        .send(TunnelRequest::new(first_id, "orders", "GET", "/a"))
        .await
        .unwrap();
    let second = dispatcher
        .send(TunnelRequest::new(second_id, "orders", "GET", "/b"))
        .await
        .unwrap();

    let mut requests = vec![];
    for _ in 0..2 {
        match client.recv().await {
            Some(Packet::Request(request)) => requests.push(request),
            other => panic!("Expected Request packet, got {:?}", other),
        }
    }
    assert_eq!(requests[0].url, "/a");
    assert_eq!(requests[1].url, "/b");

    for request in requests.iter().rev() {
        let response = TunnelResponse::new(200)
            .answering(request)
            .with_body(request.url.clone());
        client.send(Packet::Response(response)).await;
    }

    let first = first.wait_timeout(Duration::from_secs(5)).await.unwrap();
    let second = second.wait_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!(first.body, b"/a");
    assert_eq!(second.body, b"/b");
}

#[tokio::test]
async fn test_unknown_service_fails_without_io() {
    init_tracing();
    let (_addr, registry) = start_gateway(TunnelServerConfig::default()).await;
    let dispatcher = Dispatcher::new(registry);

    let result = dispatcher
        .send(TunnelRequest::new(1, "nowhere", "GET", "/"))
        .await;
    assert!(matches!(result, Err(ControlError::ServiceNotFound(_))));
}

#[tokio::test]
async fn test_silent_connection_hits_idle_timeout() {
    init_tracing();
    let (addr, registry) = start_gateway(TunnelServerConfig {
        read_timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .await;

    let mut client = RawClient::connect(addr).await;
    client.send(Packet::handshake("orders", None)).await;
    wait_until(|| registry.lookup("orders").is_some()).await;

    info!("Staying silent until the gateway gives up");
    assert_eq!(client.recv().await, None);
    wait_until(|| registry.is_empty()).await;
}

#[tokio::test]
async fn test_newer_handshake_supersedes_older_connection() {
    init_tracing();
    let (addr, registry) = start_gateway(TunnelServerConfig::default()).await;

    let mut old = RawClient::connect(addr).await;
    old.send(Packet::handshake("orders", None)).await;
    wait_until(|| registry.lookup("orders").is_some()).await;
    let old_id = registry.lookup("orders").unwrap().id().to_string();

    let mut new = RawClient::connect(addr).await;
    new.send(Packet::handshake("orders", None)).await;
    wait_until(|| {
        registry
            .lookup("orders")
            .map(|conn| conn.id() != old_id)
            .unwrap_or(false)
    })
    .await;

    assert_eq!(old.recv().await, None);

    // The closed connection's teardown must leave the new owner in place
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(registry.lookup("orders").is_some());
    assert_eq!(registry.count(), 1);

    new.send(Packet::Ping { time: 7 }).await;
    assert_eq!(new.recv().await, Some(Packet::Pong { time: 7 }));
}

#[tokio::test]
async fn test_disconnect_fails_outstanding_requests() {
    init_tracing();
    let (addr, registry) = start_gateway(TunnelServerConfig::default()).await;

    let mut client = RawClient::connect(addr).await;
    client.send(Packet::handshake("orders", None)).await;
    wait_until(|| registry.lookup("orders").is_some()).await;

    let dispatcher = Dispatcher::new(registry.clone());
    let pending = dispatcher
        .send(TunnelRequest::new(1, "orders", "GET", "/slow"))
        .await
        .unwrap();
    assert!(matches!(client.recv().await, Some(Packet::Request(_))));

    drop(client);

    let result = pending.wait_timeout(Duration::from_secs(5)).await;
    assert!(matches!(result, Err(ControlError::ConnectionClosed)));
    wait_until(|| registry.is_empty()).await;
}

#[tokio::test]
async fn test_handle_connection_over_duplex() {
    init_tracing();
    let registry = ServiceRegistry::new();
    let handler = Arc::new(TunnelHandler::new(
        TunnelServerConfig::default(),
        registry.clone(),
    ));

    let (client_side, server_side) = tokio::io::duplex(4096);
    let task = tokio::spawn({
        let handler = handler.clone();
        async move { handler.handle_connection(server_side, "duplex".to_string()).await }
    });

    let (read_half, write_half) = tokio::io::split(client_side);
    let mut writer = FramedWrite::new(write_half, PacketCodec::new());
    let mut reader = FrameReader::new(read_half);

    writer.send(Packet::handshake("billing", None)).await.unwrap();
    writer.send(Packet::Ping { time: 3 }).await.unwrap();
    assert_eq!(
        reader.next_packet().await.unwrap(),
        Some(Packet::Pong { time: 3 })
    );
    assert_eq!(registry.lookup("billing").unwrap().peer_addr(), "duplex");

    drop(writer);
    drop(reader);
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(registry.is_empty());
}
