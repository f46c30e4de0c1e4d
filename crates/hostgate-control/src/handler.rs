//! Tunnel connection handler
//!
//! Runs the per-connection state machine on the gateway: wait for a
//! handshake, register the service, then route responses back to their
//! waiters until the connection goes away.

use crate::connection::ServiceConnection;
use crate::registry::ServiceRegistry;
use crate::ControlError;
use hostgate_proto::{
    run_packet_writer, FrameCodec, FrameReader, Packet, PacketCodec, DEFAULT_TUNNEL_PORT,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Gateway-side tunnel settings
#[derive(Debug, Clone)]
pub struct TunnelServerConfig {
    pub bind_addr: SocketAddr,
    /// Shared key clients must present. `None` or empty disables the check.
    pub auth_key: Option<String>,
    /// Close a connection when no bytes arrive for this long
    pub read_timeout: Duration,
    /// Expire requests that have waited longer than this
    pub pending_ttl: Option<Duration>,
    pub max_frame_size: Option<usize>,
    /// Packets queued per connection before senders wait
    pub outbound_capacity: usize,
}

impl Default for TunnelServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_TUNNEL_PORT)),
            auth_key: None,
            read_timeout: Duration::from_secs(30),
            pending_ttl: None,
            max_frame_size: None,
            outbound_capacity: 256,
        }
    }
}

impl TunnelServerConfig {
    fn required_key(&self) -> Option<&str> {
        self.auth_key.as_deref().filter(|key| !key.is_empty())
    }

    fn frame_codec(&self) -> FrameCodec {
        match self.max_frame_size {
            Some(limit) => FrameCodec::new().with_max_frame_size(limit),
            None => FrameCodec::new(),
        }
    }
}

/// What the read loop does after a packet
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Accepts tunnel connections and feeds them into the shared registry
pub struct TunnelHandler {
    config: TunnelServerConfig,
    registry: ServiceRegistry,
}

impl TunnelHandler {
    pub fn new(config: TunnelServerConfig, registry: ServiceRegistry) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TunnelServerConfig {
        &self.config
    }

    /// Run one tunnel connection to completion
    pub async fn handle_connection<S>(&self, stream: S, peer_addr: String)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let connection = Arc::new(ServiceConnection::new(peer_addr, outbound_tx));
        let shutdown = connection.shutdown_token();

        info!(
            "New tunnel connection {} from {}",
            connection.id(),
            connection.peer_addr()
        );

        let writer = tokio::spawn(run_packet_writer(
            write_half,
            outbound_rx,
            PacketCodec::with_frame_codec(self.config.frame_codec()),
            shutdown.clone(),
            connection.id().to_string(),
        ));

        let sweeper = self.config.pending_ttl.map(|ttl| {
            let connection = connection.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(ttl.max(Duration::from_millis(10)));
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = connection.closed() => break,
                        _ = interval.tick() => {
                            let expired = connection.pending().expire_older_than(ttl);
                            if expired > 0 {
                                warn!("[{}] Expired {} pending requests", connection.id(), expired);
                            }
                        }
                    }
                }
            })
        });

        let mut reader = FrameReader::new(read_half)
            .with_codec(self.config.frame_codec())
            .with_idle_timeout(self.config.read_timeout);

        loop {
            let packet = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("[{}] Connection closed locally", connection.id());
                    break;
                }
                result = reader.next_packet() => result,
            };

            match packet {
                Ok(Some(packet)) => {
                    if self.process(&connection, packet) == Flow::Close {
                        break;
                    }
                }
                Ok(None) => {
                    info!("[{}] Tunnel closed by peer", connection.id());
                    break;
                }
                Err(e) if e.is_timeout() => {
                    warn!(
                        "[{}] No data for {:?}, closing tunnel",
                        connection.id(),
                        self.config.read_timeout
                    );
                    break;
                }
                Err(e) => {
                    error!("[{}] Failed to read from tunnel: {}", connection.id(), e);
                    break;
                }
            }
        }

        connection.close();
        let drained = connection.pending().close_all();
        if drained > 0 {
            debug!(
                "[{}] Failed {} pending requests on close",
                connection.id(),
                drained
            );
        }
        if let Some(name) = connection.name() {
            self.registry.deregister(name, connection.id());
        }

        let _ = writer.await;
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        info!(
            "Tunnel connection {} ({:?}) closed",
            connection.id(),
            connection.name()
        );
    }

    fn process(&self, connection: &Arc<ServiceConnection>, packet: Packet) -> Flow {
        match packet {
            Packet::Handshake { service, key } => {
                if connection.is_named() {
                    debug!(
                        "[{}] Ignoring repeated handshake for '{}'",
                        connection.id(),
                        service
                    );
                    return Flow::Continue;
                }

                if let Some(expected) = self.config.required_key() {
                    if key != expected {
                        warn!(
                            "[{}] Unauthorized handshake for '{}' from {}",
                            connection.id(),
                            service,
                            connection.peer_addr()
                        );
                        return Flow::Close;
                    }
                }

                if service.is_empty() {
                    warn!("[{}] Handshake with empty service name", connection.id());
                    return Flow::Close;
                }

                connection.set_name(service.clone());
                self.registry.register(&service, connection.clone());
                Flow::Continue
            }
            Packet::Ping { time } => {
                if let Err(e) = connection.try_send(Packet::Pong { time }) {
                    warn!("[{}] Failed to queue pong: {}", connection.id(), e);
                }
                Flow::Continue
            }
            Packet::Response(response) if connection.is_named() => {
                connection.pending().respond(response);
                Flow::Continue
            }
            Packet::Failure { id, message, .. } if connection.is_named() => {
                warn!(
                    "[{}] Handler for request {} failed: {}",
                    connection.id(),
                    id,
                    message
                );
                connection.pending().fail(id, message);
                Flow::Continue
            }
            other => {
                debug!(
                    "[{}] Dropping unexpected {} packet",
                    connection.id(),
                    other.kind()
                );
                Flow::Continue
            }
        }
    }

    /// Accept tunnel connections on `listener` until it fails permanently
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    let handler = self.clone();
                    tokio::spawn(async move {
                        handler.handle_connection(stream, peer.to_string()).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept tunnel connection: {}", e);
                }
            }
        }
    }
}

/// Bound tunnel port
pub struct TunnelListener {
    listener: TcpListener,
}

impl TunnelListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, ControlError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ControlError::BindError {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;
        info!("Tunnel listener bound on {}", addr);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ControlError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self, handler: Arc<TunnelHandler>) {
        handler.serve(self.listener).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostgate_proto::{TunnelRequest, TunnelResponse};

    fn handler(auth_key: Option<&str>) -> TunnelHandler {
        TunnelHandler::new(
            TunnelServerConfig {
                auth_key: auth_key.map(str::to_string),
                ..Default::default()
            },
            ServiceRegistry::new(),
        )
    }

    fn connection() -> (Arc<ServiceConnection>, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(ServiceConnection::new("peer", tx)), rx)
    }

    #[test]
    fn test_default_config() {
        let config = TunnelServerConfig::default();
        assert_eq!(config.bind_addr.port(), 9090);
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert!(config.auth_key.is_none());
        assert!(config.pending_ttl.is_none());
    }

    #[test]
    fn test_empty_key_disables_auth() {
        let config = TunnelServerConfig {
            auth_key: Some(String::new()),
            ..Default::default()
        };
        assert!(config.required_key().is_none());
    }

    #[tokio::test]
    async fn test_handshake_registers() {
        let handler = handler(None);
        let (conn, _rx) = connection();

        let flow = handler.process(&conn, Packet::handshake("orders", None));

        assert_eq!(flow, Flow::Continue);
        assert_eq!(conn.name(), Some("orders"));
        assert_eq!(handler.registry().lookup("orders").unwrap().id(), conn.id());
    }

    #[tokio::test]
    async fn test_wrong_key_closes_without_registering() {
        let handler = handler(Some("secret"));
        let (conn, _rx) = connection();

        let flow = handler.process(&conn, Packet::handshake("orders", Some("nope")));

        assert_eq!(flow, Flow::Close);
        assert!(!conn.is_named());
        assert!(handler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_second_handshake_ignored() {
        let handler = handler(None);
        let (conn, _rx) = connection();

        handler.process(&conn, Packet::handshake("orders", None));
        handler.process(&conn, Packet::handshake("billing", None));

        assert_eq!(conn.name(), Some("orders"));
        assert!(handler.registry().lookup("billing").is_none());
    }

    #[tokio::test]
    async fn test_ping_queues_pong_before_handshake() {
        let handler = handler(None);
        let (conn, mut rx) = connection();

        handler.process(&conn, Packet::Ping { time: 42 });

        assert_eq!(rx.recv().await, Some(Packet::Pong { time: 42 }));
    }

    #[tokio::test]
    async fn test_response_before_handshake_dropped() {
        let handler = handler(None);
        let (conn, _rx) = connection();
        let pending = conn.pending().register(1).unwrap();

        let response = TunnelResponse::new(200).answering(&TunnelRequest::new(1, "x", "GET", "/"));
        let flow = handler.process(&conn, Packet::Response(response));

        assert_eq!(flow, Flow::Continue);
        assert_eq!(conn.pending().count(), 1);
        drop(pending);
    }

    #[tokio::test]
    async fn test_failure_reaches_waiter() {
        let handler = handler(None);
        let (conn, _rx) = connection();
        handler.process(&conn, Packet::handshake("orders", None));
        let pending = conn.pending().register(4).unwrap();

        handler.process(
            &conn,
            Packet::Failure {
                id: 4,
                name: "orders".to_string(),
                message: "database down".to_string(),
            },
        );

        assert!(matches!(
            pending.wait().await,
            Err(ControlError::HandlerFailed { id: 4, .. })
        ));
    }
}
