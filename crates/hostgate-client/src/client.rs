//! Tunnel client
//!
//! Dials the gateway, announces the service name, answers forwarded requests
//! and keeps the session alive. Any failure ends the session; the client
//! waits `reconnect_delay` and starts over.

use crate::config::ClientConfig;
use crate::handler::RequestHandler;
use futures::SinkExt;
use hostgate_proto::{
    now_millis, run_packet_writer, CodecError, FrameReader, Packet, PacketCodec, TunnelRequest,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Packets queued for the writer before senders wait
const OUTBOUND_CAPACITY: usize = 256;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to gateway {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Gateway closed the connection")]
    ConnectionClosed,

    #[error("Client shut down")]
    Shutdown,
}

/// Where the client is in its connect loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Handshaking,
    Active,
}

pub struct TunnelClient {
    config: ClientConfig,
    handler: Arc<dyn RequestHandler>,
    state: watch::Sender<ClientState>,
}

impl TunnelClient {
    pub fn new<H>(config: ClientConfig, handler: H) -> Self
    where
        H: RequestHandler + 'static,
    {
        Self::with_shared_handler(config, Arc::new(handler))
    }

    pub fn with_shared_handler(config: ClientConfig, handler: Arc<dyn RequestHandler>) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            config,
            handler,
            state,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribe to state changes
    pub fn state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ClientState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(
                "[{}] {:?} -> {:?}",
                self.config.service_name, previous, state
            );
        }
    }

    /// Keep a session up forever
    pub async fn run(&self) {
        self.run_until(CancellationToken::new()).await
    }

    /// Keep a session up until `shutdown` is cancelled
    pub async fn run_until(&self, shutdown: CancellationToken) {
        info!(
            "Starting tunnel client for '{}' via {}",
            self.config.service_name, self.config.gateway_addr
        );

        loop {
            match self.run_session(&shutdown).await {
                Err(ClientError::Shutdown) => break,
                Err(e) => warn!(
                    "[{}] Tunnel session ended: {}",
                    self.config.service_name, e
                ),
                Ok(()) => {}
            }
            self.set_state(ClientState::Disconnected);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {
                    debug!("[{}] Reconnecting", self.config.service_name);
                }
            }
        }

        self.set_state(ClientState::Disconnected);
        info!("Tunnel client for '{}' stopped", self.config.service_name);
    }

    async fn run_session(&self, shutdown: &CancellationToken) -> Result<(), ClientError> {
        let addr = self.config.gateway_addr.as_str();

        self.set_state(ClientState::Connecting);
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return Err(ClientError::Shutdown),
            result = TcpStream::connect(addr) => result.map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?,
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        self.set_state(ClientState::Handshaking);
        let (read_half, write_half) = stream.into_split();
        let mut sink = FramedWrite::new(write_half, PacketCodec::new());
        sink.send(Packet::handshake(
            self.config.service_name.as_str(),
            self.config.auth_key.as_deref(),
        ))
        .await?;

        self.set_state(ClientState::Active);
        info!(
            "[{}] Tunnel established to {}",
            self.config.service_name, addr
        );

        let session = shutdown.child_token();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let writer = tokio::spawn(run_packet_writer(
            sink.into_inner(),
            outbound_rx,
            PacketCodec::new(),
            session.clone(),
            format!("client:{}", self.config.service_name),
        ));
        let keepalive = tokio::spawn(keepalive(
            outbound_tx.clone(),
            self.config.keepalive_interval,
            session.clone(),
        ));

        let result = self
            .read_loop(FrameReader::new(read_half), &outbound_tx, &session)
            .await;
        let result = match result {
            Err(ClientError::ConnectionClosed) if shutdown.is_cancelled() => {
                Err(ClientError::Shutdown)
            }
            other => other,
        };

        session.cancel();
        let _ = writer.await;
        let _ = keepalive.await;
        result
    }

    async fn read_loop(
        &self,
        mut reader: FrameReader<OwnedReadHalf>,
        outbound: &mpsc::Sender<Packet>,
        session: &CancellationToken,
    ) -> Result<(), ClientError> {
        loop {
            let packet = tokio::select! {
                _ = session.cancelled() => return Err(ClientError::ConnectionClosed),
                packet = reader.next_packet() => packet?,
            };

            match packet {
                Some(Packet::Request(request)) => {
                    debug!(
                        "[{}] Request {} {} {}",
                        self.config.service_name, request.id, request.method, request.url
                    );
                    tokio::spawn(handle_request(
                        self.handler.clone(),
                        request,
                        outbound.clone(),
                        session.clone(),
                        self.config.report_handler_errors,
                    ));
                }
                Some(Packet::Pong { time }) => {
                    debug!(
                        "[{}] Pong, round trip {}ms",
                        self.config.service_name,
                        now_millis().saturating_sub(time)
                    );
                }
                Some(Packet::Ping { time }) => {
                    let _ = outbound.try_send(Packet::Pong { time });
                }
                Some(other) => {
                    debug!(
                        "[{}] Ignoring unexpected {} packet",
                        self.config.service_name,
                        other.kind()
                    );
                }
                None => return Err(ClientError::ConnectionClosed),
            }
        }
    }
}

async fn keepalive(
    outbound: mpsc::Sender<Packet>,
    period: std::time::Duration,
    session: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            _ = interval.tick() => {
                if outbound.send(Packet::ping()).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn handle_request(
    handler: Arc<dyn RequestHandler>,
    request: TunnelRequest,
    outbound: mpsc::Sender<Packet>,
    session: CancellationToken,
    report_errors: bool,
) {
    let id = request.id;
    let name = request.name.clone();

    let result = tokio::select! {
        _ = session.cancelled() => return,
        result = handler.handle(request) => result,
    };

    let packet = match result {
        Ok(mut response) => {
            response.id = id;
            response.name = name;
            Packet::Response(response)
        }
        Err(e) => {
            error!("Handler failed for request {} to '{}': {}", id, name, e);
            if !report_errors {
                return;
            }
            Packet::Failure {
                id,
                name,
                message: e.to_string(),
            }
        }
    };

    tokio::select! {
        _ = session.cancelled() => {}
        sent = outbound.send(packet) => {
            if sent.is_err() {
                debug!("Session ended before reply to request {} was queued", id);
            }
        }
    }
}
