//! Live tunnel connection as seen by the gateway

use crate::pending_requests::{PendingRequests, PendingResponse};
use crate::ControlError;
use hostgate_proto::{Packet, TunnelRequest};
use std::sync::OnceLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One accepted tunnel
///
/// The name is empty until the handshake succeeds and never changes after.
/// Outbound packets go through a queue drained by the connection's writer task.
pub struct ServiceConnection {
    id: String,
    peer_addr: String,
    name: OnceLock<String>,
    pending: PendingRequests,
    outbound: mpsc::Sender<Packet>,
    shutdown: CancellationToken,
}

impl ServiceConnection {
    pub fn new(peer_addr: impl Into<String>, outbound: mpsc::Sender<Packet>) -> Self {
        Self {
            id: format!("conn-{}", uuid::Uuid::new_v4()),
            peer_addr: peer_addr.into(),
            name: OnceLock::new(),
            pending: PendingRequests::new(),
            outbound,
            shutdown: CancellationToken::new(),
        }
    }

    /// Unique id, stable for the lifetime of the connection
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Service name, once the handshake has been accepted
    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    pub fn is_named(&self) -> bool {
        self.name.get().is_some()
    }

    /// Adopt `name`; returns false if the connection was already named
    pub(crate) fn set_name(&self, name: String) -> bool {
        self.name.set(name).is_ok()
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Register a reply slot for `request.id` and queue the request
    ///
    /// There is no built-in deadline: use `PendingResponse::wait_timeout`.
    pub async fn submit_request(
        &self,
        request: TunnelRequest,
    ) -> Result<PendingResponse, ControlError> {
        let id = request.id;
        let pending = self.pending.register(id)?;

        // Teardown cancels before draining the table, so a slot registered
        // before this check is either drained or rejected here. Dropping
        // `pending` on any error path releases the slot.
        if self.is_closed() {
            return Err(ControlError::ConnectionClosed);
        }

        tokio::select! {
            sent = self.outbound.send(Packet::Request(request)) => {
                sent.map_err(|_| ControlError::ConnectionClosed)?;
            }
            _ = self.shutdown.cancelled() => return Err(ControlError::ConnectionClosed),
        }

        if self.is_closed() {
            return Err(ControlError::ConnectionClosed);
        }

        debug!("[{}] Sent request {} to {:?}", self.id, id, self.name());
        Ok(pending)
    }

    /// Queue a packet without waiting for queue space
    pub fn try_send(&self, packet: Packet) -> Result<(), ControlError> {
        self.outbound.try_send(packet).map_err(|e| match e {
            TrySendError::Full(packet) => ControlError::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!("outbound queue full, dropped {} packet", packet.kind()),
            )),
            TrySendError::Closed(_) => ControlError::ConnectionClosed,
        })
    }

    /// Signal the connection's tasks to stop. Does not wait for them.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once `close` has been called or the connection failed
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl std::fmt::Debug for ServiceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}
