//! Gateway side of the tunnel protocol
//!
//! Accepts tunnel connections, authenticates and names them, keeps the
//! service registry, and correlates responses with the requests that the
//! HTTP front end dispatches through `Dispatcher`.

pub mod connection;
pub mod dispatch;
pub mod handler;
pub mod pending_requests;
pub mod registry;

pub use connection::ServiceConnection;
pub use dispatch::Dispatcher;
pub use handler::{TunnelHandler, TunnelListener, TunnelServerConfig};
pub use pending_requests::{PendingRequests, PendingResponse, Reply};
pub use registry::ServiceRegistry;

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of the control plane
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Tunnel connection closed")]
    ConnectionClosed,

    #[error("Request {0} is already pending on this connection")]
    DuplicateRequestId(u64),

    #[error("Request {0} expired before a response arrived")]
    RequestExpired(u64),

    #[error("Handler failed for request {id}: {message}")]
    HandlerFailed { id: u64, message: String },

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Failed to bind tunnel listener on {address}: {reason}")]
    BindError { address: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
