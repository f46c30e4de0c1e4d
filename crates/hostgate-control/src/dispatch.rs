//! Entry point for code that wants to send a request into a tunnel

use crate::pending_requests::PendingResponse;
use crate::registry::ServiceRegistry;
use crate::ControlError;
use hostgate_proto::TunnelRequest;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub struct Dispatcher {
    registry: ServiceRegistry,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            registry,
            next_id: AtomicU64::new(1),
        }
    }

    /// Fresh request id, starting at 1
    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send `request` to the service named in `request.name`
    ///
    /// Fails with `ServiceNotFound` without touching the network when no
    /// tunnel is registered under that name.
    pub async fn send(&self, request: TunnelRequest) -> Result<PendingResponse, ControlError> {
        let connection = self
            .registry
            .lookup(&request.name)
            .ok_or_else(|| ControlError::ServiceNotFound(request.name.clone()))?;

        debug!(
            "Dispatching request {} {} {} to {}",
            request.id,
            request.method,
            request.url,
            connection.id()
        );
        connection.submit_request(request).await
    }

    pub fn service_names(&self) -> BTreeSet<String> {
        self.registry.list_names()
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }
}
