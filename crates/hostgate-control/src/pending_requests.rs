//! Pending requests tracker
//!
//! One table per tunnel connection. Maps a request id to the one-shot slot its
//! response is delivered on. Ids only need to be unique per connection.

use crate::ControlError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hostgate_proto::TunnelResponse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What a waiter eventually receives
pub type Reply = Result<TunnelResponse, ControlError>;

struct PendingEntry {
    tx: oneshot::Sender<Reply>,
    registered_at: Instant,
    /// Distinguishes registrations that reuse the same request id
    slot: u64,
}

/// Tracks requests written to a tunnel that are awaiting responses
#[derive(Clone, Default)]
pub struct PendingRequests {
    /// Maps request id -> oneshot sender for the reply
    requests: Arc<DashMap<u64, PendingEntry>>,
    next_slot: Arc<AtomicU64>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending request
    ///
    /// Fails if `id` is already outstanding; the existing waiter keeps its slot.
    pub fn register(&self, id: u64) -> Result<PendingResponse, ControlError> {
        match self.requests.entry(id) {
            Entry::Occupied(_) => Err(ControlError::DuplicateRequestId(id)),
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
                vacant.insert(PendingEntry {
                    tx,
                    registered_at: Instant::now(),
                    slot,
                });
                debug!("Registered pending request {}", id);
                Ok(PendingResponse {
                    id,
                    slot,
                    rx,
                    pending: self.clone(),
                    finished: false,
                })
            }
        }
    }

    /// Deliver a response to the waiter registered under `response.id`
    ///
    /// Returns true if the response was delivered, false if the request
    /// wasn't found or its waiter already went away.
    pub fn respond(&self, response: TunnelResponse) -> bool {
        let id = response.id;
        self.deliver(id, Ok(response))
    }

    /// Deliver a remote handler failure to the waiter for `id`
    pub fn fail(&self, id: u64, message: String) -> bool {
        self.deliver(id, Err(ControlError::HandlerFailed { id, message }))
    }

    fn deliver(&self, id: u64, reply: Reply) -> bool {
        let Some((_, entry)) = self.requests.remove(&id) else {
            warn!("No pending request found for id {}", id);
            return false;
        };

        debug!("Routing reply for request {}", id);
        if entry.tx.send(reply).is_err() {
            warn!("Failed to deliver reply for request {} - receiver dropped", id);
            return false;
        }
        true
    }

    /// Cancel a pending request (e.g., on timeout or error)
    pub fn cancel(&self, id: u64) {
        if self.requests.remove(&id).is_some() {
            debug!("Cancelled pending request {}", id);
        }
    }

    /// Remove `id` only if it is still the registration `slot`
    fn cancel_slot(&self, id: u64, slot: u64) {
        if self
            .requests
            .remove_if(&id, |_, entry| entry.slot == slot)
            .is_some()
        {
            debug!("Cancelled pending request {}", id);
        }
    }

    /// Expire every request registered at least `ttl` ago
    ///
    /// Waiters receive `RequestExpired`. Returns how many were expired.
    pub fn expire_older_than(&self, ttl: Duration) -> usize {
        let stale: Vec<u64> = self
            .requests
            .iter()
            .filter(|entry| entry.registered_at.elapsed() >= ttl)
            .map(|entry| *entry.key())
            .collect();

        let mut expired = 0;
        for id in stale {
            if let Some((_, entry)) = self
                .requests
                .remove_if(&id, |_, entry| entry.registered_at.elapsed() >= ttl)
            {
                let _ = entry.tx.send(Err(ControlError::RequestExpired(id)));
                expired += 1;
            }
        }
        expired
    }

    /// Fail every outstanding request with `ConnectionClosed`
    pub fn close_all(&self) -> usize {
        let ids: Vec<u64> = self.requests.iter().map(|entry| *entry.key()).collect();

        let mut closed = 0;
        for id in ids {
            if let Some((_, entry)) = self.requests.remove(&id) {
                let _ = entry.tx.send(Err(ControlError::ConnectionClosed));
                closed += 1;
            }
        }
        closed
    }

    /// Get count of pending requests
    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

/// Handle for one outstanding request
///
/// Dropping it before a reply arrives removes the request from its table.
pub struct PendingResponse {
    id: u64,
    slot: u64,
    rx: oneshot::Receiver<Reply>,
    pending: PendingRequests,
    finished: bool,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the reply with no deadline
    pub async fn wait(mut self) -> Result<TunnelResponse, ControlError> {
        let reply = (&mut self.rx).await;
        self.finished = true;
        reply.unwrap_or(Err(ControlError::ConnectionClosed))
    }

    /// Wait for the reply for at most `timeout`
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<TunnelResponse, ControlError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(reply) => {
                self.finished = true;
                reply.unwrap_or(Err(ControlError::ConnectionClosed))
            }
            Err(_) => Err(ControlError::Timeout(timeout)),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.finished {
            self.pending.cancel_slot(self.id, self.slot);
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}
