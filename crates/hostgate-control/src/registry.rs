//! Service registry
//!
//! Maps a service name to the single live connection that serves it. A newer
//! handshake for the same name takes the slot over and closes the old
//! connection.

use crate::connection::ServiceConnection;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Name -> connection table shared by the tunnel listener and the HTTP front
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<DashMap<String, Arc<ServiceConnection>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connection` the owner of `name`
    ///
    /// Returns the previous owner, which has already been closed.
    pub fn register(
        &self,
        name: &str,
        connection: Arc<ServiceConnection>,
    ) -> Option<Arc<ServiceConnection>> {
        let previous = match self.services.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => Some(occupied.insert(connection.clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(connection.clone());
                None
            }
        };

        match &previous {
            Some(old) if old.id() != connection.id() => {
                info!(
                    "Service '{}' taken over by {} ({}), closing {} ({})",
                    name,
                    connection.id(),
                    connection.peer_addr(),
                    old.id(),
                    old.peer_addr()
                );
                old.close();
            }
            Some(_) => {}
            None => info!(
                "Service '{}' registered by {} ({})",
                name,
                connection.id(),
                connection.peer_addr()
            ),
        }

        previous
    }

    /// Current owner of `name`, if any
    pub fn lookup(&self, name: &str) -> Option<Arc<ServiceConnection>> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    /// Remove `name` only while `connection_id` still owns it
    ///
    /// A superseded connection closing late must not evict its successor.
    pub fn deregister(&self, name: &str, connection_id: &str) -> bool {
        let removed = self
            .services
            .remove_if(name, |_, current| current.id() == connection_id)
            .is_some();

        if removed {
            info!("Service '{}' deregistered ({})", name, connection_id);
        } else {
            debug!(
                "Service '{}' not owned by {}, leaving registry untouched",
                name, connection_id
            );
        }
        removed
    }

    /// Registered service names, sorted
    pub fn list_names(&self) -> BTreeSet<String> {
        self.services.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
