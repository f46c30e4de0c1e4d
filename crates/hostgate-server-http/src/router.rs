//! HTTP host-based routing
//!
//! `orders.example.com` routes to service `orders` when `example.com` is one
//! of the configured base hosts. Anything else gets the status page.

use tracing::trace;

/// Where a request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Service(String),
    StatusPage,
}

#[derive(Debug, Clone)]
pub struct HostRouter {
    /// Base hosts, lowercased, possibly with a port
    hosts: Vec<String>,
}

impl HostRouter {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| h.as_ref().trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// First configured host, used to build links on the status page
    pub fn primary_host(&self) -> &str {
        self.hosts.first().map(String::as_str).unwrap_or("localhost")
    }

    /// Bases match case-insensitively; the service label keeps its case
    pub fn route(&self, host: &str) -> Route {
        let original = host.trim();
        let host = original.to_ascii_lowercase();
        let without_port = strip_port(&host);

        for base in &self.hosts {
            // A base without a port also matches a host header that carries one
            let candidate = if base.contains(':') {
                host.as_str()
            } else {
                without_port
            };

            if let Some(prefix) = candidate
                .strip_suffix(base.as_str())
                .and_then(|prefix| prefix.strip_suffix('.'))
            {
                // ASCII lowercasing keeps byte offsets
                let label = &original[..prefix.len()];
                if is_service_label(label) {
                    trace!("Host {} routes to service {}", host, label);
                    return Route::Service(label.to_string());
                }
            }
        }

        Route::StatusPage
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn is_service_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
