//! Client configuration

use std::time::Duration;

/// Settings for one tunnel client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name the gateway routes to this client under
    pub service_name: String,
    /// `host:port` of the gateway's tunnel listener
    pub gateway_addr: String,
    pub auth_key: Option<String>,
    /// Pause between a failed session and the next connect attempt
    pub reconnect_delay: Duration,
    pub keepalive_interval: Duration,
    /// Send a `Failure` packet when the handler errors instead of staying silent
    pub report_handler_errors: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            gateway_addr: format!("localhost:{}", hostgate_proto::DEFAULT_TUNNEL_PORT),
            auth_key: None,
            reconnect_delay: Duration::from_millis(100),
            keepalive_interval: Duration::from_secs(10),
            report_handler_errors: false,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for `ClientConfig`
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.config.service_name = name.into();
        self
    }

    pub fn gateway_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.gateway_addr = addr.into();
        self
    }

    pub fn auth_key(mut self, key: impl Into<String>) -> Self {
        self.config.auth_key = Some(key.into());
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    pub fn report_handler_errors(mut self, enabled: bool) -> Self {
        self.config.report_handler_errors = enabled;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
