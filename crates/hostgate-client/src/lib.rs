//! Tunnel client library
//!
//! Connects a backend to the gateway under a service name and answers the
//! requests the gateway forwards, either in-process or through a local HTTP
//! server.

pub mod client;
pub mod config;
pub mod handler;
pub mod http_handler;
pub mod http_proxy;

pub use client::{ClientError, ClientState, TunnelClient};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use handler::{handler_fn, FnHandler, HandlerError, RequestHandler};
pub use http_handler::{http_handler_fn, HttpHandler};
pub use http_proxy::{HttpProxy, ProxyError};

pub use hostgate_proto::{HeaderField, TunnelRequest, TunnelResponse};
