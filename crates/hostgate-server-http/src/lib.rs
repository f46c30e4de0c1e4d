//! HTTP front end of the gateway
//!
//! Turns inbound HTTP requests for `<service>.<host>` into tunnel requests
//! and tunnel responses back into HTTP.

pub mod convert;
pub mod router;
pub mod server;
pub mod status;

pub use convert::{request_from_http, response_to_http, SERVICE_HEADER};
pub use router::{HostRouter, Route};
pub use server::{HttpGateway, HttpGatewayConfig, HttpGatewayError};
