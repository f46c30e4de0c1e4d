//! Public HTTP listener
//!
//! Routes each request by its host header, forwards it through the matching
//! tunnel and renders whatever comes back.

use crate::convert::{error_response, request_from_http, response_to_http};
use crate::router::{HostRouter, Route};
use crate::status::render_status_page;
use bytes::Bytes;
use hostgate_control::{ControlError, Dispatcher};
use http::header::{HeaderValue, CONTENT_TYPE, HOST};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum HttpGatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub bind_addr: SocketAddr,
    /// Base hosts; `<service>.<host>` routes to `<service>`
    pub hosts: Vec<String>,
    /// How long to wait for a tunnel to answer before replying 504
    pub response_timeout: Duration,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            hosts: vec!["localhost:8081".to_string()],
            response_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpGateway {
    config: HttpGatewayConfig,
    router: HostRouter,
    dispatcher: Arc<Dispatcher>,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let router = HostRouter::new(&config.hosts);
        Self {
            config,
            router,
            dispatcher,
        }
    }

    /// Bind the configured address and serve forever
    pub async fn start(self) -> Result<(), HttpGatewayError> {
        let local_addr = self.config.bind_addr;
        let listener = TcpListener::bind(local_addr).await.map_err(|e| {
            HttpGatewayError::BindError {
                address: local_addr.ip().to_string(),
                port: local_addr.port(),
                reason: e.to_string(),
            }
        })?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpGatewayError> {
        let bound_addr = listener.local_addr()?;
        info!(
            "HTTP gateway listening on {} for hosts {:?}",
            bound_addr,
            self.router.hosts()
        );

        let gateway = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let gateway = gateway.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |request| {
                            let gateway = gateway.clone();
                            async move {
                                Ok::<_, Infallible>(gateway.handle(request, peer_addr).await)
                            }
                        });

                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!("HTTP connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept HTTP connection: {}", e);
                }
            }
        }
    }

    async fn handle(
        &self,
        request: Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let host = request
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| request.uri().authority().map(|a| a.as_str()))
            .unwrap_or_default()
            .to_string();

        match self.router.route(&host) {
            Route::StatusPage => self.status_page(),
            Route::Service(service) => self.forward(&service, request, peer_addr).await,
        }
    }

    fn status_page(&self) -> Response<Full<Bytes>> {
        let html = render_status_page(
            &self.dispatcher.service_names(),
            self.router.primary_host(),
        );
        let mut response = Response::new(Full::new(Bytes::from(html)));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        response
    }

    async fn forward(
        &self,
        service: &str,
        request: Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let id = self.dispatcher.next_request_id();
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let tunnel_request = match request_from_http(id, service, peer_addr, request).await {
            Ok(tunnel_request) => tunnel_request,
            Err(e) => {
                warn!("Failed to read request body from {}: {}", peer_addr, e);
                return error_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        let pending = match self.dispatcher.send(tunnel_request).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Cannot route {} {} to '{}': {}", method, path, service, e);
                return error_response(StatusCode::BAD_GATEWAY, &e.to_string());
            }
        };

        match pending.wait_timeout(self.config.response_timeout).await {
            Ok(response) => {
                info!(
                    "{} {} -> {} via '{}'",
                    method, path, response.status_code, service
                );
                response_to_http(response)
            }
            Err(ControlError::Timeout(elapsed)) => {
                warn!(
                    "No response from '{}' for request {} within {:?}",
                    service, id, elapsed
                );
                error_response(StatusCode::GATEWAY_TIMEOUT, "Service did not respond in time")
            }
            Err(e) => {
                warn!("Request {} to '{}' failed: {}", id, service, e);
                error_response(StatusCode::BAD_GATEWAY, &e.to_string())
            }
        }
    }
}
