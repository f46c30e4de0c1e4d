//! HTTP proxy to the local backend
//!
//! Forwards each tunneled request to `base_url + request.url` over pooled
//! HTTP/1.1 connections and turns the upstream answer into a `TunnelResponse`.

use crate::handler::{HandlerError, RequestHandler};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{Method, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use hostgate_proto::{TunnelRequest, TunnelResponse};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Maximum number of idle connections kept to the backend
const MAX_POOL_SIZE: usize = 10;

/// Proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid target URL {0}: {1}")]
    InvalidTarget(String, String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Response error: {0}")]
    ResponseError(String),
}

/// Forwards tunneled requests to a local HTTP server
pub struct HttpProxy {
    /// Base URL without a trailing slash
    base_url: String,
    /// `host:port` to dial
    authority: String,
    /// Path prefix from the base URL, prepended to every request path
    path_prefix: String,
    pool: Arc<Mutex<Vec<http1::SendRequest<Full<Bytes>>>>>,
}

impl HttpProxy {
    /// Proxy to `base_url`, e.g. `http://localhost:3000`
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProxyError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let uri: Uri = base_url
            .parse()
            .map_err(|e: http::uri::InvalidUri| {
                ProxyError::InvalidTarget(base_url.clone(), e.to_string())
            })?;

        match uri.scheme_str() {
            Some("http") => {}
            other => {
                return Err(ProxyError::InvalidTarget(
                    base_url.clone(),
                    format!("unsupported scheme {:?}", other.unwrap_or("")),
                ))
            }
        }

        let host = uri
            .host()
            .ok_or_else(|| ProxyError::InvalidTarget(base_url.clone(), "missing host".into()))?;
        let authority = format!("{}:{}", host, uri.port_u16().unwrap_or(80));
        let path_prefix = uri.path().trim_end_matches('/').to_string();

        Ok(Self {
            base_url,
            authority,
            path_prefix,
            pool: Arc::new(Mutex::new(Vec::with_capacity(MAX_POOL_SIZE))),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_connection(&self) -> Result<http1::SendRequest<Full<Bytes>>, ProxyError> {
        {
            let mut pool = self.pool.lock().await;
            while let Some(sender) = pool.pop() {
                if sender.is_ready() {
                    debug!("Reusing pooled connection to {}", self.authority);
                    return Ok(sender);
                }
                debug!("Discarding stale connection from pool");
            }
        }

        debug!("Creating new connection to {}", self.authority);
        let stream = TcpStream::connect(&self.authority).await.map_err(|e| {
            ProxyError::ConnectionFailed(format!("Failed to connect to {}: {}", self.authority, e))
        })?;

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::ConnectionFailed(format!("HTTP handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Backend connection closed: {}", e);
            }
        });

        Ok(sender)
    }

    async fn return_connection(&self, sender: http1::SendRequest<Full<Bytes>>) {
        if !sender.is_ready() {
            return;
        }
        let mut pool = self.pool.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(sender);
        }
    }

    fn build_request(&self, request: &TunnelRequest) -> Result<Request<Full<Bytes>>, ProxyError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ProxyError::InvalidRequest(format!("{}: {}", request.method, e)))?;

        let path = if request.url.is_empty() { "/" } else { request.url.as_str() };
        let uri = format!("{}{}", self.path_prefix, path);

        let mut builder = Request::builder().method(method).uri(uri);
        for field in &request.headers {
            let Ok(name) = HeaderName::from_bytes(field.key.as_bytes()) else {
                warn!("Skipping invalid header name {:?}", field.key);
                continue;
            };
            if [HOST, CONNECTION, TRANSFER_ENCODING, CONTENT_LENGTH].contains(&name) {
                continue;
            }
            for value in &field.values {
                match HeaderValue::from_str(value) {
                    Ok(value) => builder = builder.header(name.clone(), value),
                    Err(_) => warn!("Skipping invalid value for header {}", name),
                }
            }
        }
        builder = builder.header(HOST, self.authority.as_str());

        builder
            .body(Full::new(Bytes::from(request.body.clone())))
            .map_err(|e| ProxyError::InvalidRequest(format!("Failed to build request: {}", e)))
    }

    async fn read_response(response: Response<Incoming>) -> Result<TunnelResponse, ProxyError> {
        let status = response.status().as_u16() as i32;
        let (parts, body) = response.into_parts();

        let mut tunnel_response = TunnelResponse::new(status);
        for name in parts.headers.keys() {
            for value in parts.headers.get_all(name) {
                let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                tunnel_response = tunnel_response.with_header(name.as_str(), value);
            }
        }

        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::ResponseError(format!("Failed to read response body: {}", e)))?
            .to_bytes();

        Ok(tunnel_response.with_body(body.to_vec()))
    }

    /// Forward one request to the backend
    pub async fn forward(&self, request: &TunnelRequest) -> Result<TunnelResponse, ProxyError> {
        let start_time = Instant::now();
        let http_request = self.build_request(request)?;

        let mut sender = self.get_connection().await?;
        let response = sender
            .send_request(http_request)
            .await
            .map_err(|e| ProxyError::RequestFailed(format!("Failed to send request: {}", e)))?;
        let response = Self::read_response(response).await?;
        self.return_connection(sender).await;

        info!(
            "{} {} -> {} ({}ms)",
            request.method,
            request.url,
            response.status_code,
            start_time.elapsed().as_millis()
        );
        Ok(response.answering(request))
    }
}

#[async_trait]
impl RequestHandler for HttpProxy {
    async fn handle(&self, request: TunnelRequest) -> Result<TunnelResponse, HandlerError> {
        Ok(self.forward(&request).await?)
    }
}
