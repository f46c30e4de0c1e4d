//! In-process HTTP services
//!
//! Serves tunneled requests from an async function over `http` types, so an
//! existing HTTP service can be exposed without running a local listener.

use crate::handler::{HandlerError, RequestHandler};
use async_trait::async_trait;
use bytes::Bytes;
use hostgate_proto::{TunnelRequest, TunnelResponse};
use http::header::{HeaderName, HeaderValue, HOST};
use http::{Method, Request, Response};
use std::future::Future;
use tracing::warn;

/// Handler backed by an `http::Request` -> `http::Response` function
pub struct HttpHandler<F> {
    service: F,
}

/// Wrap an async HTTP service as a `RequestHandler`
///
/// ```ignore
/// let handler = http_handler_fn(|request: Request<Bytes>| async move {
///     Response::new(Bytes::from(format!("hello from {}", request.uri())))
/// });
/// ```
pub fn http_handler_fn<F, Fut>(service: F) -> HttpHandler<F>
where
    F: Fn(Request<Bytes>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<Bytes>> + Send,
{
    HttpHandler { service }
}

#[async_trait]
impl<F, Fut> RequestHandler for HttpHandler<F>
where
    F: Fn(Request<Bytes>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<Bytes>> + Send,
{
    async fn handle(&self, request: TunnelRequest) -> Result<TunnelResponse, HandlerError> {
        let http_request = to_http_request(&request)?;
        let http_response = (self.service)(http_request).await;
        Ok(from_http_response(http_response).answering(&request))
    }
}

/// Rebuild the HTTP request a tunnel request was made from
pub fn to_http_request(request: &TunnelRequest) -> Result<Request<Bytes>, HandlerError> {
    let method = Method::from_bytes(request.method.as_bytes())?;
    let uri = if request.url.is_empty() { "/" } else { request.url.as_str() };

    let mut http_request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Bytes::from(request.body.clone()))?;

    let headers = http_request.headers_mut();
    for field in &request.headers {
        let Ok(name) = HeaderName::from_bytes(field.key.as_bytes()) else {
            warn!("Skipping invalid header name {:?}", field.key);
            continue;
        };
        for value in &field.values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => warn!("Skipping invalid value for header {}", name),
            }
        }
    }
    if !headers.contains_key(HOST) && !request.host.is_empty() {
        if let Ok(host) = HeaderValue::from_str(&request.host) {
            headers.insert(HOST, host);
        }
    }

    Ok(http_request)
}

/// Collect an HTTP response into a tunnel response
///
/// `content_length` is the length of the collected body.
pub fn from_http_response(response: Response<Bytes>) -> TunnelResponse {
    let (parts, body) = response.into_parts();

    let mut tunnel_response = TunnelResponse::new(i32::from(parts.status.as_u16()));
    for name in parts.headers.keys() {
        for value in parts.headers.get_all(name) {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            tunnel_response = tunnel_response.with_header(name.as_str(), value);
        }
    }

    tunnel_response.with_body(body.to_vec())
}
