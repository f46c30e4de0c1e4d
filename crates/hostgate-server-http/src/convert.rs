//! Conversions between hyper messages and tunnel packets

use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING,
};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hostgate_proto::{TunnelRequest, TunnelResponse};
use hyper::body::Body;
use std::net::SocketAddr;
use tracing::debug;

/// Header naming the service that produced a tunneled response
pub const SERVICE_HEADER: &str = "x-hostgate-service";

/// Build the tunnel request for an inbound HTTP request, collecting its body
pub async fn request_from_http<B>(
    id: u64,
    service: &str,
    remote_addr: SocketAddr,
    request: Request<B>,
) -> Result<TunnelRequest, B::Error>
where
    B: Body,
{
    let (parts, body) = request.into_parts();

    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.host())
        .unwrap_or_default()
        .to_string();

    let mut tunnel_request = TunnelRequest::new(id, service, parts.method.as_str(), url);
    for name in parts.headers.keys() {
        for value in parts.headers.get_all(name) {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            tunnel_request = tunnel_request.with_header(name.as_str(), value);
        }
    }
    tunnel_request.host = host;
    tunnel_request.remote_addr = remote_addr.to_string();

    let declared_length = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(-1);

    tunnel_request.body = body.collect().await?.to_bytes().to_vec();
    tunnel_request.content_length = declared_length;

    Ok(tunnel_request)
}

/// Render a tunnel response as an HTTP response
///
/// Status codes outside 100..=599 become 502.
pub fn response_to_http(response: TunnelResponse) -> Response<Full<Bytes>> {
    let status = u16::try_from(response.status_code)
        .ok()
        .filter(|code| (100..=599).contains(code))
        .and_then(|code| StatusCode::from_u16(code).ok());

    let Some(status) = status else {
        debug!(
            "Request {} answered with invalid status {}",
            response.id, response.status_code
        );
        return error_response(
            StatusCode::BAD_GATEWAY,
            &format!("Service returned invalid status {}", response.status_code),
        );
    };

    let mut http_response = Response::new(Full::new(Bytes::from(response.body)));
    *http_response.status_mut() = status;

    let headers = http_response.headers_mut();
    for field in &response.headers {
        let Ok(name) = HeaderName::from_bytes(field.key.as_bytes()) else {
            continue;
        };
        // Framing is recomputed from the collected body
        if [TRANSFER_ENCODING, CONNECTION, CONTENT_LENGTH].contains(&name) {
            continue;
        }
        for value in &field.values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    if let Ok(service) = HeaderValue::from_str(&response.name) {
        headers.insert(SERVICE_HEADER, service);
    }

    http_response
}

/// Plain-text response for gateway-side failures
pub fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
