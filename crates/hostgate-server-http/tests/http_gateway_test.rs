//! End-to-end tests: HTTP client -> gateway -> tunnel client -> handler

use bytes::Bytes;
use hostgate_client::{handler_fn, ClientConfig, HandlerError, TunnelClient};
use hostgate_control::{Dispatcher, ServiceRegistry, TunnelHandler, TunnelServerConfig};
use hostgate_proto::{TunnelRequest, TunnelResponse};
use hostgate_server_http::{HttpGateway, HttpGatewayConfig, SERVICE_HEADER};
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const HOST: &str = "gw.test";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

struct Gateway {
    http_addr: SocketAddr,
    tunnel_addr: SocketAddr,
    registry: ServiceRegistry,
}

async fn start_gateway(response_timeout: Duration) -> Gateway {
    let registry = ServiceRegistry::new();

    let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel_listener.local_addr().unwrap();
    let handler = Arc::new(TunnelHandler::new(
        TunnelServerConfig::default(),
        registry.clone(),
    ));
    tokio::spawn(handler.serve(tunnel_listener));

    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http_listener.local_addr().unwrap();
    let gateway = HttpGateway::new(
        HttpGatewayConfig {
            bind_addr: http_addr,
            hosts: vec![HOST.to_string()],
            response_timeout,
        },
        Arc::new(Dispatcher::new(registry.clone())),
    );
    tokio::spawn(gateway.serve(http_listener));

    Gateway {
        http_addr,
        tunnel_addr,
        registry,
    }
}

async fn connect_service(
    gateway: &Gateway,
    name: &str,
    client: impl FnOnce(ClientConfig) -> TunnelClient,
) {
    let config = ClientConfig::builder()
        .service_name(name)
        .gateway_addr(gateway.tunnel_addr.to_string())
        .report_handler_errors(true)
        .build();
    let client = client(config);
    tokio::spawn(async move { client.run().await });

    timeout(Duration::from_secs(5), async {
        while gateway.registry.lookup(name).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("service did not register");
}

async fn send(
    addr: SocketAddr,
    host: &str,
    method: &str,
    path: &str,
    body: &str,
) -> (StatusCode, http::HeaderMap, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(conn);

    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("host", host)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();

    let response = timeout(Duration::from_secs(10), sender.send_request(request))
        .await
        .unwrap()
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

async fn orders(request: TunnelRequest) -> Result<TunnelResponse, HandlerError> {
    let body = format!(
        "{} {} host={} body={}",
        request.method,
        request.url,
        request.host,
        String::from_utf8_lossy(&request.body)
    );
    Ok(TunnelResponse::new(200)
        .with_header("Content-Type", "text/plain")
        .with_body(body))
}

#[tokio::test]
async fn test_request_is_routed_by_host() {
    init_tracing();
    let gateway = start_gateway(Duration::from_secs(5)).await;
    connect_service(&gateway, "orders", |config| {
        TunnelClient::new(config, handler_fn(orders))
    })
    .await;

    let host = format!("orders.{}", HOST);
    let (status, headers, body) =
        send(gateway.http_addr, &host, "POST", "/orders?limit=1", "widget").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[SERVICE_HEADER], "orders");
    assert_eq!(headers["content-type"], "text/plain");
    assert_eq!(
        body,
        format!("POST /orders?limit=1 host={} body=widget", host)
    );
}

#[tokio::test]
async fn test_unknown_service_is_bad_gateway() {
    init_tracing();
    let gateway = start_gateway(Duration::from_secs(5)).await;

    let (status, _, body) = send(
        gateway.http_addr,
        &format!("missing.{}", HOST),
        "GET",
        "/",
        "",
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains("missing"));
}

#[tokio::test]
async fn test_status_page_lists_connected_services() {
    init_tracing();
    let gateway = start_gateway(Duration::from_secs(5)).await;
    connect_service(&gateway, "orders", |config| {
        TunnelClient::new(config, handler_fn(orders))
    })
    .await;

    let (status, headers, body) = send(gateway.http_addr, HOST, "GET", "/", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "text/html; charset=utf-8");
    assert!(body.contains(&format!("http://orders.{}", HOST)));
}

#[tokio::test]
async fn test_slow_service_is_gateway_timeout() {
    init_tracing();
    let gateway = start_gateway(Duration::from_millis(200)).await;
    connect_service(&gateway, "slow", |config| {
        TunnelClient::new(
            config,
            handler_fn(|_request: TunnelRequest| async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok::<_, HandlerError>(TunnelResponse::new(200))
            }),
        )
    })
    .await;

    let host = format!("slow.{}", HOST);
    let (status, _, _) = send(gateway.http_addr, &host, "GET", "/", "").await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_handler_failure_is_bad_gateway() {
    init_tracing();
    let gateway = start_gateway(Duration::from_secs(5)).await;
    connect_service(&gateway, "broken", |config| {
        TunnelClient::new(
            config,
            handler_fn(|_request: TunnelRequest| async move {
                Err::<TunnelResponse, HandlerError>("no database".into())
            }),
        )
    })
    .await;

    let host = format!("broken.{}", HOST);
    let (status, _, body) = send(gateway.http_addr, &host, "GET", "/", "").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains("no database"));
}

#[tokio::test]
async fn test_mixed_case_service_is_reachable() {
    init_tracing();
    let gateway = start_gateway(Duration::from_secs(5)).await;
    connect_service(&gateway, "MyApp", |config| {
        TunnelClient::new(config, handler_fn(orders))
    })
    .await;

    let host = format!("MyApp.{}", HOST.to_uppercase());
    let (status, headers, body) = send(gateway.http_addr, &host, "GET", "/", "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[SERVICE_HEADER], "MyApp");
    assert_eq!(body, format!("GET / host={} body=", host));
}
