//! hostgate CLI
//!
//! Runs either the gateway (`server`) or a tunnel client (`connect`) that
//! exposes a local HTTP server under a service name.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hostgate_client::{ClientConfig, HttpProxy, TunnelClient};
use hostgate_control::{
    Dispatcher, ServiceRegistry, TunnelHandler, TunnelListener, TunnelServerConfig,
};
use hostgate_server_http::{HttpGateway, HttpGatewayConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// hostgate - Reach services behind NAT through a public HTTP gateway
#[derive(Parser, Debug)]
#[command(name = "hostgate")]
#[command(about = "hostgate - Reach services behind NAT through a public HTTP gateway")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway: public HTTP listener plus tunnel listener
    #[command(long_about = r#"
Run the gateway. Requests for <service>.<host> on the HTTP port are sent
through the tunnel registered under <service>.

EXAMPLES:
  hostgate server --http 0.0.0.0:8081 --hosts localhost:8081 --tunnel 0.0.0.0:9090

ENVIRONMENT VARIABLES:
  HOSTGATE_HTTP_ADDR     HTTP listen address
  HOSTGATE_HOSTS         Comma-separated base hosts
  HOSTGATE_TUNNEL_ADDR   Tunnel listen address
  HOSTGATE_KEY           Shared key tunnel clients must present
    "#)]
    Server {
        /// HTTP listen address
        #[arg(
            long = "http",
            env = "HOSTGATE_HTTP_ADDR",
            default_value = "0.0.0.0:8081"
        )]
        http_addr: SocketAddr,

        /// Base hosts that services are reached under
        #[arg(
            long,
            env = "HOSTGATE_HOSTS",
            value_delimiter = ',',
            default_value = "localhost:8081"
        )]
        hosts: Vec<String>,

        /// Tunnel listen address
        #[arg(
            long = "tunnel",
            env = "HOSTGATE_TUNNEL_ADDR",
            default_value = "0.0.0.0:9090"
        )]
        tunnel_addr: SocketAddr,

        /// Shared key tunnel clients must present
        #[arg(long, env = "HOSTGATE_KEY")]
        key: Option<String>,

        /// Seconds to wait for a tunnel to answer before replying 504
        #[arg(long, env = "HOSTGATE_RESPONSE_TIMEOUT", default_value = "30")]
        response_timeout: u64,

        /// Close tunnels that stay silent this many seconds
        #[arg(long, env = "HOSTGATE_READ_TIMEOUT", default_value = "30")]
        read_timeout: u64,
    },

    /// Expose a local HTTP server through a gateway
    #[command(long_about = r#"
Connect to a gateway and serve requests for <name>.<host> from a local
HTTP server. Reconnects automatically if the connection drops.

EXAMPLES:
  hostgate connect --name orders --gateway gateway.example.com:9090 \
    --target http://localhost:3000

ENVIRONMENT VARIABLES:
  HOSTGATE_NAME      Service name to register
  HOSTGATE_GATEWAY   Gateway tunnel address
  HOSTGATE_TARGET    Base URL of the local HTTP server
  HOSTGATE_KEY       Shared key expected by the gateway
    "#)]
    Connect {
        /// Service name to register
        #[arg(long, env = "HOSTGATE_NAME")]
        name: String,

        /// Gateway tunnel address (host:port)
        #[arg(long, env = "HOSTGATE_GATEWAY", default_value = "localhost:9090")]
        gateway: String,

        /// Base URL of the local HTTP server
        #[arg(long, env = "HOSTGATE_TARGET", default_value = "http://localhost:3000")]
        target: String,

        /// Shared key expected by the gateway
        #[arg(long, env = "HOSTGATE_KEY")]
        key: Option<String>,

        /// Report handler failures to the gateway instead of letting requests time out
        #[arg(long)]
        report_errors: bool,
    },
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run_server(
    tunnel_config: TunnelServerConfig,
    http_config: HttpGatewayConfig,
) -> Result<()> {
    let registry = ServiceRegistry::new();

    let listener = TunnelListener::bind(tunnel_config.bind_addr)
        .await
        .context("Failed to start tunnel listener")?;
    let handler = Arc::new(TunnelHandler::new(tunnel_config, registry.clone()));
    let tunnel_task = tokio::spawn(listener.serve(handler));

    let gateway = HttpGateway::new(http_config, Arc::new(Dispatcher::new(registry)));
    let result = gateway.start().await.context("HTTP gateway failed");

    tunnel_task.abort();
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Server {
            http_addr,
            hosts,
            tunnel_addr,
            key,
            response_timeout,
            read_timeout,
        } => {
            info!("hostgate gateway starting...");
            info!("HTTP: {} (hosts: {})", http_addr, hosts.join(", "));
            info!("Tunnel: {}", tunnel_addr);
            if key.as_deref().is_some_and(|k| !k.is_empty()) {
                info!("Tunnel clients must present the shared key");
            }

            let tunnel_config = TunnelServerConfig {
                bind_addr: tunnel_addr,
                auth_key: key,
                read_timeout: Duration::from_secs(read_timeout),
                ..Default::default()
            };
            let http_config = HttpGatewayConfig {
                bind_addr: http_addr,
                hosts,
                response_timeout: Duration::from_secs(response_timeout),
            };

            tokio::select! {
                result = run_server(tunnel_config, http_config) => {
                    if let Err(e) = &result {
                        error!("Gateway stopped: {:#}", e);
                    }
                    result?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                }
            }
        }

        Commands::Connect {
            name,
            gateway,
            target,
            key,
            report_errors,
        } => {
            info!("hostgate client starting...");
            info!("Service: {}", name);
            info!("Gateway: {}", gateway);
            info!("Target: {}", target);

            let proxy = HttpProxy::new(target.as_str())
                .with_context(|| format!("Invalid target URL {}", target))?;

            let mut builder = ClientConfig::builder()
                .service_name(name)
                .gateway_addr(gateway)
                .report_handler_errors(report_errors);
            if let Some(key) = key {
                builder = builder.auth_key(key);
            }
            let client = TunnelClient::new(builder.build(), proxy);

            let shutdown = CancellationToken::new();
            let client_task = {
                let shutdown = shutdown.clone();
                async move { client.run_until(shutdown).await }
            };
            tokio::pin!(client_task);

            tokio::select! {
                _ = &mut client_task => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    shutdown.cancel();
                    client_task.await;
                }
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}
