//! minirpc server binary.
//!
//! Hosts the demo `Calc` service over the binary codec (TCP) and over the
//! HTTP-JSON bridge, with the debug page alongside.

use anyhow::Result;
use clap::Parser;
use minirpc_core::{RpcServer, ServerConfig};
use minirpc_server::{demo_registry, start_http_server};
use std::net::SocketAddr;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "minirpc-server")]
#[command(about = "RPC server with HTTP-JSON bridge and debug page")]
struct Args {
    /// Host to bind both listeners to
    #[arg(long, default_value = ServerConfig::DEFAULT_HOST)]
    host: String,

    /// HTTP port for the bridge and debug page (0 = auto-assign)
    #[arg(long, default_value = "0")]
    http_port: u16,

    /// TCP port for binary codec connections (0 = auto-assign)
    #[arg(long, default_value = "0")]
    rpc_port: u16,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting minirpc server");

    let registry = demo_registry()?;

    let rpc_addr: SocketAddr = format!("{}:{}", args.host, args.rpc_port).parse()?;
    let mut rpc_handle = RpcServer::start(registry.clone(), rpc_addr).await?;
    let http_addr = start_http_server(registry, &args.host, args.http_port).await?;

    // Ports on stdout so a supervising process can read them
    println!("HTTP_PORT={}", http_addr.port());
    println!("RPC_PORT={}", rpc_handle.port());

    info!(
        "Serving bridge on http://{}{} and codec connections on {}",
        http_addr,
        ServerConfig::RPC_PATH,
        rpc_handle.addr()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    rpc_handle.shutdown();

    Ok(())
}
