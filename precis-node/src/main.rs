//! Precis node entry point.
//!
//! Starts one cluster peer: loads the shared configuration, wires the node
//! context, spawns the background loops and serves the HTTP surface until
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use precis_core::error::Error;
use precis_core::{Config, NodeContext, NodeId};
use precis_node::server;

/// Distributed project summarizer node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node id; must exist in the configured membership table
    #[arg(long)]
    node_id: NodeId,

    /// Path to the cluster configuration document
    #[arg(long, default_value = "precis.toml")]
    config: PathBuf,

    /// Override the configured bind IP for this node
    #[arg(long)]
    ip: Option<String>,

    /// Override the configured port for this node
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(args).await {
        error!(error = %e, "node exited with error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let mut config = Config::load(&args.config)?;
    let spec = config
        .nodes
        .iter_mut()
        .find(|n| n.id == args.node_id)
        .ok_or(Error::UnknownNode(args.node_id))?;
    if let Some(ip) = args.ip {
        spec.ip = ip;
    }
    if let Some(port) = args.port {
        spec.port = port;
    }

    let ctx = NodeContext::new(args.node_id, config)?;
    let addr = ctx.bind_address()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(node = args.node_id, %addr, "node listening");

    let handles = ctx.start();
    let app = server::router(Arc::clone(&ctx));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    ctx.stop(handles).await;
    info!("node shutdown complete");
    Ok(())
}
