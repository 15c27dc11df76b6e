mod combat;
mod network;
mod reconciler;
mod registry;

use clap::Parser;
use log::info;
use network::{Server, ServerConfig};
use reconciler::GhostPolicy;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "64")]
    max_connections: usize,

    /// Ghost sweep period in seconds
    #[arg(long, default_value = "10")]
    sweep_period: u64,

    /// Transport silence treated as an abrupt disconnect, in seconds
    #[arg(long, default_value = "15")]
    transport_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let config = ServerConfig {
        max_connections: args.max_connections,
        sweep_period: Duration::from_secs(args.sweep_period),
        transport_timeout: Duration::from_secs(args.transport_timeout),
        ghost_policy: GhostPolicy::default(),
    };

    info!("Starting server on {}", addr);
    let mut server = Server::new(&addr, config).await?;
    server.run().await?;

    Ok(())
}
