#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use shadowlink_relay::{
    Relay, RelayConfig, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_LISTENER_TTL_SECS, DEFAULT_MAX_CIRCUITS,
    DEFAULT_MAX_PPS,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "shadowlink-relay")]
#[command(about = "Shadowlink relay node - blind rendezvous for peers without a direct path")]
struct Args {
    /// UDP listen address
    #[arg(long, default_value = "0.0.0.0:3478")]
    listen: SocketAddr,

    /// Maximum concurrent circuits
    #[arg(long, default_value_t = DEFAULT_MAX_CIRCUITS)]
    max_circuits: usize,

    /// Circuit idle timeout in seconds
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    idle_timeout: u64,

    /// Listener registration TTL in seconds
    #[arg(long, default_value_t = DEFAULT_LISTENER_TTL_SECS)]
    listener_ttl: u64,

    /// Per-IP packet rate limit (packets per second)
    #[arg(long, default_value_t = DEFAULT_MAX_PPS)]
    max_pps: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.clone())
        .init();

    info!("Starting shadowlink-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig {
        max_circuits: args.max_circuits,
        idle_timeout: Duration::from_secs(args.idle_timeout),
        listener_ttl: Duration::from_secs(args.listener_ttl),
        max_pps: args.max_pps,
    };

    let relay = Relay::bind(args.listen, config).await?;
    relay.run().await
}
