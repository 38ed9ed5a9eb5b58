//! Shadowlink CLI: identity management, SG links, terminal chat.
//!
//! The engine itself never touches disk; this binary is the
//! persistence collaborator, keeping the 64-byte identity file and
//! feeding tokens in and out of the node.

#![forbid(unsafe_code)]

use std::fs;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sgp_crypto::{ContactToken, Identity, RendezvousHint, ShadowId, IDENTITY_BYTES};
use shadowlink_core::{Node, NodeConfig, NodeEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "shadowlink")]
#[command(about = "Shadowlink peer-to-peer messenger tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new identity
    Keygen {
        /// Output file path
        #[arg(short, long, default_value = "shadowlink.key")]
        output: String,
    },

    /// Show the Shadow ID of an identity file
    ShowId {
        /// Identity file path
        #[arg(short, long)]
        key: String,
    },

    /// Print an SG link for an identity with explicit hints
    Link {
        /// Identity file path
        #[arg(short, long)]
        key: String,

        /// Direct address hints
        #[arg(long)]
        direct: Vec<SocketAddr>,

        /// Relay hint
        #[arg(long)]
        relay: Option<SocketAddr>,
    },

    /// Run a node, print its SG link, and chat with whoever connects
    Listen {
        /// Identity file path
        #[arg(short, long)]
        key: String,

        /// UDP listen address
        #[arg(long, default_value = "0.0.0.0:0")]
        listen: SocketAddr,

        /// Relay to keep a registration with
        #[arg(long)]
        relay: Option<SocketAddr>,
    },

    /// Connect to a peer's SG link and chat
    Connect {
        /// Identity file path
        #[arg(short, long)]
        key: String,

        /// The peer's SG link
        link: String,

        /// UDP listen address
        #[arg(long, default_value = "0.0.0.0:0")]
        listen: SocketAddr,
    },
}

fn load_identity(path: &str) -> Result<Identity> {
    let bytes = fs::read(path).with_context(|| format!("failed to read identity {path}"))?;
    let bytes: [u8; IDENTITY_BYTES] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("invalid identity file: expected {IDENTITY_BYTES} bytes"))?;
    Ok(Identity::from_bytes(&bytes))
}

fn save_identity(identity: &Identity, path: &str) -> Result<()> {
    fs::write(path, identity.to_bytes())?;

    // Restrict permissions on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }

    Ok(())
}

fn node_config(listen: SocketAddr, relay: Option<SocketAddr>) -> NodeConfig {
    NodeConfig {
        listen,
        relay,
        ..NodeConfig::default()
    }
}

/// Print events and ship stdin lines to the most recent peer.
async fn chat_loop(node: Node, mut current: Option<ShadowId>) -> Result<()> {
    let mut events = node.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(NodeEvent::Status { peer, status }) => {
                        println!("[{peer}] {status:?}");
                    }
                    Ok(NodeEvent::ContactResolved { peer, route }) => {
                        println!("[{peer}] resolved via {route}");
                        current = Some(peer);
                    }
                    Ok(NodeEvent::Message { peer, data, .. }) => {
                        println!("<{peer}> {}", String::from_utf8_lossy(&data));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event stream lagged, skipped {}", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let Some(peer) = &current else {
                            println!("(no peer connected yet)");
                            continue;
                        };
                        if let Err(e) = node.send(peer, line.into_bytes()).await {
                            println!("(send failed: {e})");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    node.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    shadowlink_core::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Keygen { output } => {
            let identity = Identity::generate()?;
            save_identity(&identity, &output)?;

            println!("Identity:  {}", output);
            println!("Shadow ID: {}", identity.shadow_id());
        }
        Command::ShowId { key } => {
            let identity = load_identity(&key)?;
            println!("{}", identity.shadow_id());
        }
        Command::Link { key, direct, relay } => {
            let identity = load_identity(&key)?;
            let mut hints: Vec<RendezvousHint> =
                direct.into_iter().map(RendezvousHint::Direct).collect();
            if let Some(relay) = relay {
                hints.push(RendezvousHint::Relay(relay));
            }
            println!("{}", ContactToken::encode(&identity, &hints));
        }
        Command::Listen { key, listen, relay } => {
            let identity = load_identity(&key)?;
            let node = Node::bind(identity, node_config(listen, relay)).await?;

            println!("Shadow ID: {}", node.shadow_id());
            println!("SG link:   {}", node.contact_link().await);
            println!("Waiting for contacts; type to chat once connected.");

            chat_loop(node, None).await?;
        }
        Command::Connect { key, link, listen } => {
            let identity = load_identity(&key)?;
            let node = Node::bind(identity, node_config(listen, None)).await?;

            println!("Connecting...");
            let peer = node.connect(&link).await?;
            println!("Connected to {peer}; type to chat.");

            chat_loop(node, Some(peer)).await?;
        }
    }

    Ok(())
}
