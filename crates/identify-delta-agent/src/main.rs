//! # Identify Delta Agent
//!
//! Simulated host: reads commands from stdin, mutates the protocol registry
//! and peer set, and logs the delta pushes each peer would receive.

use anyhow::{Context, Result};
use identify_delta_agent::{AgentConfig, Command, Host};
use identify_delta_proto::{DeltaMessage, PUSH_PROTOCOL_ID};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting identify delta agent"
    );

    // Load configuration
    let config = AgentConfig::from_env()?;
    let (host, mut outbound) = Host::new(&config)?;

    tracing::info!(
        host_id = %host.host_id(),
        protocols = config.protocols.len(),
        peers = config.peers.len(),
        push_protocol = PUSH_PROTOCOL_ID,
        "Host initialized"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input_error = None;

    loop {
        tokio::select! {
            push = outbound.recv() => {
                let Some(push) = push else { break };
                match DeltaMessage::from_cbor(&push.payload) {
                    Ok(msg) => tracing::info!(
                        peer = %push.peer,
                        added = ?msg.added_protocols,
                        removed = ?msg.removed_protocols,
                        "Push"
                    ),
                    Err(err) => tracing::warn!(peer = %push.peer, error = %err, "Undecodable push"),
                }
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        tracing::info!("End of input");
                        break;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Failed to read input");
                        input_error = Some(err);
                        break;
                    }
                };

                match Command::parse(&line) {
                    Ok(Some(command)) => {
                        if let Err(err) = host.execute(command).await {
                            tracing::warn!(error = %err, "Command failed");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => tracing::warn!(error = %err, "Invalid command"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    host.close().await?;
    tracing::info!("Agent stopped");

    match input_error {
        Some(err) => Err(err).context("Failed to read commands from stdin"),
        None => Ok(()),
    }
}
