// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use mist_node::{Node, NodeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = mist_node::config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.p2p_port = port;
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }

    match &cli.command {
        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Some(Commands::RouteId {
            sender_id,
            receiver_id,
        }) => {
            println!("forward:  {}", mist_crypto::route_id(sender_id, receiver_id));
            println!("backward: {}", mist_crypto::route_id(receiver_id, sender_id));
            Ok(())
        }
        None => run_daemon(config).await,
    }
}

async fn run_daemon(config: NodeConfig) -> anyhow::Result<()> {
    let node = Node::start(config).await.context("starting daemon")?;
    tracing::info!(port = node.port(), "mist daemon running, ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    node.shutdown().await;
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
