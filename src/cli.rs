// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Metadata-resistant P2P messenger daemon.
#[derive(Parser)]
#[command(name = "mist", version, about)]
pub struct Cli {
    /// Path to a YAML config file (overrides the default search paths).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the link listener port.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the data directory.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the effective configuration and exit.
    ShowConfig,
    /// Compute the forward and backward channel hashes for two identities.
    RouteId {
        sender_id: String,
        receiver_id: String,
    },
}
