// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Node configuration: YAML file, environment overrides, safe defaults.
//!
//! Search order (later overrides earlier):
//! 1. built-in defaults
//! 2. `~/.config/mist/config.yaml`
//! 3. `./mist.yaml` (workspace-local)
//! 4. path given to [`load`] explicitly
//! 5. environment variables (`P2P_PORT`, `TACT_INTERVAL`, `PACKET_SIZE`,
//!    `ROUTE_TTL`, `MAX_MESSAGE_AGE`, `TTL_INITIAL`, `OUTBOX_DRAIN_LIMIT`,
//!    `MIST_DATA_DIR`)
//!
//! # Example full config
//! ```yaml
//! p2p_port: 9000
//! tact_interval: 1.5
//! packet_size: 4096
//! route_ttl: 1800
//! max_message_age: 300
//! ttl_initial: 20
//! outbox_drain_limit: 5
//! data_dir: "/var/lib/mist"
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

fn default_port() -> u16 {
    9000
}
fn default_tact_interval() -> f64 {
    1.5
}
fn default_packet_size() -> usize {
    4096
}
fn default_route_ttl() -> u64 {
    1800
}
fn default_max_message_age() -> u64 {
    300
}
fn default_ttl_initial() -> i64 {
    20
}
fn default_drain_limit() -> usize {
    5
}
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("mist"))
        .unwrap_or_else(|| PathBuf::from("mist-data"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// TCP port the link listener binds. `0` lets the OS pick one.
    #[serde(default = "default_port")]
    pub p2p_port: u16,

    /// Seconds between tact ticks — the cadence of every link.
    #[serde(default = "default_tact_interval")]
    pub tact_interval: f64,

    /// Exact size in bytes of every wire frame.
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,

    /// Seconds a routing row stays valid.
    #[serde(default = "default_route_ttl")]
    pub route_ttl: u64,

    /// Freshness window for end-to-end content, in seconds.
    #[serde(default = "default_max_message_age")]
    pub max_message_age: u64,

    /// Hop allowance given to new packets.
    #[serde(default = "default_ttl_initial")]
    pub ttl_initial: i64,

    /// Outbox rows drained per tick.
    #[serde(default = "default_drain_limit")]
    pub outbox_drain_limit: usize,

    /// Where the system store and per-user stores live.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            p2p_port: default_port(),
            tact_interval: default_tact_interval(),
            packet_size: default_packet_size(),
            route_ttl: default_route_ttl(),
            max_message_age: default_max_message_age(),
            ttl_initial: default_ttl_initial(),
            outbox_drain_limit: default_drain_limit(),
            data_dir: default_data_dir(),
        }
    }
}

impl NodeConfig {
    pub fn tact_interval(&self) -> Duration {
        Duration::from_secs_f64(self.tact_interval.max(0.1))
    }

    pub fn route_ttl(&self) -> Duration {
        Duration::from_secs(self.route_ttl)
    }

    pub fn max_message_age(&self) -> Duration {
        Duration::from_secs(self.max_message_age)
    }
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/mist/config.yaml"));
    }
    paths.push(PathBuf::from("mist.yaml"));
    paths
}

/// Load configuration layers and apply environment overrides.
pub fn load(extra: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let mut config = NodeConfig::default();

    let mut paths = config_search_paths();
    if let Some(p) = extra {
        paths.push(p.to_path_buf());
    }
    for path in &paths {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            config = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
        }
    }

    apply_env(&mut config);
    Ok(config)
}

fn apply_env(config: &mut NodeConfig) {
    env_parse("P2P_PORT", &mut config.p2p_port);
    env_parse("TACT_INTERVAL", &mut config.tact_interval);
    env_parse("PACKET_SIZE", &mut config.packet_size);
    env_parse("ROUTE_TTL", &mut config.route_ttl);
    env_parse("MAX_MESSAGE_AGE", &mut config.max_message_age);
    env_parse("TTL_INITIAL", &mut config.ttl_initial);
    env_parse("OUTBOX_DRAIN_LIMIT", &mut config.outbox_drain_limit);
    if let Ok(dir) = std::env::var("MIST_DATA_DIR") {
        config.data_dir = PathBuf::from(dir);
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!(var = name, value = %raw, "ignoring unparseable override"),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
