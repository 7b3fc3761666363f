// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The running daemon: system store, overlay engine, link listener and
//! tact engine under one executor.

use std::sync::Arc;

use tokio::{net::TcpListener, task::JoinHandle};
use tracing::info;

use mist_overlay::{run_listener, Links, OverlayConfig, OverlayEngine, TactEngine};
use mist_store::SystemStore;

use crate::{config::NodeConfig, error::NodeError};

pub struct Node {
    pub(crate) config: NodeConfig,
    pub(crate) system: Arc<SystemStore>,
    pub(crate) engine: Arc<OverlayEngine>,
    pub(crate) links: Links,
    port: u16,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Open stores, bind the listener and start the background tasks.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let system = Arc::new(SystemStore::open(&config.data_dir.join("system.db"))?);
        let links = Links::default();

        let engine = Arc::new(OverlayEngine::new(
            Arc::clone(&system),
            links.clone(),
            OverlayConfig {
                route_ttl: config.route_ttl(),
                max_message_age: config.max_message_age(),
                ttl_initial: config.ttl_initial,
            },
        ));

        let listener = TcpListener::bind(("0.0.0.0", config.p2p_port)).await?;
        let port = listener.local_addr()?.port();
        info!(port, "daemon listening for neighbor links");

        let acceptor = tokio::spawn(run_listener(listener, Arc::clone(&engine)));
        let tact = TactEngine::new(
            Arc::clone(&system),
            links.clone(),
            config.tact_interval(),
            config.packet_size,
            config.outbox_drain_limit,
        );
        let cadence = tokio::spawn(tact.run());

        Ok(Self {
            config,
            system,
            engine,
            links,
            port,
            tasks: vec![acceptor, cadence],
        })
    }

    /// The port the listener actually bound (useful with `p2p_port: 0`).
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Cancel background tasks and detach any logged-in user. Stores
    /// close when the last reference drops; nothing pending blocks this.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.engine.clear_active_user();
        info!("daemon stopped");
    }
}
