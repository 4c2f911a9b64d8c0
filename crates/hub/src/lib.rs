// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wirehub: multi-tenant RPC message hub.
//!
//! Remote clients connect over WebSocket, identify with a workspace and
//! client id, and exchange binary envelope-prefixed frames addressed to
//! other clients. Nodes are stateless relays over a shared pub/sub broker,
//! so the hub scales out as a fleet.

pub mod auth;
pub mod broker;
pub mod bus;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod store;
pub mod transport;
pub mod workspace;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, MemoryBroker, NatsBroker};
use crate::config::HubConfig;
use crate::store::Store;
use crate::transport::build_router;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run the hub server until shutdown.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let broker: Arc<dyn Broker> = match config.nats_url {
        Some(ref url) => {
            Arc::new(NatsBroker::connect(url, config.nats_token.clone(), &config.nats_prefix).await?)
        }
        None => {
            tracing::info!("no broker configured; running single-node with in-process broker");
            Arc::new(MemoryBroker::new())
        }
    };

    let store = Store::new(config, broker, shutdown.clone())?;
    store.init().await?;

    let router = build_router(Arc::clone(&store));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        node_id = %store.node_id(),
        manager = %store.manager_id(),
        "wirehub listening"
    );
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}
