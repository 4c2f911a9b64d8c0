// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pub/sub and registry abstraction over the external broker.
//!
//! The hub itself is stateless across nodes: the broker is the only
//! cross-node coordination primitive. `NatsBroker` is the production
//! implementation; `MemoryBroker` backs tests and single-node deployments.

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use memory::MemoryBroker;
pub use nats::NatsBroker;

/// A message delivered by a broker subscription.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Bytes,
}

/// Pub/sub channels plus a small key/value registry.
///
/// Channel patterns are either exact names or a prefix ending in `*`.
/// Dropping the receiver returned by [`Broker::subscribe`] cancels the
/// subscription.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: Bytes) -> anyhow::Result<()>;

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<BrokerMessage>>;

    async fn kv_put(&self, key: &str, value: Bytes) -> anyhow::Result<()>;

    async fn kv_get(&self, key: &str) -> anyhow::Result<Option<Bytes>>;

    async fn kv_delete(&self, key: &str) -> anyhow::Result<()>;

    /// List keys starting with `prefix`, in unspecified order.
    async fn kv_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

/// Whether a channel name matches a subscription pattern.
///
/// A trailing `*` matches any suffix; anything else is an exact match.
pub(crate) fn channel_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}
