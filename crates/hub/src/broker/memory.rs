// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process broker for tests and single-node deployments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use super::{channel_matches, Broker, BrokerMessage};

struct SubEntry {
    pattern: String,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

/// Single-process [`Broker`]: fan-out over in-memory channels, registry in
/// a sorted map. Delivery order per channel matches publish order.
#[derive(Default)]
pub struct MemoryBroker {
    subs: RwLock<Vec<SubEntry>>,
    kv: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> anyhow::Result<()> {
        let mut subs = self.subs.write().await;
        subs.retain(|entry| {
            if !channel_matches(&entry.pattern, channel) {
                return true;
            }
            // A failed send means the receiver was dropped; prune it.
            entry
                .tx
                .send(BrokerMessage { channel: channel.to_owned(), payload: payload.clone() })
                .is_ok()
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<BrokerMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.write().await.push(SubEntry { pattern: pattern.to_owned(), tx });
        Ok(rx)
    }

    async fn kv_put(&self, key: &str, value: Bytes) -> anyhow::Result<()> {
        self.kv.write().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.kv.read().await.get(key).cloned())
    }

    async fn kv_delete(&self, key: &str) -> anyhow::Result<()> {
        self.kv.write().await.remove(key);
        Ok(())
    }

    async fn kv_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let kv = self.kv.read().await;
        Ok(kv
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
