// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broker-federated event bus.
//!
//! Wraps two local buses: "local" receives only in-process emits, "remote"
//! receives everything arriving from the broker — including this node's own
//! publishes, which loop back through the `event:*` subscription. Payload
//! kinds survive federation via the channel grammar `event:<kind>:<name>`
//! with kinds `b:` (raw bytes), `s:` (UTF-8 text), and `d:` (JSON).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerMessage};
use crate::bus::local::{EventWatch, HandlerId, LocalEventBus, Payload};
use crate::error::HubError;

#[derive(Debug, Clone, PartialEq)]
enum ReadyState {
    Pending,
    Ready,
    Failed(String),
}

/// Bridges the local buses to the broker's pub/sub.
pub struct FederatedEventBus {
    local: Arc<LocalEventBus>,
    remote: Arc<LocalEventBus>,
    broker: Arc<dyn Broker>,
    ready: watch::Sender<ReadyState>,
    shutdown: CancellationToken,
}

impl FederatedEventBus {
    pub fn new(broker: Arc<dyn Broker>, shutdown: CancellationToken) -> Self {
        let (ready, _) = watch::channel(ReadyState::Pending);
        Self {
            local: Arc::new(LocalEventBus::new()),
            remote: Arc::new(LocalEventBus::new()),
            broker,
            ready,
            shutdown,
        }
    }

    /// Subscribe the broker pattern `event:*` and start the dispatch pump.
    ///
    /// Readiness resolves once the subscription is live; on failure it
    /// resolves with the error and every publisher blocked on readiness
    /// fails.
    pub async fn init(&self) -> anyhow::Result<()> {
        match self.broker.subscribe("event:*").await {
            Ok(rx) => {
                let remote = Arc::clone(&self.remote);
                let shutdown = self.shutdown.clone();
                tokio::spawn(pump(remote, rx, shutdown));
                self.ready.send_replace(ReadyState::Ready);
                Ok(())
            }
            Err(err) => {
                self.ready.send_replace(ReadyState::Failed(format!("{err:#}")));
                Err(err)
            }
        }
    }

    /// Block until the bus is ready; fail if initialization failed.
    pub async fn ready(&self) -> anyhow::Result<()> {
        let mut rx = self.ready.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                ReadyState::Ready => return Ok(()),
                ReadyState::Failed(err) => anyhow::bail!("event bus not ready: {err}"),
                ReadyState::Pending => {}
            }
            if rx.changed().await.is_err() {
                anyhow::bail!("event bus dropped");
            }
        }
    }

    /// Dispatch locally and publish to the broker for cross-node fan-out.
    pub async fn emit(&self, event: &str, payload: Payload) -> anyhow::Result<()> {
        self.ready().await?;
        self.local.emit(event, &payload);
        let (kind, bytes) = encode_payload(&payload)?;
        self.broker.publish(&format!("event:{kind}:{event}"), bytes).await
    }

    /// Dispatch on the local bus only.
    pub fn emit_local(&self, event: &str, payload: &Payload) {
        self.local.emit(event, payload);
    }

    /// Subscribe to events arriving from the broker.
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.remote.on(event, handler)
    }

    /// Subscribe to a broker event, auto-removing after first dispatch.
    pub fn once<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.remote.once(event, handler)
    }

    pub fn off(&self, event: &str, id: Option<HandlerId>) {
        self.remote.off(event, id);
    }

    /// Subscribe to in-process events only.
    pub fn on_local<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.local.on(event, handler)
    }

    pub fn off_local(&self, event: &str, id: Option<HandlerId>) {
        self.local.off(event, id);
    }

    /// Start watching both buses; live before this returns.
    pub fn watch(&self, event: &str) -> FederatedWatch<'_> {
        FederatedWatch { local: self.local.watch(event), remote: self.remote.watch(event) }
    }

    /// Race both buses for the first payload of `event`.
    pub async fn wait_for(&self, event: &str, timeout: Duration) -> Result<Payload, HubError> {
        self.watch(event).wait(None, timeout).await
    }

    /// Race both buses for the first payload of `event` passing `predicate`.
    pub async fn wait_for_match(
        &self,
        event: &str,
        predicate: &(dyn Fn(&Payload) -> bool + Sync),
        timeout: Duration,
    ) -> Result<Payload, HubError> {
        self.watch(event).wait(Some(predicate), timeout).await
    }

    /// Wait on the local bus only.
    pub async fn wait_for_local(
        &self,
        event: &str,
        timeout: Duration,
    ) -> Result<Payload, HubError> {
        self.local.wait_for(event, timeout).await
    }
}

/// Paired local/remote watches; the losing side of the race is dropped and
/// its subscription removed.
pub struct FederatedWatch<'a> {
    local: EventWatch<'a>,
    remote: EventWatch<'a>,
}

impl FederatedWatch<'_> {
    pub async fn wait(
        self,
        predicate: Option<&(dyn Fn(&Payload) -> bool + Sync)>,
        timeout: Duration,
    ) -> Result<Payload, HubError> {
        tokio::select! {
            result = self.local.wait(predicate, timeout) => result,
            result = self.remote.wait(predicate, timeout) => result,
        }
    }
}

fn encode_payload(payload: &Payload) -> anyhow::Result<(&'static str, Bytes)> {
    Ok(match payload {
        Payload::Bytes(b) => ("b", b.clone()),
        Payload::Text(s) => ("s", Bytes::from(s.clone().into_bytes())),
        Payload::Json(v) => ("d", Bytes::from(serde_json::to_vec(v)?)),
    })
}

/// Forward broker messages onto the remote bus, decoded by kind.
async fn pump(
    remote: Arc<LocalEventBus>,
    mut rx: mpsc::UnboundedReceiver<BrokerMessage>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                dispatch(&remote, &msg.channel, &msg.payload);
            }
        }
    }
    tracing::debug!("federated event pump stopped");
}

fn dispatch(remote: &LocalEventBus, channel: &str, payload: &Bytes) {
    let Some(rest) = channel.strip_prefix("event:") else {
        tracing::debug!(channel, "ignoring non-event broker channel");
        return;
    };
    if let Some(name) = rest.strip_prefix("b:") {
        remote.emit(name, &Payload::Bytes(payload.clone()));
    } else if let Some(name) = rest.strip_prefix("s:") {
        match std::str::from_utf8(payload) {
            Ok(text) => remote.emit(name, &Payload::Text(text.to_owned())),
            Err(err) => tracing::warn!(channel, err = %err, "invalid utf-8 string event"),
        }
    } else if let Some(name) = rest.strip_prefix("d:") {
        match serde_json::from_slice(payload) {
            Ok(value) => remote.emit(name, &Payload::Json(value)),
            Err(err) => tracing::warn!(channel, err = %err, "invalid json event"),
        }
    } else {
        tracing::info!(channel, "unknown event channel kind");
    }
}

#[cfg(test)]
#[path = "federated_tests.rs"]
mod tests;
