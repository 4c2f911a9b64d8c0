// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client transport adapter between a duplex byte stream and the
//! federated event bus.
//!
//! A `Connection` owns exactly one subscription pair — the direct channel
//! `{ws}/{cid}:msg` and the workspace broadcast `{ws}/*:msg` — and rewrites
//! the envelope of every outbound frame before publishing. It never buffers
//! frames; backpressure belongs to the broker and the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::bus::{FederatedEventBus, HandlerId, Payload};
use crate::codec;
use crate::error::HubError;
use crate::model::UserInfo;

type ConnectHandler = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
type DisconnectHandler = Box<dyn FnOnce(Option<String>) -> BoxFuture<'static, ()> + Send>;

/// One client's attachment to the routing fabric.
pub struct Connection {
    workspace: String,
    client_id: String,
    user: UserInfo,
    bus: Arc<FederatedEventBus>,
    closed: AtomicBool,
    subscriptions: Mutex<Vec<(String, HandlerId)>>,
    connect_handler: Mutex<Option<ConnectHandler>>,
    disconnect_handler: Mutex<Option<DisconnectHandler>>,
}

impl Connection {
    /// Bind a connection to `(workspace, client_id, user)`.
    ///
    /// The workspace must be non-empty and the client id free of `/`. The
    /// pseudo-workspace `*` is reserved for hub-internal connections that
    /// serve every workspace.
    pub fn new(
        bus: Arc<FederatedEventBus>,
        workspace: impl Into<String>,
        client_id: impl Into<String>,
        user: UserInfo,
    ) -> Result<Arc<Self>, HubError> {
        let workspace = workspace.into();
        let client_id = client_id.into();
        if workspace.is_empty() || client_id.contains('/') {
            return Err(HubError::invalid_argument(format!(
                "invalid workspace or client id: {workspace}/{client_id}"
            )));
        }
        Ok(Arc::new(Self {
            workspace,
            client_id,
            user,
            bus,
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            connect_handler: Mutex::new(None),
            disconnect_handler: Mutex::new(None),
        }))
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    /// Full `{workspace}/{client_id}` address.
    pub fn address(&self) -> String {
        format!("{}/{}", self.workspace, self.client_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a callback scheduled as a background task once the message
    /// handler is installed.
    pub fn on_connect<F>(&self, handler: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        *Self::lock(&self.connect_handler) = Some(Box::new(handler));
    }

    /// Register the callback invoked exactly once at disconnect.
    pub fn on_disconnected<F>(&self, handler: F)
    where
        F: FnOnce(Option<String>) -> BoxFuture<'static, ()> + Send + 'static,
    {
        *Self::lock(&self.disconnect_handler) = Some(Box::new(handler));
    }

    /// Install the inbound frame handler, subscribing the direct and
    /// broadcast channels. Installing a new handler replaces the previous
    /// subscription pair.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let direct = format!("{}/{}:msg", self.workspace, self.client_id);
        let broadcast = format!("{}/*:msg", self.workspace);

        let mut subscriptions = Self::lock(&self.subscriptions);
        for (event, id) in subscriptions.drain(..) {
            self.bus.off(&event, Some(id));
        }
        for event in [direct, broadcast] {
            let handler = Arc::clone(&handler);
            let id = self.bus.on(&event, move |payload: &Payload| {
                if let Some(bytes) = payload.as_bytes() {
                    handler(bytes.clone());
                }
                Ok(())
            });
            subscriptions.push((event, id));
        }
        drop(subscriptions);

        if let Some(connect) = Self::lock(&self.connect_handler).take() {
            tokio::spawn(connect());
        }
    }

    /// Rewrite the frame's envelope and publish it to the resolved target
    /// channel. Fails once the connection is closed; the tail bytes are
    /// forwarded untouched.
    pub async fn emit_message(&self, data: &[u8]) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::closed(format!(
                "Connection has already been closed (client: {})",
                self.address()
            )));
        }
        let rewritten =
            codec::rewrite_frame(data, &self.workspace, &self.client_id, &self.user)?;
        self.bus
            .emit(&rewritten.channel, Payload::Bytes(rewritten.frame))
            .await
            .map_err(|e| HubError::internal(format!("broker publish failed: {e:#}")))
    }

    /// Tear down the subscription pair and fire the disconnect callback.
    /// Idempotent; later calls are no-ops.
    pub async fn disconnect(&self, reason: Option<&str>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (event, id) in Self::lock(&self.subscriptions).drain(..) {
            self.bus.off(&event, Some(id));
        }
        tracing::info!(
            client = %self.address(),
            reason = reason.unwrap_or("none"),
            "connection disconnected"
        );
        let handler = Self::lock(&self.disconnect_handler).take();
        if let Some(handler) = handler {
            handler(reason.map(str::to_owned)).await;
        }
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
