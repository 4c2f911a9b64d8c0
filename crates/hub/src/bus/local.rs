// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process publish/subscribe with pattern keys and one-shot waits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::HubError;

/// Event payloads carried by the bus; the kind is preserved across
/// federation (`b:` / `s:` / `d:` broker channels).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// Identifies a registered handler for removal via [`LocalEventBus::off`].
pub type HandlerId = u64;

type Handler = Arc<dyn Fn(&Payload) -> anyhow::Result<()> + Send + Sync>;

struct Entry {
    id: HandlerId,
    once: bool,
    handler: Handler,
}

/// Whether an emitted event name matches a registered key.
///
/// A key ending in `*` matches any name starting with the key's prefix whose
/// remainder contains no `/` — wildcards only cover the trailing path
/// component. Any other key matches exactly, so a literal like `w/*:msg` is
/// a plain channel name, not a pattern.
fn key_matches(key: &str, event: &str) -> bool {
    match key.strip_suffix('*') {
        Some(prefix) => event.starts_with(prefix) && !event[prefix.len()..].contains('/'),
        None => key == event,
    }
}

/// In-process event bus. `emit` dispatches synchronously in registration
/// order; a handler returning `Err` is logged and does not stop the rest.
#[derive(Default)]
pub struct LocalEventBus {
    handlers: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Entry>>> {
        self.handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, event: &str, handler: Handler, once: bool) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(event.to_owned())
            .or_default()
            .push(Entry { id, once, handler });
        id
    }

    /// Subscribe `handler` to `event`; returns an id for [`Self::off`].
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event, Arc::new(handler), false)
    }

    /// Subscribe `handler` to `event`, auto-removing after first dispatch.
    pub fn once<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event, Arc::new(handler), true)
    }

    /// Remove one handler (by id) or all handlers for `event`.
    pub fn off(&self, event: &str, id: Option<HandlerId>) {
        let mut map = self.lock();
        match id {
            Some(id) => {
                if let Some(entries) = map.get_mut(event) {
                    entries.retain(|e| e.id != id);
                    if entries.is_empty() {
                        map.remove(event);
                    }
                }
            }
            None => {
                map.remove(event);
            }
        }
    }

    /// Dispatch `payload` to all handlers whose key matches `event`.
    pub fn emit(&self, event: &str, payload: &Payload) {
        let mut to_call: Vec<(HandlerId, Handler)> = Vec::new();
        {
            let mut map = self.lock();
            for (key, entries) in map.iter_mut() {
                if !key_matches(key, event) {
                    continue;
                }
                to_call.extend(entries.iter().map(|e| (e.id, Arc::clone(&e.handler))));
                entries.retain(|e| !e.once);
            }
            map.retain(|_, entries| !entries.is_empty());
        }
        // Registration order, across exact and wildcard keys alike.
        to_call.sort_by_key(|(id, _)| *id);
        for (_, handler) in to_call {
            if let Err(err) = handler(payload) {
                tracing::warn!(event, err = %err, "event handler failed");
            }
        }
    }

    /// Number of handlers currently registered for `event` (exact key).
    pub fn handler_count(&self, event: &str) -> usize {
        self.lock().get(event).map_or(0, Vec::len)
    }

    /// Start watching `event`. The subscription is live as soon as this
    /// returns and is removed when the watch is dropped.
    pub fn watch(&self, event: &str) -> EventWatch<'_> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on(event, move |payload| {
            let _ = tx.send(payload.clone());
            Ok(())
        });
        EventWatch { bus: self, event: event.to_owned(), id, rx }
    }

    /// Resolve with the first payload for `event`, or time out.
    pub async fn wait_for(&self, event: &str, timeout: Duration) -> Result<Payload, HubError> {
        self.watch(event).wait(None, timeout).await
    }

    /// Resolve with the first payload for `event` passing `predicate`, or
    /// time out.
    pub async fn wait_for_match(
        &self,
        event: &str,
        predicate: &(dyn Fn(&Payload) -> bool + Sync),
        timeout: Duration,
    ) -> Result<Payload, HubError> {
        self.watch(event).wait(Some(predicate), timeout).await
    }
}

/// A live one-shot subscription created by [`LocalEventBus::watch`].
pub struct EventWatch<'a> {
    bus: &'a LocalEventBus,
    event: String,
    id: HandlerId,
    rx: mpsc::UnboundedReceiver<Payload>,
}

impl EventWatch<'_> {
    /// Await the first matching payload. The subscription is removed on
    /// every exit path, including cancellation.
    pub async fn wait(
        mut self,
        predicate: Option<&(dyn Fn(&Payload) -> bool + Sync)>,
        timeout: Duration,
    ) -> Result<Payload, HubError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(payload)) => {
                    if predicate.is_none_or(|p| p(&payload)) {
                        return Ok(payload);
                    }
                }
                Ok(None) => {
                    return Err(HubError::internal(format!(
                        "event bus dropped while waiting for: {}",
                        self.event
                    )));
                }
                Err(_) => {
                    return Err(HubError::internal(format!(
                        "timed out waiting for event: {}",
                        self.event
                    )));
                }
            }
        }
    }
}

impl Drop for EventWatch<'_> {
    fn drop(&mut self) {
        self.bus.off(&self.event, Some(self.id));
    }
}

#[cfg(test)]
#[path = "local_tests.rs"]
mod tests;
