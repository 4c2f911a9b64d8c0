// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end hub scenarios.
//!
//! Boots a real axum server on a random port over an in-process broker and
//! drives it with `tokio-tungstenite`, exactly as a remote client would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use wirehub::broker::MemoryBroker;
use wirehub::codec;
use wirehub::config::HubConfig;
use wirehub::store::Store;
use wirehub::transport::build_router;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A running hub instance bound to a random local port.
pub struct TestHub {
    pub store: Arc<Store>,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TestHub {
    /// Start with test defaults: fast liveness probes, in-process broker.
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(HubConfig { ping_timeout_ms: 300, ..HubConfig::default() }).await
    }

    pub async fn start_with(config: HubConfig) -> anyhow::Result<Self> {
        let shutdown = CancellationToken::new();
        let store = Store::new(config, Arc::new(MemoryBroker::new()), shutdown.clone())?;
        store.init().await?;

        let router = build_router(Arc::clone(&store));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(serve_shutdown.cancelled_owned())
                .await;
        });

        Ok(Self { store, addr, shutdown })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Open a transport and complete the first-frame handshake; returns the
    /// socket and the parsed reply (success or error).
    pub async fn connect(
        &self,
        handshake: serde_json::Value,
    ) -> anyhow::Result<(WsClient, serde_json::Value)> {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.ws_url()).await?;
        ws.send(Message::Text(handshake.to_string().into())).await?;
        let reply = next_text(&mut ws, TIMEOUT).await?;
        Ok((ws, serde_json::from_str(&reply)?))
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn next_message(ws: &mut WsClient, timeout: Duration) -> anyhow::Result<Message> {
    tokio::time::timeout(timeout, ws.next())
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for a frame"))?
        .ok_or_else(|| anyhow::anyhow!("transport closed"))?
        .map_err(Into::into)
}

pub async fn next_text(ws: &mut WsClient, timeout: Duration) -> anyhow::Result<String> {
    match next_message(ws, timeout).await? {
        Message::Text(text) => Ok(text.to_string()),
        other => anyhow::bail!("expected text frame, got: {other:?}"),
    }
}

pub async fn next_binary(ws: &mut WsClient, timeout: Duration) -> anyhow::Result<Vec<u8>> {
    match next_message(ws, timeout).await? {
        Message::Binary(data) => Ok(data.to_vec()),
        other => anyhow::bail!("expected binary frame, got: {other:?}"),
    }
}

/// Expect a close frame and return its code.
pub async fn next_close_code(ws: &mut WsClient, timeout: Duration) -> anyhow::Result<u16> {
    match next_message(ws, timeout).await? {
        Message::Close(Some(frame)) => Ok(u16::from(frame.code)),
        other => anyhow::bail!("expected close frame, got: {other:?}"),
    }
}

/// Build an envelope frame: msgpack header entries followed by an opaque
/// tail.
pub fn envelope(entries: &[(&str, rmpv::Value)], tail: &[u8]) -> anyhow::Result<Vec<u8>> {
    let header: Vec<(rmpv::Value, rmpv::Value)> =
        entries.iter().map(|(k, v)| (rmpv::Value::from(*k), v.clone())).collect();
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &rmpv::Value::Map(header))?;
    out.extend_from_slice(tail);
    Ok(out)
}

/// Drive a client that answers every envelope-level `ping` with a `pong`,
/// the way a live RPC client does.
pub fn spawn_pong_responder(mut ws: WsClient) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Binary(data) = msg else { continue };
            let Ok((header, _)) = codec::read_header(&data) else { continue };
            if codec::header_str(&header, "type") != Some("ping") {
                continue;
            }
            let Some(from) = codec::header_str(&header, "from").map(str::to_owned) else {
                continue;
            };
            let Ok(pong) = envelope(
                &[("type", rmpv::Value::from("pong")), ("to", rmpv::Value::from(from.as_str()))],
                b"",
            ) else {
                continue;
            };
            if ws.send(Message::Binary(pong.into())).await.is_err() {
                break;
            }
        }
    })
}
