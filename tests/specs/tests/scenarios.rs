// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end handshake and routing scenarios against a live hub.

use futures_util::SinkExt;
use rmpv::Value;
use tokio_tungstenite::tungstenite::Message;

use hub_specs::{
    envelope, next_binary, next_close_code, next_text, spawn_pong_responder, TestHub, TIMEOUT,
};
use wirehub::codec;
use wirehub::model::UserInfo;

fn user(id: &str) -> UserInfo {
    UserInfo {
        id: id.to_owned(),
        roles: Vec::new(),
        is_anonymous: false,
        email: None,
        parent: None,
        scopes: None,
        expires_at: None,
    }
}

// -- S1: anonymous self-workspace ---------------------------------------------

#[tokio::test]
async fn anonymous_connect_lands_in_own_workspace() -> anyhow::Result<()> {
    let hub = TestHub::start().await?;

    let (_ws, reply) = hub.connect(serde_json::json!({ "client_id": "c1" })).await?;

    assert_eq!(reply["success"], true);
    assert_eq!(reply["client_id"], "c1");
    let workspace = reply["workspace"].as_str().unwrap_or_default().to_owned();
    assert!(!workspace.is_empty());
    assert_eq!(reply["user"]["id"], workspace.as_str());
    assert_eq!(reply["user"]["is_anonymous"], true);
    assert!(reply["reconnection_token"].as_str().is_some_and(|t| !t.is_empty()));
    assert!(reply["manager_id"]
        .as_str()
        .is_some_and(|m| m.starts_with("workspace-manager-")));
    Ok(())
}

// -- S2: permission denied ----------------------------------------------------

#[tokio::test]
async fn foreign_workspace_without_token_is_denied() -> anyhow::Result<()> {
    let hub = TestHub::start().await?;

    let (mut ws, reply) =
        hub.connect(serde_json::json!({ "client_id": "c1", "workspace": "test" })).await?;

    assert_eq!(reply["success"], false);
    assert_eq!(reply["error"], "Permission denied for workspace: test");
    assert_eq!(next_close_code(&mut ws, TIMEOUT).await?, 1011);
    Ok(())
}

// -- Handshake edges ----------------------------------------------------------

#[tokio::test]
async fn legacy_query_handshake_is_rejected_with_1008() -> anyhow::Result<()> {
    let hub = TestHub::start().await?;

    let url = format!("{}?workspace=w&client_id=c1", hub.ws_url());
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;

    let error = next_text(&mut ws, TIMEOUT).await?;
    let error: serde_json::Value = serde_json::from_str(&error)?;
    assert_eq!(error["success"], false);
    assert_eq!(next_close_code(&mut ws, TIMEOUT).await?, 1008);
    Ok(())
}

#[tokio::test]
async fn malformed_handshake_closes_with_1003() -> anyhow::Result<()> {
    let hub = TestHub::start().await?;

    let (mut ws, _) = tokio_tungstenite::connect_async(hub.ws_url()).await?;
    ws.send(Message::Text("this is not json".into())).await?;

    let error = next_text(&mut ws, TIMEOUT).await?;
    let error: serde_json::Value = serde_json::from_str(&error)?;
    assert_eq!(error["error"], "Failed to decode authentication information");
    assert_eq!(error["success"], false);
    assert_eq!(next_close_code(&mut ws, TIMEOUT).await?, 1003);
    Ok(())
}

#[tokio::test]
async fn missing_client_id_closes_with_1003() -> anyhow::Result<()> {
    let hub = TestHub::start().await?;

    let (mut ws, reply) = hub.connect(serde_json::json!({})).await?;
    assert_eq!(reply["error"], "Missing query parameters: client_id");
    assert_eq!(next_close_code(&mut ws, TIMEOUT).await?, 1003);
    Ok(())
}

// -- S3: duplicate detection --------------------------------------------------

#[tokio::test]
async fn stale_duplicate_client_is_evicted() -> anyhow::Result<()> {
    let hub = TestHub::start().await?;
    let token = hub.store.auth().generate_token(&user("u1"), Some(3600))?;

    // A holds (u1, k) but never answers probes.
    let (_ws_a, reply_a) =
        hub.connect(serde_json::json!({ "token": token, "client_id": "k" })).await?;
    assert_eq!(reply_a["success"], true);
    assert_eq!(reply_a["workspace"], "u1");

    // B claims the same identity; the probe times out and A is evicted.
    let (_ws_b, reply_b) =
        hub.connect(serde_json::json!({ "token": token, "client_id": "k" })).await?;
    assert_eq!(reply_b["success"], true);
    assert_eq!(reply_b["workspace"], "u1");
    Ok(())
}

#[tokio::test]
async fn live_duplicate_client_is_refused() -> anyhow::Result<()> {
    let hub = TestHub::start().await?;
    let token = hub.store.auth().generate_token(&user("u1"), Some(3600))?;

    let (ws_a, reply_a) =
        hub.connect(serde_json::json!({ "token": token, "client_id": "k" })).await?;
    assert_eq!(reply_a["success"], true);
    let _responder = spawn_pong_responder(ws_a);

    let (mut ws_b, reply_b) =
        hub.connect(serde_json::json!({ "token": token, "client_id": "k" })).await?;
    assert_eq!(reply_b["success"], false);
    assert_eq!(reply_b["error"], "Client already exists and is active: u1/k");
    assert_eq!(next_close_code(&mut ws_b, TIMEOUT).await?, 1013);
    Ok(())
}

// -- S4: directed frame rewrite -----------------------------------------------

#[tokio::test]
async fn directed_frames_are_rewritten_and_tails_preserved() -> anyhow::Result<()> {
    let hub = TestHub::start().await?;
    let token = hub.store.auth().generate_token(&user("u2"), Some(3600))?;

    let (mut ws_b, _) =
        hub.connect(serde_json::json!({ "token": token, "client_id": "b" })).await?;
    let (mut ws_a, _) =
        hub.connect(serde_json::json!({ "token": token, "client_id": "a" })).await?;

    let frame = envelope(&[("to", Value::from("b"))], &[0xff, 0xaa])?;
    ws_a.send(Message::Binary(frame.into())).await?;

    let delivered = next_binary(&mut ws_b, TIMEOUT).await?;
    let (header, offset) = codec::read_header(&delivered)?;
    assert_eq!(codec::header_str(&header, "to"), Some("u2/b"));
    assert_eq!(codec::header_str(&header, "from"), Some("u2/a"));
    assert_eq!(codec::header_str(&header, "ws"), Some("u2"));
    let snapshot: UserInfo = header
        .iter()
        .find(|(k, _)| k.as_str() == Some("user"))
        .map(|(_, v)| rmpv::ext::from_value(v.clone()))
        .ok_or_else(|| anyhow::anyhow!("user entry missing"))??;
    assert_eq!(snapshot.id, "u2");
    assert_eq!(&delivered[offset..], &[0xff, 0xaa]);
    Ok(())
}

// -- S5: manager broadcast and invalid targets --------------------------------

#[tokio::test]
async fn manager_broadcast_is_delivered_and_bare_target_rejected() -> anyhow::Result<()> {
    let hub = TestHub::start().await?;

    let (mut ws, reply) = hub.connect(serde_json::json!({ "client_id": "a" })).await?;
    let manager_id = reply["manager_id"].as_str().unwrap_or_default().to_owned();
    let workspace = reply["workspace"].as_str().unwrap_or_default().to_owned();

    // Fully qualified broadcast: ping the manager, get a pong back. Our own
    // broadcast echo arrives on the same socket, so skip until the pong.
    let ping = envelope(
        &[("type", Value::from("ping")), ("to", Value::from(format!("*/{manager_id}")))],
        b"",
    )?;
    ws.send(Message::Binary(ping.into())).await?;

    let mut pong_to = None;
    for _ in 0..4 {
        let data = next_binary(&mut ws, TIMEOUT).await?;
        let (header, _) = codec::read_header(&data)?;
        if codec::header_str(&header, "type") == Some("pong") {
            pong_to = codec::header_str(&header, "to").map(str::to_owned);
            break;
        }
    }
    assert_eq!(pong_to.as_deref(), Some(format!("{workspace}/a").as_str()));

    // A bare manager target is refused per-frame; the transport stays up.
    let bad = envelope(&[("to", Value::from(manager_id.as_str()))], b"")?;
    ws.send(Message::Binary(bad.into())).await?;
    let error = next_text(&mut ws, TIMEOUT).await?;
    let error: serde_json::Value = serde_json::from_str(&error)?;
    assert_eq!(error["success"], false);
    assert!(error["error"]
        .as_str()
        .is_some_and(|msg| msg.contains("Invalid target ID")));

    // Still connected: the same broadcast ping works again.
    let ping = envelope(
        &[("type", Value::from("ping")), ("to", Value::from(format!("*/{manager_id}")))],
        b"",
    )?;
    ws.send(Message::Binary(ping.into())).await?;
    let mut saw_pong = false;
    for _ in 0..4 {
        let data = next_binary(&mut ws, TIMEOUT).await?;
        let (header, _) = codec::read_header(&data)?;
        if codec::header_str(&header, "type") == Some("pong") {
            saw_pong = true;
            break;
        }
    }
    assert!(saw_pong);
    Ok(())
}

// -- S6: reconnection ---------------------------------------------------------

#[tokio::test]
async fn reconnection_token_restores_the_session() -> anyhow::Result<()> {
    let hub = TestHub::start().await?;

    let (ws, reply) = hub.connect(serde_json::json!({ "client_id": "c6" })).await?;
    assert_eq!(reply["success"], true);
    let workspace = reply["workspace"].as_str().unwrap_or_default().to_owned();
    let user_id = reply["user"]["id"].as_str().unwrap_or_default().to_owned();
    let token = reply["reconnection_token"].as_str().unwrap_or_default().to_owned();
    assert!(!token.is_empty());

    // Transport drops without a close frame; the hub cleans the slot up.
    drop(ws);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Re-entry needs only the reconnection token.
    let (_ws2, reply2) = hub
        .connect(serde_json::json!({ "reconnection_token": token, "client_id": "c6" }))
        .await?;
    assert_eq!(reply2["success"], true);
    assert_eq!(reply2["workspace"], workspace.as_str());
    assert_eq!(reply2["user"]["id"], user_id.as_str());
    assert!(reply2["reconnection_token"].as_str().is_some_and(|t| !t.is_empty()));
    Ok(())
}

#[tokio::test]
async fn reconnection_token_pins_workspace_and_client() -> anyhow::Result<()> {
    let hub = TestHub::start().await?;

    let (_ws, reply) = hub.connect(serde_json::json!({ "client_id": "c7" })).await?;
    let token = reply["reconnection_token"].as_str().unwrap_or_default().to_owned();

    let (mut ws_bad_ws, reply_bad_ws) = hub
        .connect(serde_json::json!({
            "reconnection_token": token,
            "client_id": "c7",
            "workspace": "other",
        }))
        .await?;
    assert_eq!(reply_bad_ws["error"], "Workspace mismatch, disconnecting");
    assert_eq!(next_close_code(&mut ws_bad_ws, TIMEOUT).await?, 1011);

    let (_ws_bad_cid, reply_bad_cid) = hub
        .connect(serde_json::json!({ "reconnection_token": token, "client_id": "c8" }))
        .await?;
    assert_eq!(reply_bad_cid["error"], "Client id mismatch, disconnecting");
    Ok(())
}
