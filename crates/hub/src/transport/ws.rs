// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket endpoint: the first-frame handshake and the per-session frame
//! loop.
//!
//! Every transport is accepted before inspection so error frames can reach
//! the client; the legacy query-parameter handshake is then refused with a
//! policy-violation close. A well-formed session authenticates via the
//! first text frame, provisions its workspace, survives duplicate
//! detection, and settles into a binary frame loop where per-frame envelope
//! errors are reported back without closing the transport.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{RawQuery, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::HubError;
use crate::model::{
    validate_id, ClientInfo, UserInfo, Visibility, WorkspaceInfo, TEMPORARY_TEST_USER_ROLE,
};
use crate::store::Store;

/// First-frame authentication payload.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct HandshakeRequest {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub reconnection_token: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// `GET /ws` — upgrade to the hub fabric.
pub async fn ws_handler(
    State(store): State<Arc<Store>>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(store, socket, query))
}

fn error_frame(reason: &str) -> String {
    serde_json::json!({ "error": reason, "success": false }).to_string()
}

/// Send the JSON error frame, then close with `code`.
async fn reject(socket: &mut WebSocket, code: u16, reason: &str) {
    if socket.send(Message::Text(error_frame(reason).into())).await.is_err() {
        return;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.to_owned().into() })))
        .await;
}

async fn handle_socket(store: Arc<Store>, mut socket: WebSocket, query: Option<String>) {
    // Accept-then-close keeps the error frame deliverable to legacy clients.
    if query.as_deref().is_some_and(|q| !q.is_empty()) {
        tracing::warn!("rejecting legacy query-parameter handshake");
        reject(
            &mut socket,
            1008,
            "Connection rejected: authentication moved to the first message; \
             please upgrade your client",
        )
        .await;
        return;
    }

    let request = match read_handshake(&mut socket, store.config().handshake_timeout()).await {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(err = %err, "handshake read failed");
            reject(&mut socket, err.close_code(), err.message()).await;
            return;
        }
    };

    match establish(&store, &request).await {
        Ok(session) => run_session(store, socket, session).await,
        Err(err) => {
            tracing::warn!(err = %err, "handshake failed");
            reject(&mut socket, err.close_code(), err.message()).await;
        }
    }
}

/// Await and parse the first-frame authentication payload.
async fn read_handshake(
    socket: &mut WebSocket,
    timeout: Duration,
) -> Result<HandshakeRequest, HubError> {
    let msg = tokio::time::timeout(timeout, socket.recv())
        .await
        .map_err(|_| HubError::invalid_argument("timed out waiting for authentication"))?;
    let text = match msg {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(_)) => {
            return Err(HubError::invalid_argument(
                "authentication must arrive as a text frame",
            ));
        }
        Some(Err(_)) | None => {
            return Err(HubError::invalid_argument("connection closed before authentication"));
        }
    };
    serde_json::from_str(text.as_str())
        .map_err(|_| HubError::invalid_argument("Failed to decode authentication information"))
}

/// An authenticated, provisioned session ready to pump frames.
struct Session {
    connection: Arc<Connection>,
    reply: serde_json::Value,
    workspace: String,
    client_id: String,
    user: UserInfo,
}

/// Steps 3–8 of the handshake: authenticate, provision the workspace, check
/// permission, detect duplicates, and build the connection and reply.
async fn establish(store: &Arc<Store>, request: &HandshakeRequest) -> Result<Session, HubError> {
    let client_id = request
        .client_id
        .clone()
        .ok_or_else(|| HubError::invalid_argument("Missing query parameters: client_id"))?;
    validate_id(&client_id, "client id")?;

    let (user, workspace) = authenticate(store, request, &client_id)?;

    let workspace = match workspace {
        Some(workspace) => workspace,
        None => user.id.clone(),
    };
    if workspace == "*" {
        return Err(HubError::invalid_argument(
            "Dynamic workspace is not allowed for this endpoint",
        ));
    }
    validate_id(&workspace, "workspace name")?;

    if !store.workspace_exists(&workspace).await? {
        // Only a user's own workspace is created on first connect.
        if workspace != user.id {
            return Err(HubError::permission_denied(format!(
                "Permission denied for workspace: {workspace}"
            )));
        }
        let persistent = !user.is_anonymous && !user.has_role(TEMPORARY_TEST_USER_ROLE);
        store
            .register_workspace_info(
                WorkspaceInfo {
                    name: workspace.clone(),
                    persistent,
                    owners: vec![user.id.clone()],
                    read_only: user.is_anonymous,
                    visibility: Visibility::Protected,
                    description: None,
                    config: None,
                },
                false,
            )
            .await?;
        tracing::info!(workspace = %workspace, "created workspace");
    }

    if !store.check_permission(&user, &workspace).await? {
        return Err(HubError::permission_denied(format!(
            "Permission denied for workspace: {workspace}"
        )));
    }

    let manager = store.get_workspace_manager(&workspace, true).await?;

    if store.client_exists(&client_id, &workspace).await? {
        match manager.ping_client(&client_id, store.config().ping_timeout()).await {
            Ok(()) => {
                return Err(HubError::conflict(format!(
                    "Client already exists and is active: {workspace}/{client_id}"
                )));
            }
            Err(_) => {
                tracing::info!(
                    client = %format!("{workspace}/{client_id}"),
                    "evicting stale client"
                );
                store.delete_client(&client_id, &workspace, &user).await?;
            }
        }
    }

    store.register_user(&user).await?;
    store.register_client(ClientInfo::new(&client_id, &workspace, user.clone())).await?;

    let connection =
        Connection::new(Arc::clone(store.event_bus()), &workspace, &client_id, user.clone())?;
    let reconnection_token = store.auth().generate_reconnection_token(
        &user,
        &workspace,
        &client_id,
        store.config().reconnection_token_ttl_secs,
    )?;
    let reply = serde_json::json!({
        "manager_id": store.manager_id(),
        "workspace": workspace,
        "client_id": client_id,
        "user": user,
        "reconnection_token": reconnection_token,
        "success": true,
    });

    Ok(Session { connection, reply, workspace, client_id, user })
}

/// Resolve the principal and any token-pinned workspace.
fn authenticate(
    store: &Store,
    request: &HandshakeRequest,
    client_id: &str,
) -> Result<(UserInfo, Option<String>), HubError> {
    if let Some(ref reconnection_token) = request.reconnection_token {
        let (user, workspace, pinned_client) =
            store.auth().parse_reconnection_token(reconnection_token)?;
        if request.workspace.as_ref().is_some_and(|ws| ws != &workspace) {
            return Err(HubError::unauthenticated("Workspace mismatch, disconnecting"));
        }
        if pinned_client != client_id {
            return Err(HubError::unauthenticated("Client id mismatch, disconnecting"));
        }
        return Ok((user, Some(workspace)));
    }
    if let Some(ref token) = request.token {
        return Ok((store.auth().parse_token(token)?, request.workspace.clone()));
    }
    Ok((UserInfo::anonymous(), request.workspace.clone()))
}

/// Step 9: wire the connection to the socket and pump frames until the
/// transport goes away.
async fn run_session(store: Arc<Store>, socket: WebSocket, session: Session) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Bytes>();
    session.connection.on_message(move |frame| {
        let _ = frame_tx.send(frame);
    });

    let reply = session.reply.to_string();
    let mut close_code: Option<u16> = None;

    if ws_tx.send(Message::Text(reply.into())).await.is_ok() {
        loop {
            tokio::select! {
                _ = store.shutdown_token().cancelled() => break,

                // Fabric -> client
                frame = frame_rx.recv() => {
                    match frame {
                        Some(bytes) => {
                            if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                // Client -> fabric
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if let Err(err) = session.connection.emit_message(&data).await {
                                // A bad envelope aborts this frame only.
                                tracing::warn!(
                                    client = %session.connection.address(),
                                    err = %err,
                                    "frame rejected"
                                );
                                let frame = error_frame(err.message());
                                if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            close_code = frame.map(|f| f.code);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break,
                    }
                }
            }
        }
    }

    finish_session(&store, &session, close_code).await;
}

/// Release everything a session holds; cleanup failures are logged, never
/// propagated.
async fn finish_session(store: &Arc<Store>, session: &Session, close_code: Option<u16>) {
    let address = session.connection.address();
    match close_code {
        Some(code @ (1000 | 1001)) => {
            tracing::info!(client = %address, code, "client disconnected");
        }
        Some(code) => {
            tracing::warn!(client = %address, code, "client disconnected unexpectedly");
        }
        None => {
            tracing::warn!(client = %address, "client transport dropped without close");
        }
    }

    session.connection.disconnect(Some("transport closed")).await;
    if let Err(err) = store
        .delete_client(&session.client_id, &session.workspace, &session.user)
        .await
    {
        tracing::warn!(client = %address, err = %err, "failed to delete client");
    }
    if session.user.is_anonymous {
        if let Err(err) = store.remove_user(&session.user.id).await {
            tracing::warn!(user = %session.user.id, err = %err, "failed to remove user");
        }
    }
}
