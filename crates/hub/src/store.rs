// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide registry of workspaces, clients, and users, keyed by the
//! broker so every fleet node sees the same state.
//!
//! Registry layout in the broker's key space:
//!
//! - `workspaces/{name}` — [`WorkspaceInfo`] as JSON
//! - `clients/{ws}/{cid}` — [`ClientInfo`] as JSON (services embedded)
//! - `users/{uid}` — [`UserInfo`] as JSON

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::auth::Auth;
use crate::broker::Broker;
use crate::bus::{FederatedEventBus, Payload};
use crate::config::HubConfig;
use crate::connection::Connection;
use crate::error::HubError;
use crate::model::{
    validate_id, ClientInfo, UserInfo, WorkspaceInfo, WorkspaceSpec, PUBLIC_WORKSPACE,
};
use crate::workspace::WorkspaceManager;

fn workspace_key(name: &str) -> String {
    format!("workspaces/{name}")
}

fn client_key(workspace: &str, client_id: &str) -> String {
    format!("clients/{workspace}/{client_id}")
}

fn client_prefix(workspace: &str) -> String {
    format!("clients/{workspace}/")
}

fn user_key(id: &str) -> String {
    format!("users/{id}")
}

/// The hub's shared state: broker handle, federated bus, auth, and the
/// per-node workspace manager table.
pub struct Store {
    config: HubConfig,
    broker: Arc<dyn Broker>,
    bus: Arc<FederatedEventBus>,
    auth: Auth,
    node_id: String,
    managers: RwLock<HashMap<String, Arc<WorkspaceManager>>>,
    shutdown: CancellationToken,
}

impl Store {
    pub fn new(
        config: HubConfig,
        broker: Arc<dyn Broker>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let auth = Auth::from_secret(config.token_secret.as_deref())?;
        let bus = Arc::new(FederatedEventBus::new(Arc::clone(&broker), shutdown.clone()));
        Ok(Arc::new(Self {
            config,
            broker,
            bus,
            auth,
            node_id: uuid::Uuid::new_v4().simple().to_string(),
            managers: RwLock::new(HashMap::new()),
            shutdown,
        }))
    }

    /// Bring the fabric up: start the federated bus, ensure the `public`
    /// workspace, and hook workspace garbage collection.
    pub async fn init(self: &Arc<Self>) -> anyhow::Result<()> {
        self.bus.init().await?;
        self.register_workspace_info(WorkspaceInfo::public(), true).await?;
        self.get_workspace_manager(PUBLIC_WORKSPACE, true).await?;

        // Sweep non-persistent workspaces whenever a client goes away.
        // Every node sees the event; the sweep is idempotent.
        let store = Arc::downgrade(self);
        self.bus.on("client_deleted", move |payload: &Payload| {
            let Some(value) = payload.as_json() else {
                return Ok(());
            };
            let Some(workspace) = value.get("workspace").and_then(|w| w.as_str()) else {
                return Ok(());
            };
            if let Some(store) = store.upgrade() {
                let workspace = workspace.to_owned();
                tokio::spawn(async move {
                    if let Err(err) = store.sweep_workspace(&workspace).await {
                        tracing::warn!(workspace = %workspace, err = %err, "workspace sweep failed");
                    }
                });
            }
            Ok(())
        });

        tracing::info!(node_id = %self.node_id, "store initialized");
        Ok(())
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    pub fn event_bus(&self) -> &Arc<FederatedEventBus> {
        &self.bus
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The manager address component for this node,
    /// `workspace-manager-{node}`.
    pub fn manager_id(&self) -> String {
        format!("workspace-manager-{}", self.node_id)
    }

    // -- Workspaces -----------------------------------------------------------

    pub async fn register_workspace(
        &self,
        spec: WorkspaceSpec,
        overwrite: bool,
    ) -> Result<WorkspaceInfo, HubError> {
        self.register_workspace_info(spec.into_info(), overwrite).await
    }

    pub(crate) async fn register_workspace_info(
        &self,
        info: WorkspaceInfo,
        overwrite: bool,
    ) -> Result<WorkspaceInfo, HubError> {
        validate_id(&info.name, "workspace name")?;
        if !overwrite && self.workspace_exists(&info.name).await? {
            return Err(HubError::conflict(format!(
                "workspace already exists: {}",
                info.name
            )));
        }
        self.put_workspace(&info).await?;
        Ok(info)
    }

    pub(crate) async fn put_workspace(&self, info: &WorkspaceInfo) -> Result<(), HubError> {
        let body = serde_json::to_vec(info)
            .map_err(|e| HubError::internal(format!("failed to encode workspace: {e}")))?;
        self.broker.kv_put(&workspace_key(&info.name), Bytes::from(body)).await?;
        Ok(())
    }

    pub async fn get_workspace(&self, name: &str) -> Result<Option<WorkspaceInfo>, HubError> {
        match self.broker.kv_get(&workspace_key(name)).await? {
            Some(body) => serde_json::from_slice(&body)
                .map(Some)
                .map_err(|e| HubError::internal(format!("corrupt workspace record: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn workspace_exists(&self, name: &str) -> Result<bool, HubError> {
        Ok(self.broker.kv_get(&workspace_key(name)).await?.is_some())
    }

    pub async fn list_workspaces(&self) -> Result<Vec<String>, HubError> {
        Ok(self
            .broker
            .kv_keys("workspaces/")
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix("workspaces/").map(str::to_owned))
            .collect())
    }

    /// Remove a workspace and this node's manager for it.
    pub async fn delete_workspace(&self, name: &str) -> Result<(), HubError> {
        self.broker.kv_delete(&workspace_key(name)).await?;
        let manager = self.managers.write().await.remove(name);
        if let Some(manager) = manager {
            manager.close().await;
        }
        self.bus
            .emit("workspace_deleted", Payload::Json(serde_json::json!({ "name": name })))
            .await
            .map_err(|e| HubError::internal(format!("failed to publish event: {e:#}")))?;
        tracing::info!(workspace = %name, "workspace deleted");
        Ok(())
    }

    /// Drop a non-persistent workspace once its last client is gone.
    pub(crate) async fn sweep_workspace(&self, name: &str) -> Result<(), HubError> {
        if name == PUBLIC_WORKSPACE {
            return Ok(());
        }
        let Some(info) = self.get_workspace(name).await? else {
            // Another node already swept it; drop the local manager.
            let manager = self.managers.write().await.remove(name);
            if let Some(manager) = manager {
                manager.close().await;
            }
            return Ok(());
        };
        if info.persistent {
            return Ok(());
        }
        if self.list_clients(name).await?.is_empty() {
            self.delete_workspace(name).await?;
        }
        Ok(())
    }

    // -- Clients and users ----------------------------------------------------

    pub async fn register_client(&self, info: ClientInfo) -> Result<(), HubError> {
        validate_id(&info.id, "client id")?;
        let body = serde_json::to_vec(&info)
            .map_err(|e| HubError::internal(format!("failed to encode client: {e}")))?;
        self.broker
            .kv_put(&client_key(&info.workspace, &info.id), Bytes::from(body))
            .await?;
        Ok(())
    }

    pub async fn get_client(
        &self,
        client_id: &str,
        workspace: &str,
    ) -> Result<Option<ClientInfo>, HubError> {
        match self.broker.kv_get(&client_key(workspace, client_id)).await? {
            Some(body) => serde_json::from_slice(&body)
                .map(Some)
                .map_err(|e| HubError::internal(format!("corrupt client record: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn client_exists(
        &self,
        client_id: &str,
        workspace: &str,
    ) -> Result<bool, HubError> {
        Ok(self.broker.kv_get(&client_key(workspace, client_id)).await?.is_some())
    }

    pub async fn list_clients(&self, workspace: &str) -> Result<Vec<ClientInfo>, HubError> {
        let mut clients = Vec::new();
        for key in self.broker.kv_keys(&client_prefix(workspace)).await? {
            if let Some(body) = self.broker.kv_get(&key).await? {
                match serde_json::from_slice(&body) {
                    Ok(client) => clients.push(client),
                    Err(err) => tracing::warn!(key, err = %err, "skipping corrupt client record"),
                }
            }
        }
        Ok(clients)
    }

    /// Remove a client and its services, then announce `client_deleted`.
    pub async fn delete_client(
        &self,
        client_id: &str,
        workspace: &str,
        user: &UserInfo,
    ) -> Result<(), HubError> {
        self.broker.kv_delete(&client_key(workspace, client_id)).await?;
        self.bus
            .emit(
                "client_deleted",
                Payload::Json(serde_json::json!({
                    "id": client_id,
                    "workspace": workspace,
                    "user": user.id,
                })),
            )
            .await
            .map_err(|e| HubError::internal(format!("failed to publish event: {e:#}")))?;
        Ok(())
    }

    pub async fn register_user(&self, user: &UserInfo) -> Result<(), HubError> {
        let body = serde_json::to_vec(user)
            .map_err(|e| HubError::internal(format!("failed to encode user: {e}")))?;
        self.broker.kv_put(&user_key(&user.id), Bytes::from(body)).await?;
        Ok(())
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserInfo>, HubError> {
        match self.broker.kv_get(&user_key(user_id)).await? {
            Some(body) => serde_json::from_slice(&body)
                .map(Some)
                .map_err(|e| HubError::internal(format!("corrupt user record: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn remove_user(&self, user_id: &str) -> Result<(), HubError> {
        self.broker.kv_delete(&user_key(user_id)).await?;
        Ok(())
    }

    // -- Permissions ----------------------------------------------------------

    /// Whether `user` may enter `workspace`. A missing workspace denies.
    pub async fn check_permission(
        &self,
        user: &UserInfo,
        workspace: &str,
    ) -> Result<bool, HubError> {
        match self.get_workspace(workspace).await? {
            Some(info) => Ok(crate::workspace::permits(&info, user)),
            None => Ok(false),
        }
    }

    // -- Managers and internal connections ------------------------------------

    /// Return this node's manager for `name`, spawning it when `setup` is
    /// set. Without `setup`, a missing manager is an error.
    pub async fn get_workspace_manager(
        self: &Arc<Self>,
        name: &str,
        setup: bool,
    ) -> Result<Arc<WorkspaceManager>, HubError> {
        if let Some(manager) = self.managers.read().await.get(name) {
            return Ok(Arc::clone(manager));
        }
        if !setup {
            return Err(HubError::not_found(format!("workspace manager not found: {name}")));
        }
        if !self.workspace_exists(name).await? {
            return Err(HubError::not_found(format!("workspace not found: {name}")));
        }
        let mut managers = self.managers.write().await;
        if let Some(manager) = managers.get(name) {
            return Ok(Arc::clone(manager));
        }
        let manager = WorkspaceManager::spawn(Arc::clone(self), name)?;
        managers.insert(name.to_owned(), Arc::clone(&manager));
        Ok(manager)
    }

    /// Open an internal connection into `workspace`, used by the hub itself
    /// for probes. Waits up to `timeout` for the fabric to be ready.
    pub async fn connect_to_workspace(
        self: &Arc<Self>,
        workspace: &str,
        client_id: &str,
        user: UserInfo,
        timeout: Duration,
    ) -> Result<Arc<Connection>, HubError> {
        tokio::time::timeout(timeout, self.bus.ready())
            .await
            .map_err(|_| HubError::internal("timed out waiting for the event bus"))?
            .map_err(|e| HubError::internal(format!("{e:#}")))?;
        self.get_workspace_manager(workspace, true).await?;
        self.create_rpc(client_id, workspace, Some(user))
    }

    /// Construct an in-process connection for server-initiated traffic.
    /// Defaults to the root principal.
    pub fn create_rpc(
        &self,
        client_id: &str,
        workspace: &str,
        user: Option<UserInfo>,
    ) -> Result<Arc<Connection>, HubError> {
        Connection::new(
            Arc::clone(&self.bus),
            workspace,
            client_id,
            user.unwrap_or_else(UserInfo::root),
        )
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
