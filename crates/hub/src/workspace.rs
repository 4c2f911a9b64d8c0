// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-workspace control surface.
//!
//! One manager per workspace per node, owned by the [`Store`]. The manager
//! holds an internal connection at `{ws}/workspace-manager-{node}` whose
//! message handler answers envelope-level `ping` probes, so liveness checks
//! work against managers exactly as against ordinary clients.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::bus::Payload;
use crate::codec;
use crate::connection::Connection;
use crate::error::HubError;
use crate::model::{ServiceInfo, ServiceQuery, UserInfo, Visibility, WorkspaceInfo};
use crate::store::Store;

/// Workspace admission rule.
///
/// Owners, scoped users, public workspaces, and the user whose id equals the
/// workspace name are admitted; anonymous users pass only the last clause.
pub(crate) fn permits(info: &WorkspaceInfo, user: &UserInfo) -> bool {
    if user.is_anonymous {
        return user.id == info.name;
    }
    let is_owner = info
        .owners
        .iter()
        .any(|owner| owner == &user.id || Some(owner.as_str()) == user.email.as_deref());
    is_owner
        || user
            .scopes
            .as_ref()
            .is_some_and(|scopes| scopes.iter().any(|scope| scope == &info.name))
        || info.visibility == Visibility::Public
        || user.id == info.name
}

/// Control-plane object for a single workspace.
pub struct WorkspaceManager {
    workspace: String,
    store: Arc<Store>,
    connection: Arc<Connection>,
}

impl WorkspaceManager {
    /// Create the manager and wire its probe-answering connection.
    pub(crate) fn spawn(store: Arc<Store>, workspace: &str) -> Result<Arc<Self>, HubError> {
        let manager_id = store.manager_id();
        let connection = store.create_rpc(&manager_id, workspace, Some(UserInfo::root()))?;

        let responder = Arc::clone(&connection);
        connection.on_message(move |frame: Bytes| {
            if let Some(reply_to) = ping_source(&frame, &manager_id) {
                let responder = Arc::clone(&responder);
                tokio::spawn(async move {
                    let pong = match codec::control_frame(&reply_to, "pong") {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::warn!(err = %err, "failed to build pong frame");
                            return;
                        }
                    };
                    if let Err(err) = responder.emit_message(&pong).await {
                        tracing::debug!(err = %err, "pong delivery failed");
                    }
                });
            }
        });

        tracing::debug!(workspace, "workspace manager started");
        Ok(Arc::new(Self { workspace: workspace.to_owned(), store, connection }))
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// The manager's routable address, `{ws}/workspace-manager-{node}`.
    pub fn address(&self) -> String {
        self.connection.address()
    }

    pub(crate) async fn close(&self) {
        self.connection.disconnect(Some("workspace manager closed")).await;
    }

    // -- Liveness -------------------------------------------------------------

    /// Probe a client in this workspace: send an envelope-level `ping` and
    /// wait for the matching `pong`. `Ok(())` means the client answered.
    pub async fn ping_client(&self, client_id: &str, timeout: Duration) -> Result<(), HubError> {
        let probe_id = format!("check-client-exists-{}", uuid::Uuid::new_v4().simple());
        let probe = self.store.create_rpc(&probe_id, &self.workspace, Some(UserInfo::root()))?;

        // The watch must be live before the ping leaves, or a fast pong
        // could slip past.
        let reply_channel = format!("{}/{}:msg", self.workspace, probe_id);
        let watch = self.store.event_bus().watch(&reply_channel);

        let target = format!("{}/{}", self.workspace, client_id);
        let result = match codec::control_frame(&target, "ping") {
            Ok(frame) => match probe.emit_message(&frame).await {
                Ok(()) => {
                    let is_pong = |payload: &Payload| {
                        payload
                            .as_bytes()
                            .and_then(|bytes| codec::read_header(bytes).ok())
                            .is_some_and(|(header, _)| {
                                codec::header_str(&header, "type") == Some("pong")
                            })
                    };
                    watch.wait(Some(&is_pong), timeout).await.map(|_| ())
                }
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        probe.disconnect(None).await;
        result.map_err(|_| HubError::not_found(format!("no pong from: {target}")))
    }

    // -- Services -------------------------------------------------------------

    /// Register (or replace) a service owned by `client_id`.
    ///
    /// Only clients of this workspace may register; a `single-instance`
    /// service supersedes every same-name service already in the workspace.
    pub async fn register_service(
        &self,
        client_id: &str,
        caller_workspace: &str,
        mut service: ServiceInfo,
    ) -> Result<ServiceInfo, HubError> {
        if caller_workspace != self.workspace
            || service
                .config
                .workspace
                .as_ref()
                .is_some_and(|ws| ws != &self.workspace)
        {
            return Err(HubError::permission_denied(
                "Services can only be registered from the same workspace",
            ));
        }
        service.config.workspace = Some(self.workspace.clone());

        // Scope the id to the owning client.
        let local_id = service
            .id
            .rsplit(':')
            .next()
            .filter(|tail| !tail.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| service.name.clone());
        service.id = format!("{client_id}:{local_id}");

        let mut owner = self
            .store
            .get_client(client_id, &self.workspace)
            .await?
            .ok_or_else(|| {
                HubError::not_found(format!("client not found: {}/{client_id}", self.workspace))
            })?;

        if service.is_singleton() {
            for mut other in self.store.list_clients(&self.workspace).await? {
                if other.id == client_id {
                    continue;
                }
                let before = other.services.len();
                other.services.retain(|s| s.name != service.name);
                if other.services.len() != before {
                    self.store.register_client(other).await?;
                }
            }
            owner.services.retain(|s| s.name != service.name);
        }

        owner.services.retain(|s| s.id != service.id);
        owner.services.push(service.clone());
        self.store.register_client(owner).await?;

        tracing::info!(
            workspace = %self.workspace,
            service = %service.id,
            "service registered"
        );
        Ok(service)
    }

    /// List services visible from this workspace: everything registered
    /// here, plus public services from other workspaces.
    pub async fn list_services(&self, query: &ServiceQuery) -> Result<Vec<ServiceInfo>, HubError> {
        let mut services = Vec::new();
        for client in self.store.list_clients(&self.workspace).await? {
            services.extend(client.services.into_iter().filter(|s| query.matches(s)));
        }
        for workspace in self.store.list_workspaces().await? {
            if workspace == self.workspace {
                continue;
            }
            for client in self.store.list_clients(&workspace).await? {
                services.extend(
                    client
                        .services
                        .into_iter()
                        .filter(|s| s.config.visibility == Visibility::Public)
                        .filter(|s| query.matches(s)),
                );
            }
        }
        Ok(services)
    }

    // -- Workspace record -----------------------------------------------------

    /// Whether `user` may enter this workspace (or `workspace`, when given).
    pub async fn check_permission(
        &self,
        user: &UserInfo,
        workspace: Option<&str>,
    ) -> Result<bool, HubError> {
        self.store
            .check_permission(user, workspace.unwrap_or(&self.workspace))
            .await
    }

    pub async fn get_workspace_info(&self) -> Result<WorkspaceInfo, HubError> {
        self.store
            .get_workspace(&self.workspace)
            .await?
            .ok_or_else(|| HubError::not_found(format!("workspace not found: {}", self.workspace)))
    }

    /// Patch mutable workspace fields. The name is immutable and unknown
    /// keys are rejected.
    pub async fn set(
        &self,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<WorkspaceInfo, HubError> {
        fn field<T: serde::de::DeserializeOwned>(
            key: &str,
            value: serde_json::Value,
        ) -> Result<T, HubError> {
            serde_json::from_value(value).map_err(|e| {
                HubError::invalid_argument(format!("invalid value for {key}: {e}"))
            })
        }

        let mut info = self.get_workspace_info().await?;
        for (key, value) in patch {
            match key.as_str() {
                "name" => {
                    return Err(HubError::invalid_argument(
                        "Changing workspace name is not allowed",
                    ));
                }
                "persistent" => info.persistent = field(&key, value)?,
                "read_only" => info.read_only = field(&key, value)?,
                "owners" => info.owners = field(&key, value)?,
                "visibility" => info.visibility = field(&key, value)?,
                "description" => info.description = field(&key, value)?,
                "config" => info.config = field(&key, value)?,
                other => {
                    return Err(HubError::invalid_argument(format!(
                        "unknown workspace field: {other}"
                    )));
                }
            }
        }
        self.store.put_workspace(&info).await?;
        Ok(info)
    }

    pub async fn list_clients(&self) -> Result<Vec<crate::model::ClientInfo>, HubError> {
        self.store.list_clients(&self.workspace).await
    }

    /// Remove this workspace entirely.
    pub async fn delete_workspace(&self) -> Result<(), HubError> {
        self.store.delete_workspace(&self.workspace).await
    }
}

/// If `frame` is a ping addressed to `manager_id`, return its `from`
/// address for the pong.
fn ping_source(frame: &[u8], manager_id: &str) -> Option<String> {
    let (header, _) = codec::read_header(frame).ok()?;
    if codec::header_str(&header, "type") != Some("ping") {
        return None;
    }
    let to = codec::header_str(&header, "to")?;
    if to.split('/').nth(1) != Some(manager_id) {
        return None;
    }
    codec::header_str(&header, "from").map(str::to_owned)
}

#[cfg(test)]
#[path = "workspace_tests.rs"]
mod tests;
