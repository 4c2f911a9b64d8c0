// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workspace, user, client, and service records shared across the hub.
//!
//! All wire-format types here use JSON field names matching the handshake
//! and envelope contracts; the same structs are stored in the broker-backed
//! registry.

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// Reserved in-process principal; never accepted from a remote connection.
pub const ROOT_USER_ID: &str = "root";

/// The always-present shared workspace.
pub const PUBLIC_WORKSPACE: &str = "public";

/// Role marking throwaway users whose workspaces must not persist.
pub const TEMPORARY_TEST_USER_ROLE: &str = "temporary-test-user";

/// Visibility of a workspace or service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Protected,
}

/// An authenticated (or synthesized anonymous) principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub is_anonymous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Workspace names this user may enter, in addition to ownership rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// UNIX seconds after which the user's credentials are invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl UserInfo {
    /// Synthesize a fresh anonymous user with a random id.
    pub fn anonymous() -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            roles: Vec::new(),
            is_anonymous: true,
            email: None,
            parent: None,
            scopes: None,
            expires_at: None,
        }
    }

    /// The in-process root principal used for the public workspace and probes.
    pub fn root() -> Self {
        Self {
            id: ROOT_USER_ID.to_owned(),
            roles: vec!["admin".to_owned()],
            is_anonymous: false,
            email: None,
            parent: None,
            scopes: None,
            expires_at: None,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// A workspace record as stored in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub name: String,
    pub persistent: bool,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Map<String, serde_json::Value>>,
}

impl WorkspaceInfo {
    /// The built-in `public` workspace: persistent, read-only, root-owned.
    pub fn public() -> Self {
        Self {
            name: PUBLIC_WORKSPACE.to_owned(),
            persistent: true,
            owners: vec![ROOT_USER_ID.to_owned()],
            read_only: true,
            visibility: Visibility::Public,
            description: None,
            config: None,
        }
    }
}

/// A workspace creation request.
///
/// The legacy `public` boolean is accepted as an alias for
/// `visibility = "public"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    pub name: String,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Map<String, serde_json::Value>>,
}

impl WorkspaceSpec {
    pub fn into_info(self) -> WorkspaceInfo {
        let visibility = if self.public { Visibility::Public } else { self.visibility };
        WorkspaceInfo {
            name: self.name,
            persistent: self.persistent,
            owners: self.owners,
            read_only: self.read_only,
            visibility,
            description: self.description,
            config: self.config,
        }
    }
}

/// Service configuration, nested under `ServiceInfo.config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub require_context: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// A service registered by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Scoped id, `{client_id}:{local_id}` once registered.
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub config: ServiceConfig,
}

impl ServiceInfo {
    /// A `single-instance` service supersedes same-name services in its
    /// workspace.
    pub fn is_singleton(&self) -> bool {
        self.config.flags.iter().any(|f| f == "single-instance")
    }
}

/// Name/type filter for service listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

impl ServiceQuery {
    pub fn matches(&self, service: &ServiceInfo) -> bool {
        if let Some(ref name) = self.name {
            if &service.name != name {
                return false;
            }
        }
        if let Some(ref ty) = self.service_type {
            if &service.service_type != ty {
                return false;
            }
        }
        true
    }
}

/// One active transport connection inside a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub workspace: String,
    #[serde(default)]
    pub services: Vec<ServiceInfo>,
    pub user: UserInfo,
}

impl ClientInfo {
    pub fn new(id: impl Into<String>, workspace: impl Into<String>, user: UserInfo) -> Self {
        Self {
            id: id.into(),
            name: None,
            workspace: workspace.into(),
            services: Vec::new(),
            user,
        }
    }
}

/// Validate a workspace or client identifier for use in registry keys and
/// broker channel names. Rejects empties, path separators, and the
/// characters reserved by channel grammar.
pub fn validate_id(id: &str, what: &str) -> Result<(), HubError> {
    if id.is_empty() {
        return Err(HubError::invalid_argument(format!("{what} must not be empty")));
    }
    if id.chars().any(|c| c == '/' || c == ':' || c == '*' || c.is_whitespace()) {
        return Err(HubError::invalid_argument(format!("invalid {what}: {id}")));
    }
    Ok(())
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
