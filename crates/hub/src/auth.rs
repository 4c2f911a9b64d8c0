// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer and reconnection token parsing and minting.
//!
//! Tokens are opaque to everything outside this module: base64url claims
//! followed by an HMAC-SHA256 tag over the encoded claims. A reconnection
//! token is an ordinary token whose claims additionally pin a
//! `(workspace, client_id)` pair.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::model::{UserInfo, ROOT_USER_ID};

/// Signed token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    user: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
}

/// Token verifier and minter, shared per process.
pub struct Auth {
    key: hmac::Key,
}

impl Auth {
    pub fn new(secret: &[u8]) -> Self {
        Self { key: hmac::Key::new(hmac::HMAC_SHA256, secret) }
    }

    /// Build from a configured secret, or a random per-process one when
    /// unset. A random secret means tokens do not survive restarts and
    /// cannot be verified by other fleet nodes.
    pub fn from_secret(secret: Option<&str>) -> anyhow::Result<Self> {
        match secret {
            Some(s) if !s.is_empty() => Ok(Self::new(s.as_bytes())),
            _ => {
                tracing::warn!(
                    "no token secret configured; using a random per-process secret"
                );
                let rng = ring::rand::SystemRandom::new();
                let key = hmac::Key::generate(hmac::HMAC_SHA256, &rng)
                    .map_err(|_| anyhow::anyhow!("failed to generate token secret"))?;
                Ok(Self { key })
            }
        }
    }

    fn sign(&self, claims: &Claims) -> Result<String, HubError> {
        let body = serde_json::to_vec(claims)
            .map_err(|e| HubError::internal(format!("failed to encode token: {e}")))?;
        let encoded = URL_SAFE_NO_PAD.encode(body);
        let tag = hmac::sign(&self.key, encoded.as_bytes());
        Ok(format!("{encoded}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref())))
    }

    fn verify(&self, token: &str) -> Result<Claims, HubError> {
        let (encoded, tag) = token
            .split_once('.')
            .ok_or_else(|| HubError::unauthenticated("malformed token"))?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| HubError::unauthenticated("malformed token signature"))?;
        hmac::verify(&self.key, encoded.as_bytes(), &tag)
            .map_err(|_| HubError::unauthenticated("invalid token signature"))?;
        let body = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| HubError::unauthenticated("malformed token body"))?;
        let claims: Claims = serde_json::from_slice(&body)
            .map_err(|_| HubError::unauthenticated("malformed token claims"))?;
        if let Some(expires_at) = claims.expires_at {
            if now_secs() >= expires_at {
                return Err(HubError::unauthenticated("token has expired"));
            }
        }
        if claims.user.id == ROOT_USER_ID {
            return Err(HubError::unauthenticated(
                "Root user is not allowed to connect remotely",
            ));
        }
        Ok(claims)
    }

    /// Mint an access token for a user.
    pub fn generate_token(
        &self,
        user: &UserInfo,
        expires_in: Option<u64>,
    ) -> Result<String, HubError> {
        let claims = Claims {
            user: user.clone(),
            workspace: None,
            client_id: None,
            expires_at: expires_in.map(|secs| now_secs() + secs),
        };
        self.sign(&claims)
    }

    /// Verify an access token and return its user.
    pub fn parse_token(&self, token: &str) -> Result<UserInfo, HubError> {
        Ok(self.verify(token)?.user)
    }

    /// Mint a reconnection token granting re-entry as `(user, ws, cid)`.
    pub fn generate_reconnection_token(
        &self,
        user: &UserInfo,
        workspace: &str,
        client_id: &str,
        expires_in: u64,
    ) -> Result<String, HubError> {
        let claims = Claims {
            user: user.clone(),
            workspace: Some(workspace.to_owned()),
            client_id: Some(client_id.to_owned()),
            expires_at: Some(now_secs() + expires_in),
        };
        self.sign(&claims)
    }

    /// Verify a reconnection token and return `(user, workspace, client_id)`.
    pub fn parse_reconnection_token(
        &self,
        token: &str,
    ) -> Result<(UserInfo, String, String), HubError> {
        let claims = self.verify(token)?;
        let workspace = claims
            .workspace
            .ok_or_else(|| HubError::unauthenticated("not a reconnection token"))?;
        let client_id = claims
            .client_id
            .ok_or_else(|| HubError::unauthenticated("not a reconnection token"))?;
        Ok((claims.user, workspace, client_id))
    }
}

/// Current UNIX time in whole seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
