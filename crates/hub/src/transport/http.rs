// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plain HTTP endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::store::Store;

/// `GET /api/v1/health` — liveness and node identity.
pub async fn health(State(store): State<Arc<Store>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "running",
        "node_id": store.node_id(),
        "manager_id": store.manager_id(),
    }))
}
