// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the hub.

pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::store::Store;

/// Build the axum `Router` with all hub routes.
pub fn build_router(store: Arc<Store>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Client fabric
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(store)
}
