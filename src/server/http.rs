//! Plain HTTP surface on the primary listener.
//!
//! One endpoint: `GET /health`, a cheap liveness probe for supervisors and
//! the `status` CLI command. Everything stateful goes over the WebSocket.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::GatewayState;

pub async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "server": {
            "name": "portcullis",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "uptimeMs": state.uptime_ms(),
        "connections": state.connection_count(),
        "nodes": state.nodes.lock().len(),
    }))
}
