//! Request dispatch.
//!
//! Routes authenticated requests (from primary connections and bridge nodes
//! alike) to method handlers through a typed registry: a fixed core table
//! plus provider-contributed methods, with a registration-time collision
//! check. Exactly one response frame is produced per request; handler panics
//! are caught at the dispatch boundary and surfaced as an "unavailable"
//! error without closing the connection.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::server::ws::broadcast::{broadcast_event, BroadcastOpts};
use crate::server::ws::frames::{
    error_shape, response_err, response_ok, ErrorShape, RequestFrame, ERROR_INVALID_REQUEST,
    ERROR_UNAVAILABLE,
};
use crate::state::presence::now_ms;
use crate::state::runs::{ChatRunStatus, RegisterOutcome};
use crate::state::GatewayState;

/// Who issued a request. Handlers that only make sense for one class of
/// caller check this; everything else stays connection-agnostic.
#[derive(Debug, Clone)]
pub enum Caller {
    Primary,
    Node { node_id: String },
}

#[derive(Clone)]
pub struct RequestContext {
    pub state: Arc<GatewayState>,
    pub conn_id: String,
    pub caller: Caller,
}

pub type MethodHandler =
    Arc<dyn Fn(Option<Value>, RequestContext) -> BoxFuture<'static, Result<Value, ErrorShape>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("method name collision: {0:?} is already registered")]
    Collision(String),
}

pub struct MethodRegistry {
    handlers: RwLock<HashMap<String, MethodHandler>>,
}

/// Wrap an async fn into the boxed handler shape.
pub fn handler<F, Fut>(f: F) -> MethodHandler
where
    F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, ErrorShape>> + Send + 'static,
{
    Arc::new(move |params, ctx| Box::pin(f(params, ctx)))
}

impl MethodRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// The fixed core method table.
    pub fn with_core_methods() -> Self {
        let registry = Self::empty();
        let core: [(&str, MethodHandler); 8] = [
            ("ping", handler(handle_ping)),
            ("status", handler(handle_status)),
            ("health", handler(handle_health)),
            ("presence.list", handler(handle_presence_list)),
            ("chat.send", handler(handle_chat_send)),
            ("chat.abort", handler(handle_chat_abort)),
            ("subscribe", handler(handle_subscribe)),
            ("unsubscribe", handler(handle_unsubscribe)),
        ];
        for (name, h) in core {
            registry
                .register(name, h)
                .unwrap_or_else(|e| unreachable!("core table is collision-free: {e}"));
        }
        registry
    }

    /// Register a method. Duplicate names are a configuration error.
    pub fn register(&self, name: &str, handler: MethodHandler) -> Result<(), RegistryError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(name) {
            return Err(RegistryError::Collision(name.to_string()));
        }
        handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.push("connect".to_string());
        names.sort();
        names
    }

    fn get(&self, name: &str) -> Option<MethodHandler> {
        self.handlers.read().get(name).cloned()
    }
}

/// Dispatch one request and build its single response frame. The request id
/// is echoed verbatim whatever happens.
pub async fn dispatch_request(ctx: RequestContext, frame: RequestFrame) -> Value {
    let registry = ctx.state.methods();
    let handler = match registry.get(&frame.method) {
        Some(h) => h,
        None => {
            debug!(
                target: "ws",
                conn_id = %ctx.conn_id,
                method = %frame.method,
                "unknown method"
            );
            return response_err(
                &frame.id,
                &error_shape(
                    ERROR_INVALID_REQUEST,
                    format!("unknown method: {}", frame.method),
                    None,
                ),
            );
        }
    };

    let started = std::time::Instant::now();
    let outcome = AssertUnwindSafe(handler(frame.params.clone(), ctx.clone()))
        .catch_unwind()
        .await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(payload)) => response_ok(&frame.id, payload),
        Ok(Err(err)) => {
            debug!(
                target: "ws",
                conn_id = %ctx.conn_id,
                method = %frame.method,
                code = %err.code,
                duration_ms,
                "request failed"
            );
            response_err(&frame.id, &err)
        }
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                target: "ws",
                conn_id = %ctx.conn_id,
                method = %frame.method,
                duration_ms,
                panic = %detail,
                "handler panicked"
            );
            response_err(
                &frame.id,
                &error_shape(ERROR_UNAVAILABLE, "method unavailable", None),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Core handlers
// ---------------------------------------------------------------------------

fn param_str(params: Option<&Value>, key: &str) -> Option<String> {
    params
        .and_then(|p| p.get(key))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn require_str(params: Option<&Value>, key: &str) -> Result<String, ErrorShape> {
    param_str(params, key)
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, format!("missing param: {key}"), None))
}

async fn handle_ping(_params: Option<Value>, _ctx: RequestContext) -> Result<Value, ErrorShape> {
    Ok(json!({"pong": true, "ts": now_ms()}))
}

async fn handle_status(_params: Option<Value>, ctx: RequestContext) -> Result<Value, ErrorShape> {
    let state = &ctx.state;
    Ok(json!({
        "uptimeMs": state.uptime_ms(),
        "connections": state.connection_count(),
        "nodes": state.nodes.lock().len(),
        "activeRuns": state.runs.lock().active_count(),
        "stateVersion": state.state_version_value(),
    }))
}

async fn handle_health(_params: Option<Value>, ctx: RequestContext) -> Result<Value, ErrorShape> {
    let state = ctx.state.clone();
    if let Some(fresh) = state.health.fresh() {
        return Ok(json!({
            "health": fresh,
            "stateVersion": state.state_version_value(),
        }));
    }

    let probe_state = state.clone();
    let payload = state
        .health
        .refresh(move || async move {
            let state_dir = crate::config::resolve_state_dir();
            let payload =
                crate::state::health::gather_health(&state_dir, probe_state.uptime_ms());
            probe_state.state_versions.lock().bump_health();
            payload
        })
        .await;

    broadcast_event(
        &state,
        "health",
        payload.clone(),
        &BroadcastOpts::versioned(&state),
    );

    Ok(json!({
        "health": payload,
        "stateVersion": state.state_version_value(),
    }))
}

async fn handle_presence_list(
    _params: Option<Value>,
    ctx: RequestContext,
) -> Result<Value, ErrorShape> {
    let state = &ctx.state;
    let snapshot = state.presence.lock().snapshot();
    Ok(json!({
        "presence": snapshot,
        "stateVersion": state.state_version_value(),
    }))
}

/// Accept a chat turn. The idempotency key is checked against the dedupe
/// cache first: a duplicate within the TTL window must not start a second
/// run.
async fn handle_chat_send(params: Option<Value>, ctx: RequestContext) -> Result<Value, ErrorShape> {
    let params = params.as_ref();
    let session_key = require_str(params, "sessionKey")?;
    let _message = require_str(params, "message")?;
    let idempotency_key = require_str(params, "idempotencyKey")?;

    let state = &ctx.state;
    let run_id = idempotency_key.clone();

    if state.dedupe.seen(&idempotency_key) {
        debug!(target: "gateway", run_id = %run_id, "duplicate chat.send collapsed");
        let status = if state.runs.lock().is_active(&run_id) {
            "active"
        } else {
            "finished"
        };
        return Ok(json!({
            "runId": run_id,
            "status": status,
            "deduplicated": true,
        }));
    }

    let outcome = {
        let mut runs = state.runs.lock();
        let outcome = runs.register(&run_id, &session_key);
        if matches!(outcome, RegisterOutcome::Created(_)) {
            state.dedupe.remember(&idempotency_key);
        }
        outcome
    };

    match outcome {
        RegisterOutcome::Created(_token) => {
            broadcast_event(
                state,
                "chat.run",
                json!({
                    "runId": run_id,
                    "sessionKey": session_key,
                    "status": ChatRunStatus::Pending.as_str(),
                }),
                &BroadcastOpts::for_session(&session_key),
            );
            Ok(json!({
                "runId": run_id,
                "status": ChatRunStatus::Pending.as_str(),
                "deduplicated": false,
            }))
        }
        RegisterOutcome::DuplicateActive => Ok(json!({
            "runId": run_id,
            "status": "active",
            "deduplicated": true,
        })),
        RegisterOutcome::RecentlyAborted => Ok(json!({
            "runId": run_id,
            "status": ChatRunStatus::Aborted.as_str(),
            "deduplicated": true,
        })),
    }
}

async fn handle_chat_abort(params: Option<Value>, ctx: RequestContext) -> Result<Value, ErrorShape> {
    let run_id = require_str(params.as_ref(), "runId")?;
    let state = &ctx.state;

    let (aborted, already, session_key) = {
        let mut runs = state.runs.lock();
        let session_key = runs.session_key(&run_id).map(String::from);
        match runs.abort(&run_id, ChatRunStatus::Aborted) {
            Some(_) => (true, false, session_key),
            None if runs.was_recently_aborted(&run_id) => (true, true, session_key),
            None => (false, false, session_key),
        }
    };

    if !aborted {
        return Err(error_shape(
            ERROR_INVALID_REQUEST,
            format!("unknown run: {run_id}"),
            None,
        ));
    }

    if !already {
        let opts = match session_key.as_deref() {
            Some(key) => BroadcastOpts::for_session(key),
            None => BroadcastOpts::default(),
        };
        broadcast_event(
            state,
            "chat.run",
            json!({"runId": run_id, "status": ChatRunStatus::Aborted.as_str()}),
            &opts,
        );
    }
    Ok(json!({"runId": run_id, "aborted": true}))
}

async fn handle_subscribe(params: Option<Value>, ctx: RequestContext) -> Result<Value, ErrorShape> {
    update_subscription(params, ctx, true).await
}

async fn handle_unsubscribe(params: Option<Value>, ctx: RequestContext) -> Result<Value, ErrorShape> {
    update_subscription(params, ctx, false).await
}

async fn update_subscription(
    params: Option<Value>,
    ctx: RequestContext,
    subscribe: bool,
) -> Result<Value, ErrorShape> {
    let node_id = match &ctx.caller {
        Caller::Node { node_id } => node_id.clone(),
        Caller::Primary => {
            return Err(error_shape(
                ERROR_INVALID_REQUEST,
                "subscribe/unsubscribe are bridge-node methods",
                None,
            ));
        }
    };
    let session_key = require_str(params.as_ref(), "sessionKey")?;

    let mut nodes = ctx.state.nodes.lock();
    let node = nodes.get_mut(&node_id).ok_or_else(|| {
        warn!(target: "bridge", node_id = %node_id, "subscription change for unknown node");
        error_shape(ERROR_UNAVAILABLE, "node session gone", None)
    })?;
    if subscribe {
        node.subscriptions.insert(session_key.clone());
    } else {
        node.subscriptions.remove(&session_key);
    }
    Ok(json!({
        "sessionKey": session_key,
        "subscribed": subscribe,
        "subscriptions": node.subscriptions.len(),
    }))
}
