//! Wire frame codec for the gateway protocol.
//!
//! Four frame kinds cross the wire, all as JSON text messages:
//! connect (a `req` whose method is `connect`), request (`req`),
//! response (`res`), and event (`event`). Everything else the gateway
//! tracks is derived from these.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Protocol version spoken by this server. Clients declare a
/// `[minProtocol, maxProtocol]` window; if this version falls outside the
/// window the handshake fails with a protocol-mismatch close.
pub const PROTOCOL_VERSION: u32 = 3;

/// Maximum accepted inbound frame size.
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;

/// Outbound buffered bytes above which a connection counts as a slow
/// consumer (1.5 MiB).
pub const MAX_BUFFERED_BYTES: usize = (1024 * 1024 * 3) / 2;

/// Interval between `tick` broadcasts.
pub const TICK_INTERVAL_MS: u64 = 30_000;

/// Time a fresh connection has to deliver a valid connect request.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// WebSocket close frames cap the reason at 123 bytes; anything longer is
/// truncated before it reaches the wire.
pub const MAX_CLOSE_REASON_CHARS: usize = 123;

pub const ERROR_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const ERROR_UNAUTHORIZED: &str = "UNAUTHORIZED";
pub const ERROR_UNAVAILABLE: &str = "UNAVAILABLE";
pub const ERROR_TIMEOUT: &str = "TIMEOUT";

/// Why a connection was (or is being) closed. Logged on every teardown so
/// benign probes can be told apart from real failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    Normal,
    ProtocolMismatch,
    Unauthorized,
    SlowConsumer,
    InvalidHandshake,
    HandshakeTimeout,
    ServiceRestart,
}

impl CloseCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseCause::Normal => "normal",
            CloseCause::ProtocolMismatch => "protocol-mismatch",
            CloseCause::Unauthorized => "unauthorized",
            CloseCause::SlowConsumer => "slow-consumer",
            CloseCause::InvalidHandshake => "invalid-handshake",
            CloseCause::HandshakeTimeout => "handshake-timeout",
            CloseCause::ServiceRestart => "service-restart",
        }
    }

    /// Map the semantic cause onto a WebSocket close code.
    pub fn close_code(&self) -> u16 {
        match self {
            CloseCause::Normal => 1000,
            CloseCause::ProtocolMismatch => 1002,
            CloseCause::Unauthorized
            | CloseCause::SlowConsumer
            | CloseCause::InvalidHandshake
            | CloseCause::HandshakeTimeout => 1008,
            CloseCause::ServiceRestart => 1012,
        }
    }
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error surfaced to callers in response frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub fn error_shape(code: &str, message: impl Into<String>, details: Option<Value>) -> ErrorShape {
    ErrorShape {
        code: code.to_string(),
        message: message.into(),
        retryable: code == ERROR_UNAVAILABLE,
        details,
    }
}

/// Client descriptor presented during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Credentials presented in the connect request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Parameters of the mandatory first request (`method: "connect"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthPayload>,
}

/// A parsed inbound request frame.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    pub params: Option<Value>,
}

/// Parse and shape-check a `req` frame.
///
/// The frame must be an object with `type: "req"`, a non-empty string `id`,
/// and a non-empty string `method`. `params` is passed through untouched.
pub fn parse_request_frame(value: &Value) -> Result<RequestFrame, ErrorShape> {
    let obj = value
        .as_object()
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "frame must be an object", None))?;

    let frame_type = obj.get("type").and_then(|v| v.as_str()).unwrap_or("");
    if frame_type != "req" {
        return Err(error_shape(
            ERROR_INVALID_REQUEST,
            format!("unsupported frame type: {:?}", frame_type),
            None,
        ));
    }

    let id = obj
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "missing request id", None))?;

    let method = obj
        .get("method")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "missing method", None))?;

    Ok(RequestFrame {
        id: id.to_string(),
        method: method.to_string(),
        params: obj.get("params").cloned(),
    })
}

/// Parse the `params` of a connect request into [`ConnectParams`].
pub fn parse_connect_params(params: Option<&Value>) -> Result<ConnectParams, ErrorShape> {
    let params = params
        .ok_or_else(|| error_shape(ERROR_INVALID_REQUEST, "connect requires params", None))?;
    serde_json::from_value(params.clone())
        .map_err(|e| error_shape(ERROR_INVALID_REQUEST, format!("invalid connect params: {e}"), None))
}

/// Build a success response frame. The request id is echoed verbatim.
pub fn response_ok(id: &str, payload: Value) -> Value {
    json!({
        "type": "res",
        "id": id,
        "ok": true,
        "payload": payload,
    })
}

/// Build an error response frame. The request id is echoed verbatim.
pub fn response_err(id: &str, error: &ErrorShape) -> Value {
    json!({
        "type": "res",
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Build an event frame. `seq` is the connection-global sequence number;
/// `state_version` is attached when the event carries versioned state.
pub fn event_frame(event: &str, payload: &Value, seq: u64, state_version: Option<&Value>) -> Value {
    let mut frame = json!({
        "type": "event",
        "event": event,
        "payload": payload,
        "seq": seq,
    });
    if let Some(sv) = state_version {
        frame["stateVersion"] = sv.clone();
    }
    frame
}

/// Truncate a close reason so it fits in a close frame.
pub fn truncate_close_reason(reason: &str) -> Cow<'_, str> {
    if reason.chars().count() <= MAX_CLOSE_REASON_CHARS {
        Cow::Borrowed(reason)
    } else {
        Cow::Owned(reason.chars().take(MAX_CLOSE_REASON_CHARS).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_shape_retryable_only_for_unavailable() {
        let err = error_shape(ERROR_INVALID_REQUEST, "bad", None);
        assert_eq!(err.code, "INVALID_REQUEST");
        assert!(!err.retryable);

        let err = error_shape(ERROR_UNAVAILABLE, "busy", Some(json!({"hint": 1})));
        assert!(err.retryable);
        assert!(err.details.is_some());
    }

    #[test]
    fn test_parse_request_frame_valid() {
        let frame = json!({"type": "req", "id": "r1", "method": "ping", "params": {"a": 1}});
        let req = parse_request_frame(&frame).unwrap();
        assert_eq!(req.id, "r1");
        assert_eq!(req.method, "ping");
        assert_eq!(req.params, Some(json!({"a": 1})));
    }

    #[test]
    fn test_parse_request_frame_rejects_wrong_type() {
        let frame = json!({"type": "event", "id": "r1", "method": "ping"});
        let err = parse_request_frame(&frame).unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_REQUEST);
    }

    #[test]
    fn test_parse_request_frame_rejects_missing_id_or_method() {
        let err = parse_request_frame(&json!({"type": "req", "method": "ping"})).unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_REQUEST);
        assert!(err.message.contains("id"));

        let err = parse_request_frame(&json!({"type": "req", "id": "r1", "method": ""})).unwrap_err();
        assert!(err.message.contains("method"));
    }

    #[test]
    fn test_parse_request_frame_rejects_non_object() {
        assert!(parse_request_frame(&json!("req")).is_err());
        assert!(parse_request_frame(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_parse_connect_params_camel_case() {
        let params = json!({
            "minProtocol": 1,
            "maxProtocol": 3,
            "client": {"id": "cli-1", "version": "1.0", "platform": "linux", "mode": "cli"},
            "auth": {"token": "t"}
        });
        let connect = parse_connect_params(Some(&params)).unwrap();
        assert_eq!(connect.min_protocol, 1);
        assert_eq!(connect.max_protocol, 3);
        assert_eq!(connect.client.id, "cli-1");
        assert_eq!(connect.auth.unwrap().token.as_deref(), Some("t"));
    }

    #[test]
    fn test_parse_connect_params_missing() {
        let err = parse_connect_params(None).unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_REQUEST);
    }

    #[test]
    fn test_response_frames_echo_id() {
        let ok = response_ok("abc", json!({"x": 1}));
        assert_eq!(ok["id"], "abc");
        assert_eq!(ok["ok"], true);
        assert_eq!(ok["payload"]["x"], 1);

        let err = response_err("abc", &error_shape(ERROR_UNAUTHORIZED, "unauthorized", None));
        assert_eq!(err["id"], "abc");
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"]["code"], "UNAUTHORIZED");
    }

    #[test]
    fn test_event_frame_state_version_optional() {
        let payload = json!({"n": 1});
        let frame = event_frame("tick", &payload, 7, None);
        assert_eq!(frame["seq"], 7);
        assert!(frame.get("stateVersion").is_none());

        let sv = json!({"presence": 2, "health": 1});
        let frame = event_frame("presence", &payload, 8, Some(&sv));
        assert_eq!(frame["stateVersion"]["presence"], 2);
    }

    #[test]
    fn test_truncate_close_reason() {
        let short = "protocol mismatch";
        assert_eq!(truncate_close_reason(short), short);

        let long = "x".repeat(500);
        let truncated = truncate_close_reason(&long);
        assert_eq!(truncated.chars().count(), MAX_CLOSE_REASON_CHARS);
    }

    #[test]
    fn test_close_cause_codes() {
        assert_eq!(CloseCause::Normal.close_code(), 1000);
        assert_eq!(CloseCause::ProtocolMismatch.close_code(), 1002);
        assert_eq!(CloseCause::Unauthorized.close_code(), 1008);
        assert_eq!(CloseCause::SlowConsumer.close_code(), 1008);
        assert_eq!(CloseCause::HandshakeTimeout.close_code(), 1008);
        assert_eq!(CloseCause::ServiceRestart.close_code(), 1012);
        assert_eq!(CloseCause::SlowConsumer.as_str(), "slow-consumer");
    }
}
