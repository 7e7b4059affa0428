//! JSON-RPC 2.0 message shapes and classification.
//!
//! The proxy never defines its own wire format: every message that crosses a
//! Transport or the downstream listener is a `serde_json::Value` conforming
//! to JSON-RPC 2.0. This module only adds the minimum structure needed to
//! classify a message and to build responses/errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::codes;

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC id: either a number or a string. `Null` covers notifications
/// that carry an explicit `"id": null`, which some peers emit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    String(String),
    Null,
}

impl From<u64> for RpcId {
    fn from(n: u64) -> Self {
        RpcId::Number(n as i64)
    }
}

#[derive(Debug, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: RpcId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: impl Into<RpcId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("RpcRequest always serializes")
    }
}

#[derive(Debug, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("RpcNotification always serializes")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Builds a JSON-RPC response object, success or failure, as a raw `Value`.
pub fn response_value(id: RpcId, result: std::result::Result<Value, RpcErrorObject>) -> Value {
    match result {
        Ok(result) => serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "result": result,
        }),
        Err(err) => serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": err,
        }),
    }
}

pub fn error_value(id: RpcId, code: i64, message: impl Into<String>, data: Option<Value>) -> Value {
    response_value(
        id,
        Err(RpcErrorObject {
            code,
            message: message.into(),
            data,
        }),
    )
}

/// The three classes of message a JSON-RPC 2.0 peer may receive, derived
/// purely from which fields are present.
#[derive(Debug)]
pub enum Classified {
    /// Has `id` and (`result` xor `error`): a reply to something we sent.
    Response {
        id: RpcId,
        result: std::result::Result<Value, RpcErrorObject>,
    },
    /// Has `method` and `id`: a server-initiated (upstream-originated) call.
    Request {
        id: RpcId,
        method: String,
        params: Option<Value>,
    },
    /// Has `method`, no `id`: fire-and-forget.
    Notification { method: String, params: Option<Value> },
    /// Doesn't fit the JSON-RPC 2.0 shape at all.
    Invalid,
}

/// Classifies one inbound JSON value: presence of `id`/`method`/`result`/
/// `error` determines the message kind. This never
/// fails; malformed input simply classifies as `Invalid` so the caller can
/// log-and-drop rather than propagate a parse error for a message with no
/// id to attach one to.
pub fn classify(value: &Value) -> Classified {
    let obj = match value.as_object() {
        Some(o) => o,
        None => return Classified::Invalid,
    };

    let id = obj.get("id");
    let method = obj.get("method").and_then(Value::as_str);
    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");

    if let Some(method) = method {
        let params = obj.get("params").cloned();
        return match id {
            Some(id) => match serde_json::from_value::<RpcId>(id.clone()) {
                Ok(id) => Classified::Request {
                    id,
                    method: method.to_string(),
                    params,
                },
                Err(_) => Classified::Invalid,
            },
            None => Classified::Notification {
                method: method.to_string(),
                params,
            },
        };
    }

    if has_result || has_error {
        let id = match id.and_then(|v| serde_json::from_value::<RpcId>(v.clone()).ok()) {
            Some(id) => id,
            None => return Classified::Invalid,
        };
        let result = if has_error {
            match serde_json::from_value::<RpcErrorObject>(obj["error"].clone()) {
                Ok(e) => Err(e),
                Err(_) => return Classified::Invalid,
            }
        } else {
            Ok(obj.get("result").cloned().unwrap_or(Value::Null))
        };
        return Classified::Response { id, result };
    }

    Classified::Invalid
}

/// Validates the coarse JSON-RPC 2.0 grammar of a downstream request before
/// it's allowed into the Router: must be an object, `jsonrpc: "2.0"`, and
/// carry a `method`. Returns the JSON-RPC error code to report on failure.
pub fn validate_request_grammar(value: &Value) -> std::result::Result<(), (i64, String)> {
    let obj = value
        .as_object()
        .ok_or_else(|| (codes::INVALID_REQUEST, "request must be a JSON object".to_string()))?;

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        _ => {
            return Err((
                codes::INVALID_REQUEST,
                "missing or invalid \"jsonrpc\" field".to_string(),
            ))
        }
    }

    if obj.get("method").and_then(Value::as_str).is_none() {
        return Err((codes::INVALID_REQUEST, "missing \"method\" field".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_response_with_result() {
        let v = serde_json::json!({"jsonrpc":"2.0","id":1,"result":{"ok":true}});
        match classify(&v) {
            Classified::Response { id, result } => {
                assert_eq!(id, RpcId::Number(1));
                assert!(result.is_ok());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_response_with_error() {
        let v = serde_json::json!({"jsonrpc":"2.0","id":"a","error":{"code":-32601,"message":"nope"}});
        match classify(&v) {
            Classified::Response { id, result } => {
                assert_eq!(id, RpcId::String("a".into()));
                assert_eq!(result.unwrap_err().code, -32601);
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_notification() {
        let v = serde_json::json!({"jsonrpc":"2.0","method":"notifications/tools/list_changed"});
        match classify(&v) {
            Classified::Notification { method, .. } => {
                assert_eq!(method, "notifications/tools/list_changed");
            }
            other => panic!("expected Notification, got {other:?}"),
        }
    }

    #[test]
    fn classifies_server_request() {
        let v = serde_json::json!({"jsonrpc":"2.0","id":7,"method":"sampling/createMessage"});
        match classify(&v) {
            Classified::Request { id, method, .. } => {
                assert_eq!(id, RpcId::Number(7));
                assert_eq!(method, "sampling/createMessage");
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn classifies_garbage_as_invalid() {
        assert!(matches!(classify(&serde_json::json!([1, 2, 3])), Classified::Invalid));
        assert!(matches!(classify(&serde_json::json!({"foo":"bar"})), Classified::Invalid));
    }

    #[test]
    fn grammar_rejects_missing_jsonrpc_field() {
        let v = serde_json::json!({"id":1,"method":"initialize"});
        assert!(validate_request_grammar(&v).is_err());
    }

    #[test]
    fn grammar_accepts_well_formed_request() {
        let v = serde_json::json!({"jsonrpc":"2.0","id":1,"method":"initialize"});
        assert!(validate_request_grammar(&v).is_ok());
    }
}
