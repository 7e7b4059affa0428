//! Downstream MCP Server: the single logical MCP server presented to
//! clients. Validates JSON-RPC grammar, answers `initialize` and
//! `get_capabilities` locally, forwards everything else via the Router.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::codes;
use crate::rpc::{self, RpcId};
use crate::router::Router;

pub struct DownstreamServer {
    router: Arc<Router>,
}

impl DownstreamServer {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Parses and handles one raw JSON-RPC frame. Returns `None` for
    /// notifications, which carry no reply.
    pub async fn handle_message(&self, raw: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.handle_value(value).await,
            Err(_) => Some(rpc::error_value(RpcId::Null, codes::PARSE_ERROR, "parse error", None)),
        }
    }

    pub async fn handle_value(&self, value: Value) -> Option<Value> {
        if let Err((code, message)) = rpc::validate_request_grammar(&value) {
            let id = extract_id(&value).unwrap_or(RpcId::Null);
            return Some(rpc::error_value(id, code, message, None));
        }

        let method = value["method"].as_str().unwrap_or_default().to_string();
        let params = value.get("params").cloned();

        let Some(id) = extract_id(&value) else {
            tracing::debug!("ignoring downstream notification: {method}");
            return None;
        };

        let result = self.handle_request(&method, params).await;
        Some(match result {
            Ok(value) => rpc::response_value(id, Ok(value)),
            Err(e) => {
                let (code, message, data) = e.to_jsonrpc();
                rpc::error_value(id, code, message, data)
            }
        })
    }

    async fn handle_request(&self, method: &str, params: Option<Value>) -> crate::error::Result<Value> {
        match method {
            "initialize" => Ok(self.initialize_result()),
            "get_capabilities" => Ok(json!({ "capabilities": self.router.capability_union() })),
            _ => self.router.dispatch(method, params).await,
        }
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": { "name": "atrax", "version": env!("CARGO_PKG_VERSION") },
            "capabilities": self.router.capability_union(),
        })
    }
}

fn extract_id(value: &Value) -> Option<RpcId> {
    let id = value.get("id")?;
    if id.is_null() {
        return None;
    }
    serde_json::from_value(id.clone()).ok()
}
