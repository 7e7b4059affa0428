//! Upstream Session: turns a Transport into a typed JSON-RPC peer with
//! request correlation, timeouts, and capability state.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{AtraxError, Result};
use crate::rpc::{self, Classified, RpcId, RpcNotification, RpcRequest};
use crate::transport::Transport;

/// Default handshake deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Protocol violations tolerated before a session is marked Degraded.
const PROTOCOL_VIOLATION_THRESHOLD: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Starting,
    Initializing,
    Ready,
    Degraded,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    pub fn list_method(&self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tools/list",
            CapabilityKind::Resource => "resources/list",
            CapabilityKind::Prompt => "prompts/list",
        }
    }

    pub fn list_changed_notification(&self) -> &'static str {
        match self {
            CapabilityKind::Tool => "notifications/tools/list_changed",
            CapabilityKind::Resource => "notifications/resources/list_changed",
            CapabilityKind::Prompt => "notifications/prompts/list_changed",
        }
    }

    fn result_array_key(&self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tools",
            CapabilityKind::Resource => "resources",
            CapabilityKind::Prompt => "prompts",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKind::Tool => write!(f, "tool"),
            CapabilityKind::Resource => write!(f, "resource"),
            CapabilityKind::Prompt => write!(f, "prompt"),
        }
    }
}

/// A session's declared capability set, as raw descriptor objects. The
/// proxy is semantically transparent, so descriptors pass through verbatim
/// except for the name rewriting the Merger applies.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub prompts: Vec<Value>,
}

impl Capabilities {
    fn kind_mut(&mut self, kind: CapabilityKind) -> &mut Vec<Value> {
        match kind {
            CapabilityKind::Tool => &mut self.tools,
            CapabilityKind::Resource => &mut self.resources,
            CapabilityKind::Prompt => &mut self.prompts,
        }
    }

    pub fn kind(&self, kind: CapabilityKind) -> &[Value] {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        }
    }
}

/// Events a session emits for the Router/Merger to consume.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Ready { capabilities: Arc<Capabilities> },
    Lost { reason: String },
    CapabilitiesChanged { kind: CapabilityKind, capabilities: Arc<Capabilities> },
    /// An upstream-originated request (server→client); rare (e.g. sampling).
    ServerRequest { id: RpcId, method: String, params: Option<Value> },
    /// Any notification not already handled as a list-changed signal.
    Notification { method: String, params: Option<Value> },
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value>>>;

/// Wraps one [`Transport`] as a correlated JSON-RPC peer.
pub struct UpstreamSession {
    pub name: String,
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    state: ArcSwap<SessionState>,
    capabilities: ArcSwap<Capabilities>,
    next_id: AtomicU64,
    pending: Mutex<PendingMap>,
    cancellation: CancellationToken,
    events: broadcast::Sender<SessionEvent>,
    protocol_violations: AtomicU64,
    handshake_timeout: Duration,
    request_timeout: Duration,
}

impl UpstreamSession {
    pub fn new(config: ServerConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            name: config.name.clone(),
            config,
            transport,
            state: ArcSwap::from_pointee(SessionState::Created),
            capabilities: ArcSwap::from_pointee(Capabilities::default()),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            cancellation: CancellationToken::new(),
            events,
            protocol_violations: AtomicU64::new(0),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn state(&self) -> SessionState {
        **self.state.load()
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(Arc::new(state));
    }

    pub fn capabilities(&self) -> Arc<Capabilities> {
        self.capabilities.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Opens the transport, runs the read loop, and completes the MCP
    /// handshake. On success the session is Ready; on failure it is
    /// Degraded and the error is returned for the Supervisor to act on.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.set_state(SessionState::Starting);

        if let Err(e) = self.transport.open().await {
            self.set_state(SessionState::Degraded);
            return Err(e);
        }

        let msg_stream = self.transport.receive_stream();
        let state_stream = self.transport.state_stream();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_read_loop(msg_stream, state_stream).await;
        });

        self.set_state(SessionState::Initializing);

        if let Err(e) = self.handshake().await {
            self.set_state(SessionState::Degraded);
            return Err(e);
        }

        Ok(())
    }

    async fn handshake(self: &Arc<Self>) -> Result<()> {
        let init_params = serde_json::json!({
            "protocolVersion": "2024-11-05",
            "clientInfo": { "name": "atrax", "version": env!("CARGO_PKG_VERSION") },
            "capabilities": {},
        });
        self.request_with_timeout("initialize", Some(init_params), self.handshake_timeout)
            .await
            .map_err(|e| AtraxError::HandshakeFailed(e.to_string()))?;

        let declared = self
            .request_with_timeout("get_capabilities", None, self.handshake_timeout)
            .await
            .ok();

        let mut capabilities = Capabilities::default();
        for kind in [CapabilityKind::Tool, CapabilityKind::Resource, CapabilityKind::Prompt] {
            if !declared_supports(&declared, kind) {
                continue;
            }
            match self.list_kind(kind).await {
                Ok(entries) => *capabilities.kind_mut(kind) = entries,
                Err(e) => {
                    tracing::debug!(session = %self.name, kind = %kind, "listing capability failed: {e}");
                }
            }
        }

        self.capabilities.store(Arc::new(capabilities.clone()));
        self.set_state(SessionState::Ready);
        let _ = self.events.send(SessionEvent::Ready {
            capabilities: Arc::new(capabilities),
        });
        Ok(())
    }

    async fn list_kind(self: &Arc<Self>, kind: CapabilityKind) -> Result<Vec<Value>> {
        let result = self
            .request_with_timeout(kind.list_method(), None, self.request_timeout)
            .await?;
        Ok(result
            .get(kind.result_array_key())
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn relist_kind(self: Arc<Self>, kind: CapabilityKind) {
        let entries = match self.list_kind(kind).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(session = %self.name, kind = %kind, "re-list failed: {e}");
                return;
            }
        };

        let mut capabilities = (*self.capabilities.load_full()).clone();
        *capabilities.kind_mut(kind) = entries;
        let capabilities = Arc::new(capabilities);
        self.capabilities.store(capabilities.clone());
        let _ = self.events.send(SessionEvent::CapabilitiesChanged { kind, capabilities });
    }

    /// Issues a correlated request with the session's default timeout.
    pub async fn request(self: &Arc<Self>, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with_timeout(method, params, self.request_timeout).await
    }

    pub async fn request_with_timeout(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.state() == SessionState::Stopped {
            return Err(AtraxError::SessionDown(self.name.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        // Register before sending: a response can never arrive before we're
        // enrolled to receive it.
        self.pending.lock().insert(id, tx);

        let request = RpcRequest::new(id, method, params);
        if let Err(e) = self.transport.send(request.to_value()).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AtraxError::SessionDown(self.name.clone())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(AtraxError::Timeout(timeout))
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = RpcNotification::new(method, params);
        self.transport.send(notification.to_value()).await
    }

    /// Resolves an upstream-originated request id with our reply, forwarding
    /// it back to the transport unmodified.
    pub async fn reply_to_server_request(&self, id: RpcId, result: std::result::Result<Value, (i64, String, Option<Value>)>) -> Result<()> {
        let value = match result {
            Ok(result) => rpc::response_value(id, Ok(result)),
            Err((code, message, data)) => rpc::error_value(id, code, message, data),
        };
        self.transport.send(value).await
    }

    /// Marks this session Degraded outside of the normal transport-lost
    /// path, e.g. when the Merger rejects one of its capabilities under the
    /// Reject conflict strategy. Unlike `handle_transport_lost`, this does
    /// not emit `SessionEvent::Lost`: the transport is still healthy and the
    /// session's non-conflicting entries stay published, so there is
    /// nothing for the Supervisor to restart or the Merger to evict.
    pub fn mark_degraded(self: &Arc<Self>, reason: impl Into<String>) {
        if matches!(self.state(), SessionState::Stopped | SessionState::Degraded) {
            return;
        }
        tracing::warn!(session = %self.name, "{}", reason.into());
        self.set_state(SessionState::Degraded);
    }

    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        self.set_state(SessionState::Stopped);
        self.cancellation.cancel();

        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(AtraxError::SessionDown(self.name.clone())));
        }

        self.transport.close().await
    }

    async fn run_read_loop(
        self: Arc<Self>,
        mut msg_stream: crate::transport::MessageStream,
        mut state_stream: crate::transport::EventStream,
    ) {
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => break,
                maybe_msg = msg_stream.next() => {
                    match maybe_msg {
                        Some(value) => self.handle_inbound(value),
                        None => {
                            self.handle_transport_lost("inbound stream ended".to_string());
                            break;
                        }
                    }
                }
                maybe_event = state_stream.next() => {
                    match maybe_event {
                        Some(crate::transport::TransportEvent::Opened) => {}
                        Some(crate::transport::TransportEvent::Closed(reason)) => {
                            self.handle_transport_lost(reason);
                            break;
                        }
                        Some(crate::transport::TransportEvent::Error(reason)) => {
                            self.handle_transport_lost(reason);
                            break;
                        }
                        None => {}
                    }
                }
            }
        }
    }

    fn handle_transport_lost(self: &Arc<Self>, reason: String) {
        if self.state() == SessionState::Stopped {
            return;
        }
        self.set_state(SessionState::Degraded);
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(AtraxError::SessionDown(self.name.clone())));
        }
        let _ = self.events.send(SessionEvent::Lost { reason });
    }

    fn handle_inbound(self: &Arc<Self>, value: Value) {
        match rpc::classify(&value) {
            Classified::Response { id, result } => self.handle_response(id, result),
            Classified::Request { id, method, params } => {
                let _ = self.events.send(SessionEvent::ServerRequest { id, method, params });
            }
            Classified::Notification { method, params } => self.handle_notification(method, params),
            Classified::Invalid => {
                let count = self.protocol_violations.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(session = %self.name, "protocol violation: malformed message from upstream");
                if count >= PROTOCOL_VIOLATION_THRESHOLD {
                    self.set_state(SessionState::Degraded);
                }
            }
        }
    }

    fn handle_response(self: &Arc<Self>, id: RpcId, result: std::result::Result<Value, rpc::RpcErrorObject>) {
        let RpcId::Number(n) = id else {
            tracing::warn!(session = %self.name, "protocol violation: response with non-numeric id");
            return;
        };
        let key = n as u64;
        let sender = self.pending.lock().remove(&key);
        match sender {
            Some(tx) => {
                let mapped = result.map_err(|e| AtraxError::UpstreamError {
                    code: e.code,
                    message: e.message,
                    data: e.data,
                });
                let _ = tx.send(mapped);
            }
            None => {
                tracing::debug!(session = %self.name, id = key, "dropping response for unknown or already-resolved id");
            }
        }
    }

    fn handle_notification(self: &Arc<Self>, method: String, params: Option<Value>) {
        for kind in [CapabilityKind::Tool, CapabilityKind::Resource, CapabilityKind::Prompt] {
            if method == kind.list_changed_notification() {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.relist_kind(kind).await });
                return;
            }
        }
        let _ = self.events.send(SessionEvent::Notification { method, params });
    }
}

fn declared_supports(declared: &Option<Value>, kind: CapabilityKind) -> bool {
    let Some(declared) = declared else {
        // No get_capabilities support reported: try anyway and tolerate failure.
        return true;
    };
    let caps = declared.get("capabilities").unwrap_or(declared);
    match caps.get(kind.result_array_key()) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Object(_)) => true,
        Some(Value::Null) | None => true,
        _ => true,
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
