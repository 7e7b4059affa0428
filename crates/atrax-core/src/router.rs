//! Registry / Router: owns all Upstream Sessions, launches and supervises
//! them, and dispatches downstream requests via the Merger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::config::{ConflictStrategy, ServerConfig, TransportConfig};
use crate::error::{AtraxError, Result};
use crate::merger::Merger;
use crate::rpc::RpcId;
use crate::session::{CapabilityKind, SessionEvent, UpstreamSession};
use crate::supervisor::Supervisor;
use crate::transport::docker::DockerTransport;
use crate::transport::http::HttpTransport;
use crate::transport::stdio::StdioTransport;
use crate::transport::Transport;

/// Events the ambient downstream listener may surface to connected clients.
/// The core only guarantees these are never dropped silently; how (or
/// whether) a given downstream transport can push them is up to that
/// transport.
#[derive(Debug, Clone)]
pub enum DownstreamEvent {
    ListChanged(CapabilityKind),
    ServerRequest {
        downstream_id: u64,
        session_name: String,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

pub struct Router {
    sessions: RwLock<IndexMap<String, Arc<UpstreamSession>>>,
    merger: Arc<Merger>,
    supervisor: Arc<Supervisor>,
    downstream_events: broadcast::Sender<DownstreamEvent>,
    pending_server_requests: Mutex<HashMap<u64, (String, RpcId)>>,
    next_downstream_id: AtomicU64,
}

impl Router {
    pub fn new(configs: Vec<ServerConfig>, conflict_strategy: ConflictStrategy) -> Result<Arc<Self>> {
        let mut sessions = IndexMap::new();
        for config in configs {
            let transport = build_transport(&config)?;
            let name = config.name.clone();
            sessions.insert(name, Arc::new(UpstreamSession::new(config, transport)));
        }
        let (downstream_events, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            sessions: RwLock::new(sessions),
            merger: Arc::new(Merger::new(conflict_strategy)),
            supervisor: Arc::new(Supervisor::new()),
            downstream_events,
            pending_server_requests: Mutex::new(HashMap::new()),
            next_downstream_id: AtomicU64::new(1),
        }))
    }

    /// Builds a Router from already-constructed sessions, bypassing the
    /// config-driven transport factory. Used by tests to drive the Router
    /// against an in-memory fake transport.
    pub fn with_sessions(sessions: Vec<(ServerConfig, Arc<dyn Transport>)>, conflict_strategy: ConflictStrategy) -> Arc<Self> {
        let mut map = IndexMap::new();
        for (config, transport) in sessions {
            let name = config.name.clone();
            map.insert(name, Arc::new(UpstreamSession::new(config, transport)));
        }
        let (downstream_events, _) = broadcast::channel(256);
        Arc::new(Self {
            sessions: RwLock::new(map),
            merger: Arc::new(Merger::new(conflict_strategy)),
            supervisor: Arc::new(Supervisor::new()),
            downstream_events,
            pending_server_requests: Mutex::new(HashMap::new()),
            next_downstream_id: AtomicU64::new(1),
        })
    }

    /// Starts every session concurrently. Startup completion is not gated
    /// on individual sessions succeeding; a failed session is left for the
    /// Supervisor to retry.
    pub async fn start_all(self: &Arc<Self>) {
        let sessions: Vec<Arc<UpstreamSession>> = self.sessions.read().values().cloned().collect();
        let mut handles = Vec::with_capacity(sessions.len());
        for session in sessions {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                this.spawn_watcher(session.clone());
                if let Err(e) = session.start().await {
                    tracing::warn!(session = %session.name, "initial start failed: {e}");
                    this.trigger_restart(session.name.clone());
                }
            }));
        }
        futures::future::join_all(handles).await;
    }

    pub async fn stop_all(self: &Arc<Self>) {
        let sessions: Vec<Arc<UpstreamSession>> = self.sessions.read().values().cloned().collect();
        let stops = sessions.into_iter().map(|s| async move {
            if let Err(e) = s.stop().await {
                tracing::warn!(session = %s.name, "error stopping session: {e}");
            }
        });
        futures::future::join_all(stops).await;
    }

    fn spawn_watcher(self: &Arc<Self>, session: Arc<UpstreamSession>) {
        let mut events = session.subscribe();
        let this = Arc::clone(self);
        let name = session.name.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                this.handle_session_event(&name, event).await;
            }
        });
    }

    async fn handle_session_event(self: &Arc<Self>, session_name: &str, event: SessionEvent) {
        match event {
            SessionEvent::Ready { capabilities } => {
                let rejected = self.merger.update_session(session_name, capabilities.clone());
                for kind in [CapabilityKind::Tool, CapabilityKind::Resource, CapabilityKind::Prompt] {
                    if !capabilities.kind(kind).is_empty() {
                        let _ = self.downstream_events.send(DownstreamEvent::ListChanged(kind));
                    }
                }
                self.degrade_rejected(&rejected);
            }
            SessionEvent::CapabilitiesChanged { kind, capabilities } => {
                let rejected = self.merger.update_session(session_name, capabilities);
                let _ = self.downstream_events.send(DownstreamEvent::ListChanged(kind));
                self.degrade_rejected(&rejected);
            }
            SessionEvent::Lost { reason } => {
                let affected: Vec<CapabilityKind> = self
                    .sessions
                    .read()
                    .get(session_name)
                    .map(|s| {
                        let caps = s.capabilities();
                        [CapabilityKind::Tool, CapabilityKind::Resource, CapabilityKind::Prompt]
                            .into_iter()
                            .filter(|&k| !caps.kind(k).is_empty())
                            .collect()
                    })
                    .unwrap_or_default();

                self.merger.remove_session(session_name);
                for kind in affected {
                    let _ = self.downstream_events.send(DownstreamEvent::ListChanged(kind));
                }
                tracing::warn!(session = %session_name, "session lost: {reason}");
                self.trigger_restart(session_name.to_string());
            }
            SessionEvent::ServerRequest { id, method, params } => {
                let downstream_id = self.next_downstream_id.fetch_add(1, Ordering::Relaxed);
                self.pending_server_requests
                    .lock()
                    .insert(downstream_id, (session_name.to_string(), id));
                let _ = self.downstream_events.send(DownstreamEvent::ServerRequest {
                    downstream_id,
                    session_name: session_name.to_string(),
                    method,
                    params,
                });
            }
            SessionEvent::Notification { method, params } => {
                let _ = self.downstream_events.send(DownstreamEvent::Notification { method, params });
            }
        }
    }

    /// Marks sessions the Merger rejected this rebuild (Reject strategy)
    /// Degraded. Their non-conflicting entries remain published; only the
    /// conflicting names were omitted by `build_index`.
    fn degrade_rejected(self: &Arc<Self>, rejected: &[String]) {
        for name in rejected {
            if let Some(session) = self.sessions.read().get(name).cloned() {
                session.mark_degraded("name conflict rejected under Reject conflict strategy");
            }
        }
    }

    fn trigger_restart(self: &Arc<Self>, name: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.restart_loop(name).await });
    }

    async fn restart_loop(self: &Arc<Self>, name: String) {
        loop {
            let delay = match self.supervisor.record_failure(&name) {
                Some(delay) => delay,
                None => {
                    tracing::warn!(session = %name, "quarantined after repeated restart failures");
                    return;
                }
            };
            tokio::time::sleep(delay).await;

            let config = self.sessions.read().get(&name).map(|s| s.config().clone());
            let Some(config) = config else { return };

            let transport = match build_transport(&config) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(session = %name, "rebuilding transport failed: {e}");
                    continue;
                }
            };

            let new_session = Arc::new(UpstreamSession::new(config, transport));
            self.spawn_watcher(new_session.clone());

            match new_session.start().await {
                Ok(()) => {
                    self.supervisor.record_success(&name);
                    self.sessions.write().insert(name.clone(), new_session);
                    return;
                }
                Err(e) => {
                    tracing::warn!(session = %name, "restart attempt failed: {e}");
                }
            }
        }
    }

    /// Routes one MCP method call to the right upstream, or handles it
    /// locally from the Merger's cached view.
    pub async fn dispatch(self: &Arc<Self>, method: &str, params: Option<Value>) -> Result<Value> {
        match method {
            "tools/call" => self.route_named_call(CapabilityKind::Tool, "tools/call", "name", params).await,
            "prompts/get" => self.route_named_call(CapabilityKind::Prompt, "prompts/get", "name", params).await,
            "resources/read" => {
                self.route_named_call(CapabilityKind::Resource, "resources/read", "uri", params).await
            }
            "tools/list" => Ok(json!({ "tools": self.merger.snapshot().list(CapabilityKind::Tool) })),
            "resources/list" => Ok(json!({ "resources": self.merger.snapshot().list(CapabilityKind::Resource) })),
            "prompts/list" => Ok(json!({ "prompts": self.merger.snapshot().list(CapabilityKind::Prompt) })),
            other => Err(AtraxError::UnknownName(format!("method '{other}' not supported"))),
        }
    }

    async fn route_named_call(
        self: &Arc<Self>,
        kind: CapabilityKind,
        upstream_method: &str,
        field: &'static str,
        params: Option<Value>,
    ) -> Result<Value> {
        let params = params.ok_or_else(|| AtraxError::ProtocolViolation(format!("{upstream_method} requires params")))?;
        let public_name = params
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| AtraxError::ProtocolViolation(format!("{upstream_method} requires a string '{field}'")))?
            .to_string();

        let (session_name, original_name) = {
            let snapshot = self.merger.snapshot();
            let entry = snapshot
                .resolve(kind, &public_name)
                .ok_or_else(|| AtraxError::UnknownName(public_name.clone()))?;
            (entry.session_name.clone(), entry.original_name.clone())
        };

        let session = self
            .sessions
            .read()
            .get(&session_name)
            .cloned()
            .ok_or_else(|| AtraxError::SessionDown(session_name.clone()))?;

        let mut outgoing = params;
        if let Some(obj) = outgoing.as_object_mut() {
            obj.insert(field.to_string(), Value::String(original_name));
        }

        let result = session.request(upstream_method, Some(outgoing)).await?;

        if kind == CapabilityKind::Resource {
            Ok(rewrite_resource_response(&session_name, result))
        } else {
            Ok(result)
        }
    }

    /// Resolves a downstream-allocated id for an upstream-originated
    /// request, using the symmetric id-translation table.
    pub async fn resolve_server_request(
        self: &Arc<Self>,
        downstream_id: u64,
        result: std::result::Result<Value, (i64, String, Option<Value>)>,
    ) -> Result<()> {
        let (session_name, id) = self
            .pending_server_requests
            .lock()
            .remove(&downstream_id)
            .ok_or_else(|| AtraxError::ProtocolViolation(format!("unknown downstream id {downstream_id}")))?;
        let session = self
            .sessions
            .read()
            .get(&session_name)
            .cloned()
            .ok_or_else(|| AtraxError::SessionDown(session_name.clone()))?;
        session.reply_to_server_request(id, result).await
    }

    pub fn subscribe_downstream_events(&self) -> broadcast::Receiver<DownstreamEvent> {
        self.downstream_events.subscribe()
    }

    /// The current lifecycle state of a named session, for diagnostics.
    pub fn session_state(&self, name: &str) -> Option<crate::session::SessionState> {
        self.sessions.read().get(name).map(|s| s.state())
    }

    /// The proxy is capable of a kind iff at least one upstream is.
    pub fn capability_union(&self) -> Value {
        let snapshot = self.merger.snapshot();
        json!({
            "tools": !snapshot.list(CapabilityKind::Tool).is_empty(),
            "resources": !snapshot.list(CapabilityKind::Resource).is_empty(),
            "prompts": !snapshot.list(CapabilityKind::Prompt).is_empty(),
        })
    }
}

fn rewrite_resource_response(session_name: &str, mut result: Value) -> Value {
    if let Some(contents) = result.get_mut("contents").and_then(Value::as_array_mut) {
        for item in contents {
            if let Some(uri) = item.get("uri").and_then(Value::as_str).map(str::to_string) {
                let public = crate::merger::prefix_resource_uri(session_name, &uri);
                if let Some(obj) = item.as_object_mut() {
                    obj.insert("uri".to_string(), Value::String(public));
                }
            }
        }
    }
    result
}

fn build_transport(config: &ServerConfig) -> Result<Arc<dyn Transport>> {
    match &config.transport {
        TransportConfig::Stdio { command, args, env } => Ok(Arc::new(StdioTransport::new(
            config.name.clone(),
            command.clone(),
            args.clone(),
            env.clone(),
        ))),
        TransportConfig::Docker { command, args, env } => Ok(Arc::new(DockerTransport::new(
            config.name.clone(),
            command.clone(),
            args.clone(),
            env.clone(),
        ))),
        TransportConfig::Http { url, headers } => {
            Ok(Arc::new(HttpTransport::new(config.name.clone(), url, headers.clone())?))
        }
    }
}
