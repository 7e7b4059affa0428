use std::time::Duration;

use serde_json::json;

use super::*;
use crate::config::TransportConfig;
use crate::fake::FakeTransport;

fn echo_config(name: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        transport: TransportConfig::Stdio {
            command: "echo-server".to_string(),
            args: vec![],
            env: Default::default(),
        },
        description: None,
        tags: vec![],
    }
}

fn respond(id: &Value, result: Value) -> Value {
    json!({"jsonrpc":"2.0","id":id,"result":result})
}

/// A handler that answers initialize/get_capabilities/tools/list and leaves
/// everything else unanswered.
fn ready_handler(tools: Vec<Value>) -> impl Fn(&Value) -> Option<Value> + Send + Sync + 'static {
    move |msg: &Value| {
        let id = msg.get("id")?;
        let method = msg.get("method")?.as_str()?;
        match method {
            "initialize" => Some(respond(
                id,
                json!({"protocolVersion":"2024-11-05","serverInfo":{"name":"fake","version":"0"},"capabilities":{}}),
            )),
            "get_capabilities" => Some(respond(id, json!({"capabilities":{"tools":true,"resources":false,"prompts":false}}))),
            "tools/list" => Some(respond(id, json!({"tools": tools}))),
            _ => None,
        }
    }
}

#[tokio::test]
async fn start_reaches_ready_with_declared_tools() {
    let transport = FakeTransport::new(ready_handler(vec![json!({"name":"ping"})]));
    let session = Arc::new(UpstreamSession::new(echo_config("echo"), transport));
    let mut events = session.subscribe();

    session.start().await.expect("handshake should succeed");
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.capabilities().tools.len(), 1);

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event within timeout")
        .expect("channel open");
    assert!(matches!(event, SessionEvent::Ready { .. }));
}

#[tokio::test]
async fn request_resolves_to_upstream_result() {
    let transport = FakeTransport::new(|msg: &Value| {
        let id = msg.get("id")?;
        Some(respond(id, json!({"value": 42})))
    });
    let session = Arc::new(UpstreamSession::new(echo_config("calc"), transport));
    session.set_state(SessionState::Ready);
    let msg_stream = session.transport.receive_stream();
    let state_stream = session.transport.state_stream();
    let this = Arc::clone(&session);
    tokio::spawn(async move { this.run_read_loop(msg_stream, state_stream).await });

    let result = session.request("tools/call", Some(json!({"name":"x"}))).await.unwrap();
    assert_eq!(result["value"], 42);
}

#[tokio::test]
async fn request_times_out_when_upstream_never_replies() {
    let transport = FakeTransport::new(|_msg: &Value| None);
    let session = Arc::new(UpstreamSession::new(echo_config("slow"), transport));
    session.set_state(SessionState::Ready);
    let msg_stream = session.transport.receive_stream();
    let state_stream = session.transport.state_stream();
    let this = Arc::clone(&session);
    tokio::spawn(async move { this.run_read_loop(msg_stream, state_stream).await });

    let result = session
        .request_with_timeout("tools/call", None, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(AtraxError::Timeout(_))));
    assert!(session.pending.lock().is_empty());
}

#[tokio::test]
async fn late_response_after_timeout_is_dropped_not_delivered() {
    let transport = FakeTransport::new(|_msg: &Value| None);
    let session = Arc::new(UpstreamSession::new(echo_config("late"), transport.clone()));
    session.set_state(SessionState::Ready);
    let msg_stream = session.transport.receive_stream();
    let state_stream = session.transport.state_stream();
    let this = Arc::clone(&session);
    tokio::spawn(async move { this.run_read_loop(msg_stream, state_stream).await });

    let result = session
        .request_with_timeout("tools/call", None, Duration::from_millis(20))
        .await;
    assert!(matches!(result, Err(AtraxError::Timeout(_))));

    // The id the proxy allocated for that request was 1; a late reply for it
    // should find no pending entry and be silently dropped.
    transport.push_inbound(json!({"jsonrpc":"2.0","id":1,"result":{"late":true}}));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(session.pending.lock().is_empty());
}

#[tokio::test]
async fn list_changed_notification_triggers_relist() {
    let tools = Arc::new(parking_lot::Mutex::new(vec![json!({"name":"a"})]));
    let tools_for_handler = tools.clone();
    let transport = FakeTransport::new(move |msg: &Value| {
        let id = msg.get("id")?;
        let method = msg.get("method")?.as_str()?;
        match method {
            "tools/list" => Some(respond(id, json!({"tools": tools_for_handler.lock().clone()}))),
            _ => None,
        }
    });
    let session = Arc::new(UpstreamSession::new(echo_config("dyn"), transport.clone()));
    session.set_state(SessionState::Ready);
    let mut events = session.subscribe();
    let msg_stream = session.transport.receive_stream();
    let state_stream = session.transport.state_stream();
    let this = Arc::clone(&session);
    tokio::spawn(async move { this.run_read_loop(msg_stream, state_stream).await });

    tools.lock().push(json!({"name":"b"}));
    transport.push_inbound(json!({"jsonrpc":"2.0","method":"notifications/tools/list_changed"}));

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event within timeout")
        .expect("channel open");
    match event {
        SessionEvent::CapabilitiesChanged { kind, capabilities } => {
            assert_eq!(kind, CapabilityKind::Tool);
            assert_eq!(capabilities.tools.len(), 2);
        }
        other => panic!("expected CapabilitiesChanged, got {other:?}"),
    }
}
