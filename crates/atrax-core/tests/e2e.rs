//! End-to-end scenarios driven against an in-memory fake transport so they
//! run hermetically, without spawning any real child process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use atrax_core::config::{ConflictStrategy, ServerConfig, TransportConfig};
use atrax_core::downstream::DownstreamServer;
use atrax_core::fake::FakeTransport;
use atrax_core::router::{DownstreamEvent, Router};
use atrax_core::session::{CapabilityKind, SessionState};
use atrax_core::transport::TransportEvent;
use serde_json::{json, Value};

fn stub_config(name: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        transport: TransportConfig::Stdio {
            command: "atrax-test-fake-upstream".to_string(),
            args: vec![],
            env: HashMap::new(),
        },
        description: None,
        tags: vec![],
    }
}

fn respond(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn upstream_with_tool(tool_name: &'static str) -> Arc<FakeTransport> {
    FakeTransport::new(move |msg: &Value| {
        let id = msg.get("id")?;
        match msg.get("method")?.as_str()? {
            "initialize" => Some(respond(
                id,
                json!({"protocolVersion":"2024-11-05","serverInfo":{"name":"upstream"},"capabilities":{}}),
            )),
            "get_capabilities" => Some(respond(id, json!({"capabilities": {"tools": true}}))),
            "tools/list" => Some(respond(id, json!({"tools": [{"name": tool_name}]}))),
            "tools/call" => Some(respond(id, json!({"ok": true, "called": msg["params"]["name"]}))),
            _ => None,
        }
    })
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

async fn wait_for_tools_list(router: &Arc<Router>, expected_len: usize, timeout: Duration) -> Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(result) = router.dispatch("tools/list", None).await {
            if result["tools"].as_array().map(Vec::len) == Some(expected_len) {
                return result;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("tools/list never reached {expected_len} entries within {timeout:?}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_for_tool_call_ok(router: &Arc<Router>, name: &str, timeout: Duration) -> Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(result) = router.dispatch("tools/call", Some(json!({"name": name}))).await {
            return result;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("tools/call '{name}' never succeeded within {timeout:?}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Scenario A: single stdio echo upstream, downstream initialize reports atrax.
#[tokio::test]
async fn scenario_a_single_upstream_initialize() {
    let transport = upstream_with_tool("ping");
    let router = Router::with_sessions(
        vec![(stub_config("echo"), transport)],
        ConflictStrategy::PrefixWithServerName,
    );
    router.start_all().await;
    wait_for_tools_list(&router, 1, Duration::from_secs(2)).await;

    let server = DownstreamServer::new(router);
    let response = server
        .handle_message(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
        .await
        .unwrap();
    assert_eq!(response["result"]["serverInfo"]["name"], "atrax");
}

/// Scenario B: two upstreams both export "hello"; PrefixWithServerName
/// yields lexicographically ordered a__hello / b__hello.
#[tokio::test]
async fn scenario_b_name_prefixing_orders_lexicographically() {
    let a = upstream_with_tool("hello");
    let b = upstream_with_tool("hello");
    let router = Router::with_sessions(
        vec![(stub_config("a"), a), (stub_config("b"), b)],
        ConflictStrategy::PrefixWithServerName,
    );
    router.start_all().await;

    let result = wait_for_tools_list(&router, 2, Duration::from_secs(2)).await;
    let names: Vec<String> = result["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["a__hello", "b__hello"]);
}

/// Scenario C: FirstWins; shutting down the owner promotes the next session.
#[tokio::test]
async fn scenario_c_first_wins_promotes_after_shutdown() {
    let a = upstream_with_tool("hello");
    let b = upstream_with_tool("hello");
    let router = Router::with_sessions(
        vec![(stub_config("a"), a.clone()), (stub_config("b"), b)],
        ConflictStrategy::FirstWins,
    );
    router.start_all().await;

    let result = wait_for_tool_call_ok(&router, "hello", Duration::from_secs(2)).await;
    assert_eq!(result["called"], "hello");

    a.push_state(TransportEvent::Closed("shutdown".to_string()));

    // After "a" is evicted, "b" becomes the sole owner of "hello" on rebuild.
    wait_for_tool_call_ok(&router, "hello", Duration::from_secs(2)).await;
}

/// Scenario D: upstream crash evicts its entries and fans out list_changed.
#[tokio::test]
async fn scenario_d_upstream_crash_emits_list_changed() {
    let x = upstream_with_tool("ping");
    let router = Router::with_sessions(vec![(stub_config("x"), x.clone())], ConflictStrategy::PrefixWithServerName);
    let mut events = router.subscribe_downstream_events();
    router.start_all().await;

    wait_for_tools_list(&router, 1, Duration::from_secs(2)).await;

    x.push_state(TransportEvent::Closed("crashed".to_string()));

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
    assert!(event.is_ok(), "expected a downstream event within 1s of the crash");

    wait_for_tools_list(&router, 0, Duration::from_secs(2)).await;
}

/// Scenario E: a request with a short deadline against a silent upstream
/// times out and reports a proxy-internal error code.
#[tokio::test]
async fn scenario_e_request_timeout_reports_error_code() {
    let silent = FakeTransport::new(|msg: &Value| {
        let id = msg.get("id")?;
        match msg.get("method")?.as_str()? {
            "initialize" => Some(respond(
                id,
                json!({"protocolVersion":"2024-11-05","serverInfo":{"name":"slow"},"capabilities":{}}),
            )),
            "get_capabilities" => Some(respond(id, json!({"capabilities": {"tools": true}}))),
            "tools/list" => Some(respond(id, json!({"tools": [{"name": "slow"}]}))),
            // tools/call is never answered.
            _ => None,
        }
    });
    let router = Router::with_sessions(
        vec![(stub_config("slow"), silent)],
        ConflictStrategy::PrefixWithServerName,
    );
    router.start_all().await;
    wait_for_tools_list(&router, 1, Duration::from_secs(2)).await;

    let server = DownstreamServer::new(router);
    let response = server
        .handle_message(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"slow__slow"}}"#)
        .await
        .unwrap();

    let code = response["error"]["code"].as_i64().unwrap();
    assert!((-32099..=-32000).contains(&code));
}

/// Reject strategy: the later session's conflicting entry is omitted and
/// that session is marked Degraded, while the owning session is unaffected.
#[tokio::test]
async fn reject_strategy_degrades_the_later_conflicting_session() {
    let a = upstream_with_tool("hello");
    let b = upstream_with_tool("hello");
    let router = Router::with_sessions(
        vec![(stub_config("a"), a), (stub_config("b"), b)],
        ConflictStrategy::Reject,
    );
    router.start_all().await;

    wait_for_tools_list(&router, 1, Duration::from_secs(2)).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if router.session_state("b") == Some(SessionState::Degraded) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("session 'b' never transitioned to Degraded after its conflicting entry was rejected");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    assert_eq!(router.session_state("a"), Some(SessionState::Ready));
}

/// An upstream-originated request (e.g. `sampling/createMessage`) surfaces
/// as a `DownstreamEvent::ServerRequest`, and resolving it via
/// `resolve_server_request` forwards the reply back to that upstream as a
/// JSON-RPC response carrying its own id.
#[tokio::test]
async fn resolves_server_initiated_request_back_to_upstream() {
    let transport = upstream_with_tool("ping");
    let router = Router::with_sessions(
        vec![(stub_config("echo"), transport.clone())],
        ConflictStrategy::PrefixWithServerName,
    );
    let mut events = router.subscribe_downstream_events();
    router.start_all().await;
    wait_for_tools_list(&router, 1, Duration::from_secs(2)).await;

    transport.push_inbound(json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "sampling/createMessage",
        "params": {"prompt": "hi"},
    }));

    let downstream_id = loop {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(DownstreamEvent::ServerRequest {
                downstream_id,
                session_name,
                method,
                ..
            })) => {
                assert_eq!(session_name, "echo");
                assert_eq!(method, "sampling/createMessage");
                break downstream_id;
            }
            Ok(Ok(_)) => continue,
            other => panic!("expected a ServerRequest event, got {other:?}"),
        }
    };

    router
        .resolve_server_request(downstream_id, Ok(json!({"role": "assistant", "content": "hello"})))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        if transport
            .sent_messages()
            .iter()
            .any(|m| m.get("id") == Some(&json!(7)) && m.get("result").is_some())
        {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("upstream never received the resolved reply for id 7");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    // Resolving the same id twice is a protocol violation, not a panic.
    let err = router
        .resolve_server_request(downstream_id, Ok(json!(null)))
        .await
        .unwrap_err();
    assert!(matches!(err, atrax_core::error::AtraxError::ProtocolViolation(_)));
}

/// Scenario F: a spontaneous upstream notification triggers a re-list and a
/// downstream list_changed, regardless of which transport substrate carried it.
#[tokio::test]
async fn scenario_f_notification_triggers_relist() {
    let resources = Arc::new(parking_lot::Mutex::new(vec![json!({"uri": "file:///a"})]));
    let resources_for_handler = resources.clone();
    let transport = FakeTransport::new(move |msg: &Value| {
        let id = msg.get("id")?;
        match msg.get("method")?.as_str()? {
            "initialize" => Some(respond(
                id,
                json!({"protocolVersion":"2024-11-05","serverInfo":{"name":"remote"},"capabilities":{}}),
            )),
            "get_capabilities" => Some(respond(id, json!({"capabilities": {"resources": true}}))),
            "resources/list" => Some(respond(id, json!({"resources": resources_for_handler.lock().clone()}))),
            _ => None,
        }
    });
    let router = Router::with_sessions(
        vec![(stub_config("remote"), transport.clone())],
        ConflictStrategy::PrefixWithServerName,
    );
    let mut events = router.subscribe_downstream_events();
    router.start_all().await;

    // Let the handshake complete before the notification arrives.
    tokio::time::sleep(Duration::from_millis(50)).await;

    resources.lock().push(json!({"uri": "file:///b"}));
    transport.push_inbound(json!({"jsonrpc":"2.0","method":"notifications/resources/list_changed"}));

    let mut saw_list_changed = false;
    for _ in 0..5 {
        if let Ok(Ok(DownstreamEvent::ListChanged(CapabilityKind::Resource))) =
            tokio::time::timeout(Duration::from_secs(1), events.recv()).await
        {
            saw_list_changed = true;
            break;
        }
    }
    assert!(saw_list_changed, "expected a resources list_changed event");
}
