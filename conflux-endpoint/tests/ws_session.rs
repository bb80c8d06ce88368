//! Loopback WebSocket tests: the test plays the agent, the session under
//! test serves the aggregated MCP surface.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use conflux_config::ConfigSnapshot;
use conflux_endpoint::{EndpointManager, EndpointSession, EndpointState, SessionSettings};
use conflux_hub::{ServiceManager, ServiceManagerConfig};
use conflux_mcp::testing::{tool, ScriptedRemote};
use conflux_mcp::BackoffPolicy;

type AgentSocket = WebSocketStream<TcpStream>;

fn settings() -> SessionSettings {
    SessionSettings {
        backoff: BackoffPolicy {
            initial: Some(Duration::from_millis(20)),
            multiplier: 1.5,
            cap: Duration::from_millis(200),
            max_attempts: None,
            jitter: 0.0,
        },
        heartbeat_interval: Duration::from_secs(60),
        heartbeat_timeout: Duration::from_secs(10),
        call_deadline: Duration::from_secs(5),
        notification_backlog: 16,
        drain_grace: Duration::from_millis(500),
    }
}

async fn hub_with(remote: &ScriptedRemote) -> Arc<ServiceManager> {
    let snapshot: ConfigSnapshot = serde_json::from_value(json!({
        "mcpServers": { "calc": { "command": "echo-mcp" } }
    }))
    .unwrap();
    let config = ServiceManagerConfig {
        backoff: BackoffPolicy {
            initial: Some(Duration::from_millis(10)),
            multiplier: 1.5,
            cap: Duration::from_millis(100),
            max_attempts: Some(2),
            jitter: 0.0,
        },
        transport_factory: remote.factory(),
        ..Default::default()
    };
    let manager = ServiceManager::new(snapshot, config).await.unwrap();
    manager.start().await.unwrap();
    manager
}

async fn bind_agent() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept_agent(listener: &TcpListener) -> AgentSocket {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn send_request(ws: &mut AgentSocket, method: &str, params: Value, id: i64) {
    let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": id });
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn send_notification(ws: &mut AgentSocket, method: &str) {
    let frame = json!({ "jsonrpc": "2.0", "method": method });
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next JSON frame from the session, skipping control frames
async fn recv_json(ws: &mut AgentSocket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("frame within timeout")
            .expect("socket open")
            .expect("clean frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn session_serves_the_mcp_dialect() {
    let remote = ScriptedRemote::echoing(vec![tool("add", "adds two integers")]);
    let hub = hub_with(&remote).await;
    let (listener, url) = bind_agent().await;

    let handle = EndpointSession::spawn(url, settings(), hub);
    let mut agent = accept_agent(&listener).await;

    // initialize
    send_request(
        &mut agent,
        "initialize",
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "agent", "version": "1.0" }
        }),
        1,
    )
    .await;
    let reply = recv_json(&mut agent).await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["serverInfo"]["name"], "conflux");
    assert_eq!(reply["result"]["capabilities"]["tools"]["listChanged"], true);
    assert_eq!(reply["result"]["protocolVersion"], "2024-11-05");

    send_notification(&mut agent, "notifications/initialized").await;

    // ping
    send_request(&mut agent, "ping", json!({}), 2).await;
    let reply = recv_json(&mut agent).await;
    assert_eq!(reply["id"], 2);
    assert!(reply["result"].is_object());

    // tools/list
    send_request(&mut agent, "tools/list", json!({}), 3).await;
    let reply = recv_json(&mut agent).await;
    assert_eq!(reply["id"], 3);
    let tools = reply["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "calc__add");

    // tools/call
    send_request(
        &mut agent,
        "tools/call",
        json!({ "name": "calc__add", "arguments": { "a": 2, "b": 3 } }),
        4,
    )
    .await;
    let reply = recv_json(&mut agent).await;
    assert_eq!(reply["id"], 4);
    let text = reply["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("\"a\":2"));

    // unknown method
    send_request(&mut agent, "resources/list", json!({}), 5).await;
    let reply = recv_json(&mut agent).await;
    assert_eq!(reply["id"], 5);
    assert_eq!(reply["error"]["code"], -32601);

    // unknown tool maps to invalid params with a typed kind
    send_request(
        &mut agent,
        "tools/call",
        json!({ "name": "calc__nope", "arguments": {} }),
        6,
    )
    .await;
    let reply = recv_json(&mut agent).await;
    assert_eq!(reply["error"]["code"], -32602);
    assert_eq!(reply["error"]["data"]["kind"], "tool_not_found");

    handle.close().await;
    assert_eq!(handle.state(), EndpointState::Disconnected);
}

#[tokio::test]
async fn malformed_frames_get_a_parse_error() {
    let remote = ScriptedRemote::echoing(vec![]);
    let hub = hub_with(&remote).await;
    let (listener, url) = bind_agent().await;

    let handle = EndpointSession::spawn(url, settings(), hub);
    let mut agent = accept_agent(&listener).await;

    agent
        .send(Message::Text("this is not json".to_string()))
        .await
        .unwrap();
    let reply = recv_json(&mut agent).await;
    assert_eq!(reply["error"]["code"], -32700);
    assert!(reply["id"].is_null());

    handle.close().await;
}

#[tokio::test]
async fn session_reconnects_after_server_drop() {
    let remote = ScriptedRemote::echoing(vec![]);
    let hub = hub_with(&remote).await;
    let (listener, url) = bind_agent().await;

    let handle = EndpointSession::spawn(url, settings(), hub);

    // First connection established, then dropped server-side
    let agent = accept_agent(&listener).await;
    drop(agent);

    // The session dials back in on its own
    let mut agent = accept_agent(&listener).await;
    send_request(&mut agent, "ping", json!({}), 1).await;
    let reply = recv_json(&mut agent).await;
    assert_eq!(reply["id"], 1);

    handle.close().await;
}

#[tokio::test]
async fn tool_change_is_broadcast_to_every_endpoint_once() {
    let remote = ScriptedRemote::echoing(vec![tool("one", "")]);
    let hub = hub_with(&remote).await;

    let (listener_a, url_a) = bind_agent().await;
    let (listener_b, url_b) = bind_agent().await;

    let endpoints = EndpointManager::new(hub.clone(), settings());
    endpoints.connect_all(&[url_a.clone(), url_b.clone()]).await;

    let mut agent_a = accept_agent(&listener_a).await;
    let mut agent_b = accept_agent(&listener_b).await;

    // Let both sessions settle before provoking the change
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = endpoints.status().await;
    assert_eq!(status.len(), 2);
    assert!(status.iter().all(|s| s.state == EndpointState::Connected));

    remote.set_tools(vec![tool("one", ""), tool("two", "")]);
    remote.notify_tools_changed();

    // Both agents see exactly one list_changed notification
    for agent in [&mut agent_a, &mut agent_b] {
        let mut seen = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let frame = tokio::time::timeout_at(deadline, agent.next()).await;
            match frame {
                Ok(Some(Ok(Message::Text(text)))) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["method"] == "notifications/tools/list_changed" {
                        seen += 1;
                    }
                }
                Ok(Some(Ok(_))) => {}
                _ => break,
            }
        }
        assert_eq!(seen, 1);
    }

    // Both now list the new tool
    send_request(&mut agent_a, "tools/list", json!({}), 9).await;
    let reply = recv_json(&mut agent_a).await;
    let names: Vec<&str> = reply["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"calc__one"));
    assert!(names.contains(&"calc__two"));

    endpoints.disconnect_all().await;
    assert!(endpoints.status().await.is_empty());
}

#[tokio::test]
async fn add_and_remove_endpoints_dynamically() {
    let remote = ScriptedRemote::echoing(vec![]);
    let hub = hub_with(&remote).await;
    let (listener, url) = bind_agent().await;

    let endpoints = EndpointManager::new(hub, settings());
    assert!(endpoints.add_endpoint(&url).await);
    assert!(!endpoints.add_endpoint(&url).await);

    let _agent = accept_agent(&listener).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(endpoints.status().await.len(), 1);

    assert!(endpoints.remove_endpoint(&url).await);
    assert!(!endpoints.remove_endpoint(&url).await);
    assert!(endpoints.status().await.is_empty());
}
