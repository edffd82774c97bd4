//! Streamable HTTP transport end-to-end tests.
//!
//! Bind the real server on an ephemeral port and speak to it with reqwest,
//! including SSE stream reads on both the POST response and the GET
//! notification channel.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use mcp_gateway::error::Result;
use mcp_gateway::http::{HttpConfig, HttpTransport};
use mcp_gateway::mcp::protocol::{
    CallToolResult, ProgressToken, ReadResourceResult, ResourceContent, ResourceDescriptor,
    ServerInfo, Tool,
};
use mcp_gateway::mcp::{Engine, RequestContext, ResourceHandler, ToolHandler};

struct ProcessDataTool;

#[async_trait]
impl ToolHandler for ProcessDataTool {
    fn descriptor(&self) -> Tool {
        Tool::new(
            "processData",
            "Process a batch of data in discrete steps",
            json!({"type": "object", "properties": {"steps": {"type": "integer"}}}),
        )
    }

    async fn call(
        &self,
        arguments: Map<String, Value>,
        ctx: RequestContext,
    ) -> Result<CallToolResult> {
        let steps = arguments
            .get("steps")
            .and_then(Value::as_u64)
            .unwrap_or(3)
            .max(1);
        let step_ms = arguments.get("stepMs").and_then(Value::as_u64).unwrap_or(10);

        for step in 1..=steps {
            tokio::time::sleep(Duration::from_millis(step_ms)).await;
            if ctx.cancellation.is_cancelled() {
                return Ok(CallToolResult::text(format!(
                    "processing interrupted after {} of {} steps",
                    step - 1,
                    steps
                )));
            }
            ctx.progress
                .report(step as f64 / steps as f64, Some(&format!("step {step}")))
                .await;
        }
        Ok(CallToolResult::text(format!("processed {steps} steps")))
    }
}

struct ServerTimeResource;

#[async_trait]
impl ResourceHandler for ServerTimeResource {
    fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor::new("server://time", "time", "Current server time")
            .with_mime_type("text/plain")
    }

    async fn read(
        &self,
        uri: &str,
        _params: Option<Value>,
        _ctx: RequestContext,
    ) -> Result<ReadResourceResult> {
        Ok(ReadResourceResult {
            contents: vec![ResourceContent {
                uri: uri.to_string(),
                mime_type: Some("text/plain".to_string()),
                text: Some(chrono::Utc::now().to_rfc3339()),
                blob: None,
            }],
        })
    }
}

/// Bind the full stack on an ephemeral port. Returns the engine (for
/// white-box assertions) and the endpoint URL.
async fn start_server() -> (Arc<Engine>, String) {
    let engine = Arc::new(Engine::new(ServerInfo {
        name: "mcp-gateway".to_string(),
        version: "0.0.0".to_string(),
    }));
    engine.tools().register(Arc::new(ProcessDataTool)).await;
    engine
        .resources()
        .register(Arc::new(ServerTimeResource))
        .await;

    let transport = HttpTransport::new(HttpConfig::default(), engine.sessions().clone());
    engine.bind(transport.clone()).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral bind");
    let addr = listener.local_addr().expect("local addr");
    let app = transport.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });

    (engine, format!("http://{addr}/mcp"))
}

/// Extract the JSON payloads of `data:` events from a finished SSE body.
fn sse_data_events(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect()
}

/// POST `initialize` and return the issued session id plus the result frame.
async fn handshake(client: &reqwest::Client, url: &str) -> (String, Value) {
    let response = client
        .post(url)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"clientInfo": {"name": "x"}, "protocolVersion": "2025-03-26"}
        }))
        .send()
        .await
        .expect("initialize request");

    assert_eq!(response.status(), 200);
    let session = response
        .headers()
        .get("mcp-session-id")
        .expect("session header issued")
        .to_str()
        .expect("header is ascii")
        .to_string();

    let body = response.text().await.expect("response body");
    let events = sse_data_events(&body);
    assert_eq!(events.len(), 1, "one reply event, got: {body}");
    (session, events[0].clone())
}

/// Open the GET notification stream and forward its events to a channel.
async fn open_notification_stream(
    client: &reqwest::Client,
    url: &str,
    session: &str,
) -> mpsc::Receiver<Value> {
    let response = client
        .get(url)
        .header("mcp-session-id", session)
        .send()
        .await
        .expect("GET stream");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok()),
        Some(session)
    );

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        let mut buf = String::new();
        while let Some(chunk) = stream.next().await {
            let Ok(chunk) = chunk else { break };
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buf.find("\n\n") {
                let event = buf[..pos].to_string();
                buf.drain(..pos + 2);
                for line in event.lines() {
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(value) = serde_json::from_str::<Value>(data) {
                            if tx.send(value).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    });
    rx
}

async fn recv_event(rx: &mut mpsc::Receiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("stream open")
}

#[tokio::test]
async fn handshake_issues_session_in_header() {
    let (engine, url) = start_server().await;
    let client = reqwest::Client::new();

    let (session, reply) = handshake(&client, &url).await;

    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["protocolVersion"], "2025-03-26");
    assert_eq!(reply["result"]["serverInfo"]["name"], "mcp-gateway");
    assert!(engine
        .sessions()
        .contains_raw(&session)
        .await);
}

#[tokio::test]
async fn session_header_is_exposed_for_cors() {
    let (_engine, url) = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(&url)
        .header("origin", "https://app.example")
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"protocolVersion": "2025-03-26"}
        }))
        .send()
        .await
        .expect("initialize request");

    let exposed = response
        .headers()
        .get("access-control-expose-headers")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    assert!(exposed.contains("mcp-session-id"), "exposed: {exposed}");
}

#[tokio::test]
async fn tool_call_streams_progress_on_get_channel() {
    let (_engine, url) = start_server().await;
    let client = reqwest::Client::new();

    let (session, _) = handshake(&client, &url).await;
    let mut notifications = open_notification_stream(&client, &url, &session).await;

    let response = client
        .post(&url)
        .header("mcp-session-id", &session)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {
                "name": "processData",
                "arguments": {"steps": 3},
                "_meta": {"progressToken": "p"}
            }
        }))
        .send()
        .await
        .expect("tools/call request");

    // Final result arrives on the POST SSE stream.
    let body = response.text().await.expect("POST body");
    let events = sse_data_events(&body);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["id"], 2);
    assert_eq!(
        events[0]["result"]["content"][0]["text"],
        "processed 3 steps"
    );

    // The three progress notifications arrive on the GET stream.
    for expected in [1.0 / 3.0, 2.0 / 3.0, 1.0] {
        let event = recv_event(&mut notifications).await;
        assert_eq!(event["method"], "notifications/progress");
        assert_eq!(event["params"]["progressToken"], "p");
        assert_eq!(event["params"]["total"], 1.0);
        let progress = event["params"]["progress"].as_f64().unwrap();
        assert!(
            (progress - expected).abs() < 1e-9,
            "expected {expected}, got {progress}"
        );
    }
}

#[tokio::test]
async fn progress_falls_back_to_post_stream_without_get() {
    let (_engine, url) = start_server().await;
    let client = reqwest::Client::new();

    let (session, _) = handshake(&client, &url).await;

    let response = client
        .post(&url)
        .header("mcp-session-id", &session)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {
                "name": "processData",
                "arguments": {"steps": 2},
                "_meta": {"progressToken": "fb"}
            }
        }))
        .send()
        .await
        .expect("tools/call request");

    let body = response.text().await.expect("POST body");
    let events = sse_data_events(&body);

    // Two progress notifications fan out onto the POST stream, then the
    // final response closes it.
    assert_eq!(events.len(), 3, "events: {events:?}");
    assert_eq!(events[0]["method"], "notifications/progress");
    assert_eq!(events[1]["method"], "notifications/progress");
    assert_eq!(events[2]["id"], 2);
    assert_eq!(
        events[2]["result"]["content"][0]["text"],
        "processed 2 steps"
    );
}

#[tokio::test]
async fn cancellation_interrupts_tool_call() {
    let (engine, url) = start_server().await;
    let client = reqwest::Client::new();

    let (session, _) = handshake(&client, &url).await;
    let mut notifications = open_notification_stream(&client, &url, &session).await;

    let call_client = client.clone();
    let call_url = url.clone();
    let call_session = session.clone();
    let call = tokio::spawn(async move {
        call_client
            .post(&call_url)
            .header("mcp-session-id", &call_session)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": {
                    "name": "processData",
                    "arguments": {"steps": 50, "stepMs": 20},
                    "_meta": {"progressToken": "c"}
                }
            }))
            .send()
            .await
            .expect("tools/call request")
            .text()
            .await
            .expect("POST body")
    });

    // Wait for the first progress event so the operation is live.
    let first = recv_event(&mut notifications).await;
    assert_eq!(first["method"], "notifications/progress");

    let operation = engine
        .operations()
        .lookup_by_token(&ProgressToken::String("c".to_string()))
        .await
        .expect("operation is registered");

    let cancel = client
        .post(&url)
        .header("mcp-session-id", &session)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "operations/cancel",
            "params": {"operationId": operation.id.to_string()}
        }))
        .send()
        .await
        .expect("cancel request");
    let cancel_events = sse_data_events(&cancel.text().await.expect("cancel body"));
    assert_eq!(cancel_events[0]["id"], 3);
    assert_eq!(cancel_events[0]["result"], json!({}));

    let body = call.await.expect("call task");
    let events = sse_data_events(&body);
    let final_text = events
        .last()
        .and_then(|e| e["result"]["content"][0]["text"].as_str())
        .expect("final result");
    assert!(
        final_text.contains("interrupted"),
        "result reflects early termination: {final_text}"
    );
}

#[tokio::test]
async fn unknown_tool_is_tool_not_found() {
    let (_engine, url) = start_server().await;
    let client = reqwest::Client::new();
    let (session, _) = handshake(&client, &url).await;

    let response = client
        .post(&url)
        .header("mcp-session-id", &session)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "tools/call",
            "params": {"name": "nope"}
        }))
        .send()
        .await
        .expect("request");

    let events = sse_data_events(&response.text().await.expect("body"));
    assert_eq!(events[0]["error"]["code"], -32101);
}

#[tokio::test]
async fn never_issued_session_is_rejected() {
    let (_engine, url) = start_server().await;
    let client = reqwest::Client::new();
    handshake(&client, &url).await;

    let response = client
        .post(&url)
        .header("mcp-session-id", "00000000-0000-0000-0000-000000000000")
        .json(&json!({"jsonrpc": "2.0", "id": 5, "method": "tools/list"}))
        .send()
        .await
        .expect("request");

    let events = sse_data_events(&response.text().await.expect("body"));
    assert_eq!(events[0]["error"]["code"], -32600);
}

#[tokio::test]
async fn resource_read_round_trip() {
    let (_engine, url) = start_server().await;
    let client = reqwest::Client::new();
    let (session, _) = handshake(&client, &url).await;

    let response = client
        .post(&url)
        .header("mcp-session-id", &session)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "resources/read",
            "params": {"uri": "server://time"}
        }))
        .send()
        .await
        .expect("request");

    let events = sse_data_events(&response.text().await.expect("body"));
    let contents = &events[0]["result"]["contents"][0];
    assert_eq!(contents["uri"], "server://time");
    assert!(!contents["text"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn delete_ends_session_idempotently() {
    let (engine, url) = start_server().await;
    let client = reqwest::Client::new();
    let (session, _) = handshake(&client, &url).await;

    let first = client
        .delete(&url)
        .header("mcp-session-id", &session)
        .send()
        .await
        .expect("first DELETE");
    assert_eq!(first.status(), 204);
    assert_eq!(engine.sessions().session_count().await, 0);

    let second = client
        .delete(&url)
        .header("mcp-session-id", &session)
        .send()
        .await
        .expect("second DELETE");
    assert_eq!(second.status(), 204);

    // The ended session no longer resolves.
    let response = client
        .post(&url)
        .header("mcp-session-id", &session)
        .json(&json!({"jsonrpc": "2.0", "id": 6, "method": "ping"}))
        .send()
        .await
        .expect("ping after delete");
    let events = sse_data_events(&response.text().await.expect("body"));
    assert_eq!(events[0]["error"]["code"], -32600);
}

#[tokio::test]
async fn notification_post_is_accepted_without_body() {
    let (_engine, url) = start_server().await;
    let client = reqwest::Client::new();
    let (session, _) = handshake(&client, &url).await;

    let response = client
        .post(&url)
        .header("mcp-session-id", &session)
        .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .send()
        .await
        .expect("notification");

    assert_eq!(response.status(), 202);
    assert!(response.text().await.expect("body").is_empty());
}

#[tokio::test]
async fn replacing_get_stream_closes_the_previous_one() {
    let (engine, url) = start_server().await;
    let client = reqwest::Client::new();
    let (session, _) = handshake(&client, &url).await;

    let mut first = open_notification_stream(&client, &url, &session).await;
    let _second = open_notification_stream(&client, &url, &session).await;

    // The first stream ends when its sink is replaced.
    let closed = tokio::time::timeout(Duration::from_secs(5), first.recv())
        .await
        .expect("first stream should close");
    assert!(closed.is_none());

    // The replacement teardown must not end the session.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.sessions().contains_raw(&session).await);
}
