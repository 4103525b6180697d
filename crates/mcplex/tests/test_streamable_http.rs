mod common;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use common::{Calculator, init_tracing};
use mcplex::{
    model::*,
    serve_client,
    transport::{
        StreamableHttpClientTransport,
        streamable_http_client::StreamableHttpClientTransportConfig,
        streamable_http_server::{
            StreamableHttpServerConfig, StreamableHttpService,
            session::local::LocalSessionManager,
        },
    },
};

async fn start_server(
    config: StreamableHttpServerConfig,
) -> anyhow::Result<(SocketAddr, Arc<LocalSessionManager>, Arc<AtomicUsize>)> {
    let session_manager = Arc::new(LocalSessionManager::default());
    let sessions_served = Arc::new(AtomicUsize::new(0));
    let counter = sessions_served.clone();
    let service = StreamableHttpService::new(
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Calculator::default())
        },
        session_manager.clone(),
        config,
    );
    let router = axum::Router::new().fallback_service(service);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((addr, session_manager, sessions_served))
}

#[tokio::test]
async fn test_initialize_ping_and_tool_call() -> anyhow::Result<()> {
    init_tracing();
    let (addr, _manager, _count) = start_server(Default::default()).await?;

    let transport = StreamableHttpClientTransport::with_client(
        reqwest::Client::default(),
        StreamableHttpClientTransportConfig::with_uri(format!("http://{addr}/")),
    );
    let client = serve_client((), transport).await?;
    assert_eq!(
        client.peer_info().unwrap().server_info.name,
        "calculator"
    );
    client.ping().await?;
    let result = client
        .call_tool(CallToolRequestParam {
            name: "sum".into(),
            arguments: Some(object(serde_json::json!({"a": 20, "b": 22}))),
        })
        .await?;
    assert_eq!(result.content[0].as_text(), Some("42"));
    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn test_json_response_mode() -> anyhow::Result<()> {
    init_tracing();
    let (addr, _manager, _count) = start_server(StreamableHttpServerConfig {
        json_response_mode: true,
        ..Default::default()
    })
    .await?;

    let transport = StreamableHttpClientTransport::with_client(
        reqwest::Client::default(),
        StreamableHttpClientTransportConfig::with_uri(format!("http://{addr}/")),
    );
    let client = serve_client((), transport).await?;
    let result = client
        .call_tool(CallToolRequestParam {
            name: "sum".into(),
            arguments: Some(object(serde_json::json!({"a": 1, "b": 2}))),
        })
        .await?;
    assert_eq!(result.content[0].as_text(), Some("3"));
    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn test_session_expiry_triggers_reinitialize() -> anyhow::Result<()> {
    init_tracing();
    let (addr, manager, sessions_served) = start_server(Default::default()).await?;

    let transport = StreamableHttpClientTransport::with_client(
        reqwest::Client::default(),
        StreamableHttpClientTransportConfig::with_uri(format!("http://{addr}/")),
    );
    let client = serve_client((), transport).await?;
    client.ping().await?;
    assert_eq!(sessions_served.load(Ordering::SeqCst), 1);

    // the server forgets the session; the next request gets a 404 and
    // the transport silently starts a new session
    for session_id in manager.session_ids().await {
        use mcplex::transport::streamable_http_server::session::SessionManager as _;
        manager.close_session(&session_id).await?;
    }
    client.ping().await?;
    assert_eq!(sessions_served.load(Ordering::SeqCst), 2);

    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn test_rebinding_protection_rejects_unknown_host() -> anyhow::Result<()> {
    init_tracing();
    let (addr, _manager, _count) = start_server(StreamableHttpServerConfig {
        dns_protection: mcplex::transport::common::server_side_http::DnsRebindingProtection::default()
            .allow_host("allowed.example.com"),
        ..Default::default()
    })
    .await?;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/"))
        .header("Accept", "application/json, text/event-stream")
        .header("Content-Type", "application/json")
        .body(r#"{"jsonrpc":"2.0","id":0,"method":"ping"}"#)
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn test_wrong_protocol_version_header_is_400() -> anyhow::Result<()> {
    init_tracing();
    let (addr, _manager, _count) = start_server(Default::default()).await?;
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/"))
        .header("Accept", "application/json, text/event-stream")
        .header("Content-Type", "application/json")
        .header("MCP-Protocol-Version", "1999-01-01")
        .body(r#"{"jsonrpc":"2.0","id":0,"method":"ping"}"#)
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_notification_only_post_gets_202() -> anyhow::Result<()> {
    init_tracing();
    let (addr, _manager, _count) = start_server(Default::default()).await?;
    let http = reqwest::Client::new();

    // handshake by hand to keep the raw session id around
    let response = http
        .post(format!("http://{addr}/"))
        .header("Accept", "application/json, text/event-stream")
        .header("Content-Type", "application/json")
        .json(&serde_json::json!({
            "jsonrpc": "2.0", "id": 0, "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "raw", "version": "0"}
            }
        }))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let session_id = response
        .headers()
        .get("Mcp-Session-Id")
        .and_then(|v| v.to_str().ok())
        .expect("session id assigned at initialize")
        .to_owned();

    let response = http
        .post(format!("http://{addr}/"))
        .header("Accept", "application/json, text/event-stream")
        .header("Content-Type", "application/json")
        .header("Mcp-Session-Id", &session_id)
        .json(&serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    // unknown sessions 404 so clients know to re-initialize
    let response = http
        .post(format!("http://{addr}/"))
        .header("Accept", "application/json, text/event-stream")
        .header("Content-Type", "application/json")
        .header("Mcp-Session-Id", "not-a-session")
        .json(&serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

/// Minimal SSE decoder for raw-wire assertions.
fn parse_sse_events(buffer: &str) -> Vec<(Option<String>, String)> {
    let mut events = Vec::new();
    for block in buffer.split("\n\n") {
        let mut id = None;
        let mut data = String::new();
        for line in block.lines() {
            if let Some(value) = line.strip_prefix("id: ") {
                id = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("data: ") {
                data.push_str(value);
            }
        }
        if !data.is_empty() {
            events.push((id, data));
        }
    }
    events
}

#[tokio::test]
async fn test_resume_replays_exactly_the_missed_suffix() -> anyhow::Result<()> {
    use futures::StreamExt;
    init_tracing();
    let (addr, _manager, _count) = start_server(Default::default()).await?;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://{addr}/"))
        .header("Accept", "application/json, text/event-stream")
        .header("Content-Type", "application/json")
        .json(&serde_json::json!({
            "jsonrpc": "2.0", "id": 0, "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "raw", "version": "0"}
            }
        }))
        .send()
        .await?;
    let session_id = response
        .headers()
        .get("Mcp-Session-Id")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_owned();
    http.post(format!("http://{addr}/"))
        .header("Accept", "application/json, text/event-stream")
        .header("Content-Type", "application/json")
        .header("Mcp-Session-Id", &session_id)
        .json(&serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .send()
        .await?;

    // a progress-heavy call delivered over a per-request SSE stream
    let response = http
        .post(format!("http://{addr}/"))
        .header("Accept", "application/json, text/event-stream")
        .header("Content-Type", "application/json")
        .header("Mcp-Session-Id", &session_id)
        .json(&serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": {
                "name": "countdown",
                "arguments": {"steps": 4, "stepMs": 30},
                "_meta": {"progressToken": 1}
            }
        }))
        .send()
        .await?;
    assert!(
        response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"))
    );

    // take events until two have ids, then abandon the connection
    let mut byte_stream = response.bytes_stream();
    let mut buffer = String::new();
    let cut_after_id = loop {
        let chunk = byte_stream.next().await.expect("stream ended early")?;
        buffer.push_str(std::str::from_utf8(&chunk)?);
        let events = parse_sse_events(&buffer);
        let ids: Vec<_> = events.iter().filter_map(|(id, _)| id.clone()).collect();
        if ids.len() >= 2 {
            break ids[1].clone();
        }
    };
    drop(byte_stream);

    // wait for the countdown to finish so the suffix is complete
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let resumed = http
        .get(format!("http://{addr}/"))
        .header("Accept", "text/event-stream")
        .header("Mcp-Session-Id", &session_id)
        .header("Last-Event-ID", &cut_after_id)
        .send()
        .await?;
    assert_eq!(resumed.status(), reqwest::StatusCode::OK);
    let mut byte_stream = resumed.bytes_stream();
    let mut buffer = String::new();
    let events = loop {
        let Ok(Some(chunk)) =
            tokio::time::timeout(std::time::Duration::from_secs(2), byte_stream.next()).await
        else {
            break parse_sse_events(&buffer);
        };
        buffer.push_str(std::str::from_utf8(&chunk?)?);
        let events = parse_sse_events(&buffer);
        // countdown emits 4 progress events and one response; we cut
        // after the second event, so three remain
        if events.len() >= 3 {
            break events;
        }
    };

    let cut_seq: u64 = cut_after_id.split('/').nth(1).unwrap().parse()?;
    let replayed_seqs: Vec<u64> = events
        .iter()
        .filter_map(|(id, _)| id.as_deref())
        .map(|id| id.split('/').nth(1).unwrap().parse().unwrap())
        .collect();
    // strictly increasing continuation, no duplicates, no gaps
    assert_eq!(
        replayed_seqs,
        (cut_seq + 1..=cut_seq + replayed_seqs.len() as u64).collect::<Vec<_>>()
    );
    // the final replayed event is the response
    let last = events.last().unwrap();
    assert!(last.1.contains("\"result\""));
    Ok(())
}
