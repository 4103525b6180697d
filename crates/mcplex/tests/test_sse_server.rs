mod common;

use common::{Calculator, init_tracing};
use mcplex::{
    model::*,
    serve_client,
    transport::{
        SseClientTransport, SseServer,
        common::server_side_http::DnsRebindingProtection,
        sse_client::SseClientConfig,
        sse_server::SseServerConfig,
    },
};

#[tokio::test]
async fn test_sse_round_trip() -> anyhow::Result<()> {
    init_tracing();
    let sse_server = SseServer::serve("127.0.0.1:0".parse()?).await?;
    let bind = sse_server.config.bind;
    let server_ct = sse_server.with_service(Calculator::default);

    let transport = SseClientTransport::with_client(
        reqwest::Client::default(),
        SseClientConfig::with_uri(format!("http://{bind}/sse")),
    );
    let client = serve_client((), transport).await?;
    assert_eq!(client.peer_info().unwrap().server_info.name, "calculator");

    let result = client
        .call_tool(CallToolRequestParam {
            name: "sum".into(),
            arguments: Some(object(serde_json::json!({"a": 4, "b": 5}))),
        })
        .await?;
    assert_eq!(result.content[0].as_text(), Some("9"));

    client.cancel().await?;
    server_ct.cancel();
    Ok(())
}

#[tokio::test]
async fn test_endpoint_event_carries_session() -> anyhow::Result<()> {
    use futures::StreamExt;
    init_tracing();
    let sse_server = SseServer::serve("127.0.0.1:0".parse()?).await?;
    let bind = sse_server.config.bind;
    let _server_ct = sse_server.with_service(Calculator::default);

    let response = reqwest::Client::new()
        .get(format!("http://{bind}/sse"))
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let mut byte_stream = response.bytes_stream();
    let mut buffer = String::new();
    let endpoint = loop {
        let chunk = byte_stream.next().await.expect("stream ended")?;
        buffer.push_str(std::str::from_utf8(&chunk)?);
        if let Some(block) = buffer.split("\n\n").find(|b| b.contains("event: endpoint"))
            && buffer.contains("\n\n")
        {
            break block
                .lines()
                .find_map(|line| line.strip_prefix("data: "))
                .expect("endpoint data")
                .to_string();
        }
    };
    assert!(endpoint.contains("sessionId="), "endpoint: {endpoint}");

    // a post to that endpoint is accepted
    let response = reqwest::Client::new()
        .post(format!("http://{bind}{endpoint}"))
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
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    Ok(())
}

#[tokio::test]
async fn test_sse_rebinding_protection() -> anyhow::Result<()> {
    init_tracing();
    let sse_server = SseServer::serve_with_config(SseServerConfig {
        bind: "127.0.0.1:0".parse()?,
        dns_protection: DnsRebindingProtection::default().allow_host("allowed.example.com"),
        ..Default::default()
    })
    .await?;
    let bind = sse_server.config.bind;
    let _server_ct = sse_server.with_service(Calculator::default);

    let response = reqwest::Client::new()
        .get(format!("http://{bind}/sse"))
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    Ok(())
}
