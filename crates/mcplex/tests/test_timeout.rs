mod common;

use std::time::Duration;

use common::{Calculator, init_tracing};
use mcplex::{
    ServiceError, serve_client, serve_server,
    model::*,
    service::PeerRequestOptions,
};

#[tokio::test(start_paused = true)]
async fn test_deadline_fires_without_response() -> anyhow::Result<()> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(serve_server(Calculator::default(), server_io));
    let client = serve_client((), client_io).await?;

    let handle = client
        .send_cancellable_request(
            ClientRequest::CallToolRequest(CallToolRequest::new(CallToolRequestParam {
                name: "hang".into(),
                arguments: None,
            })),
            PeerRequestOptions {
                timeout: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        )
        .await?;
    let started = tokio::time::Instant::now();
    let error = handle.await_response().await.expect_err("must time out");
    assert!(matches!(error, ServiceError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_secs(1));

    // the session survives a timed-out request
    client.ping().await?;

    let server = server_task.await??;
    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_progress_resets_deadline() -> anyhow::Result<()> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(serve_server(Calculator::default(), server_io));
    let client = serve_client((), client_io).await?;

    // every step takes 600ms against a 1s deadline: without resets the
    // request would die long before the 5th step
    let handle = client
        .send_cancellable_request(
            ClientRequest::CallToolRequest(CallToolRequest::new(CallToolRequestParam {
                name: "countdown".into(),
                arguments: Some(object(serde_json::json!({"steps": 5, "stepMs": 600}))),
            })),
            PeerRequestOptions {
                timeout: Some(Duration::from_secs(1)),
                reset_timeout_on_progress: true,
                ..Default::default()
            },
        )
        .await?;
    let result = handle.await_response().await?;
    let ServerResult::CallToolResult(result) = result else {
        panic!("unexpected result");
    };
    assert_eq!(result.content[0].as_text(), Some("done"));

    let server = server_task.await??;
    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_total_ceiling_beats_progress_resets() -> anyhow::Result<()> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(serve_server(Calculator::default(), server_io));
    let client = serve_client((), client_io).await?;

    // an endless stream of progress cannot stretch the request past
    // max_total_timeout
    let handle = client
        .send_cancellable_request(
            ClientRequest::CallToolRequest(CallToolRequest::new(CallToolRequestParam {
                name: "countdown".into(),
                arguments: Some(object(serde_json::json!({"steps": 100_000, "stepMs": 500}))),
            })),
            PeerRequestOptions {
                timeout: Some(Duration::from_secs(1)),
                reset_timeout_on_progress: true,
                max_total_timeout: Some(Duration::from_secs(3)),
                ..Default::default()
            },
        )
        .await?;
    let started = tokio::time::Instant::now();
    let error = handle.await_response().await.expect_err("ceiling must fire");
    assert!(matches!(error, ServiceError::Timeout { .. }));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "fired late: {elapsed:?}");

    let server = server_task.await??;
    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}
