mod common;

use common::{Calculator, init_tracing};
use mcplex::{
    CancelSignal, ServiceError, serve_client, serve_server,
    model::*,
    service::{PeerRequestOptions},
};

#[tokio::test]
async fn test_abort_resolves_future_and_notifies_peer() -> anyhow::Result<()> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let calculator = Calculator::default();
    let cancellations = calculator.cancellations.clone();
    let server_task = tokio::spawn(serve_server(calculator, server_io));
    let client = serve_client((), client_io).await?;

    let signal = CancelSignal::new();
    let handle = client
        .send_cancellable_request(
            ClientRequest::CallToolRequest(CallToolRequest::new(CallToolRequestParam {
                name: "hang".into(),
                arguments: None,
            })),
            PeerRequestOptions {
                cancel_signal: Some(signal.clone()),
                ..Default::default()
            },
        )
        .await?;

    signal.cancel(Some("Cancelled by test".to_string()));
    let error = handle.await_response().await.expect_err("must cancel");
    let ServiceError::Cancelled { reason } = &error else {
        panic!("unexpected error: {error:?}");
    };
    assert_eq!(reason.as_deref(), Some("Cancelled by test"));

    // the cancellation notification reaches the peer and fires the
    // handler's signal; the reason survives the trip
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if cancellations
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.as_deref() == Some("Cancelled by test"))
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await?;

    let server = server_task.await??;
    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn test_cancel_handle_is_terminal() -> anyhow::Result<()> {
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
            PeerRequestOptions::no_options(),
        )
        .await?;
    handle.cancel(Some("changed my mind".to_string())).await?;

    // the session stays healthy after a cancellation
    client.ping().await?;

    let server = server_task.await??;
    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn test_late_response_after_cancel_is_dropped() -> anyhow::Result<()> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(serve_server(Calculator::default(), server_io));
    let client = serve_client((), client_io).await?;

    let signal = CancelSignal::new();
    let handle = client
        .send_cancellable_request(
            ClientRequest::CallToolRequest(CallToolRequest::new(CallToolRequestParam {
                name: "countdown".into(),
                arguments: Some(object(serde_json::json!({"steps": 1, "stepMs": 50}))),
            })),
            PeerRequestOptions {
                cancel_signal: Some(signal.clone()),
                ..Default::default()
            },
        )
        .await?;
    signal.cancel(None);
    assert!(matches!(
        handle.await_response().await,
        Err(ServiceError::Cancelled { .. })
    ));

    // countdown may still complete server-side; its response must not
    // disturb later requests
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let result = client
        .call_tool(CallToolRequestParam {
            name: "sum".into(),
            arguments: Some(object(serde_json::json!({"a": 2, "b": 3}))),
        })
        .await?;
    assert_eq!(result.content[0].as_text(), Some("5"));

    let server = server_task.await??;
    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}
