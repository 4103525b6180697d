mod common;

use std::sync::{Arc, Mutex};

use common::{Calculator, init_tracing};
use mcplex::{
    serve_client, serve_server,
    model::*,
    service::PeerRequestOptions,
};

#[tokio::test]
async fn test_progress_reaches_subscriber_in_order() -> anyhow::Result<()> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(serve_server(Calculator::default(), server_io));
    let client = serve_client((), client_io).await?;

    let observed: Arc<Mutex<Vec<f64>>> = Default::default();
    let sink = observed.clone();
    let handle = client
        .send_cancellable_request(
            ClientRequest::CallToolRequest(CallToolRequest::new(CallToolRequestParam {
                name: "countdown".into(),
                arguments: Some(object(serde_json::json!({"steps": 4, "stepMs": 1}))),
            })),
            PeerRequestOptions {
                on_progress: Some(Box::new(move |progress| {
                    sink.lock().unwrap().push(progress.progress);
                })),
                ..Default::default()
            },
        )
        .await?;
    let result = handle.await_response().await?;
    assert!(matches!(result, ServerResult::CallToolResult(_)));

    let observed = observed.lock().unwrap().clone();
    assert_eq!(observed, vec![0.0, 1.0, 2.0, 3.0]);

    let server = server_task.await??;
    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn test_progress_token_routes_to_the_right_request() -> anyhow::Result<()> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(serve_server(Calculator::default(), server_io));
    let client = serve_client((), client_io).await?;

    let first: Arc<Mutex<Vec<f64>>> = Default::default();
    let second: Arc<Mutex<Vec<f64>>> = Default::default();

    let make_request = |sink: Arc<Mutex<Vec<f64>>>, steps: u64| {
        let request = ClientRequest::CallToolRequest(CallToolRequest::new(CallToolRequestParam {
            name: "countdown".into(),
            arguments: Some(object(serde_json::json!({"steps": steps, "stepMs": 1}))),
        }));
        let options = PeerRequestOptions {
            on_progress: Some(Box::new(move |progress: ProgressNotificationParam| {
                sink.lock().unwrap().push(progress.progress);
            })),
            ..Default::default()
        };
        (request, options)
    };

    let (request_a, options_a) = make_request(first.clone(), 2);
    let (request_b, options_b) = make_request(second.clone(), 3);
    let handle_a = client.send_cancellable_request(request_a, options_a).await?;
    let handle_b = client.send_cancellable_request(request_b, options_b).await?;
    let (result_a, result_b) =
        tokio::join!(handle_a.await_response(), handle_b.await_response());
    result_a?;
    result_b?;

    assert_eq!(first.lock().unwrap().clone(), vec![0.0, 1.0]);
    assert_eq!(second.lock().unwrap().clone(), vec![0.0, 1.0, 2.0]);

    let server = server_task.await??;
    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn test_no_progress_after_response() -> anyhow::Result<()> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(serve_server(Calculator::default(), server_io));
    let client = serve_client((), client_io).await?;

    let count: Arc<Mutex<usize>> = Default::default();
    let sink = count.clone();
    let handle = client
        .send_cancellable_request(
            ClientRequest::CallToolRequest(CallToolRequest::new(CallToolRequestParam {
                name: "countdown".into(),
                arguments: Some(object(serde_json::json!({"steps": 2, "stepMs": 1}))),
            })),
            PeerRequestOptions {
                on_progress: Some(Box::new(move |_| {
                    *sink.lock().unwrap() += 1;
                })),
                ..Default::default()
            },
        )
        .await?;
    handle.await_response().await?;
    let after_response = *count.lock().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(*count.lock().unwrap(), after_response);

    let server = server_task.await??;
    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}
