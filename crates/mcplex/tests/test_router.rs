mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use common::init_tracing;
use mcplex::{
    ServiceError, serve_client, serve_server,
    handler::router::MethodRouter,
    model::*,
    service::RoleServer,
};

fn router_server() -> MethodRouter<RoleServer> {
    let info = ServerInfo {
        protocol_version: ProtocolVersion::LATEST,
        capabilities: ServerCapabilities::builder().enable_tools().build(),
        server_info: Implementation {
            name: "router".into(),
            version: "0".into(),
            title: None,
        },
        instructions: None,
    };
    MethodRouter::new(info)
}

#[tokio::test]
async fn test_registered_handler_answers() -> anyhow::Result<()> {
    init_tracing();
    let mut router = router_server();
    router.register_request_handler("tools/list", |_request, _context| async move {
        Ok(ServerResult::ListToolsResult(ListToolsResult {
            tools: vec![Tool::new("echo", "echoes", JsonObject::new())],
            next_cursor: None,
        }))
    });

    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(serve_server(router, server_io));
    let client = serve_client((), client_io).await?;

    let tools = client.list_tools(None).await?;
    assert_eq!(tools.tools[0].name, "echo");

    let server = server_task.await??;
    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn test_registering_replaces_previous_handler() -> anyhow::Result<()> {
    init_tracing();
    let mut router = router_server();
    router.register_request_handler("tools/list", |_request, _context| async move {
        Ok(ServerResult::ListToolsResult(ListToolsResult::default()))
    });
    router.register_request_handler("tools/list", |_request, _context| async move {
        Ok(ServerResult::ListToolsResult(ListToolsResult {
            tools: vec![Tool::new("replacement", "wins", JsonObject::new())],
            next_cursor: None,
        }))
    });

    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(serve_server(router, server_io));
    let client = serve_client((), client_io).await?;
    let tools = client.list_tools(None).await?;
    assert_eq!(tools.tools[0].name, "replacement");

    let server = server_task.await??;
    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn test_unhandled_method_without_fallback() -> anyhow::Result<()> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(serve_server(router_server(), server_io));
    let client = serve_client((), client_io).await?;

    let error = client.list_tools(None).await.expect_err("no handler");
    let ServiceError::McpError(error) = error else {
        panic!("expected protocol error");
    };
    assert_eq!(error.code, ErrorCode::METHOD_NOT_FOUND);
    assert_eq!(error.message, "tools/list");

    let server = server_task.await??;
    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn test_fallback_handlers_catch_the_rest() -> anyhow::Result<()> {
    init_tracing();
    let mut router = router_server();
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    router.set_fallback_request_handler(|_request, _context| async move {
        Ok(ServerResult::empty(()))
    });
    router.set_fallback_notification_handler(move |_notification, _context| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(serve_server(router, server_io));
    let client = serve_client((), client_io).await?;

    // any request lands in the fallback now
    let result = client
        .send_request(ClientRequest::ListToolsRequest(ListToolsRequest {
            method: Default::default(),
            params: None,
            extensions: Default::default(),
        }))
        .await?;
    assert!(matches!(result, ServerResult::EmptyResult(_)));
    client.notify_roots_list_changed().await?;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(notified.load(Ordering::SeqCst) >= 1);

    let server = server_task.await??;
    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}
