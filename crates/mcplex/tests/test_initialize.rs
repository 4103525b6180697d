mod common;

use common::{Calculator, init_tracing};
use mcplex::{
    model::*,
    serve_client, serve_server,
    service::ClientInitializeError,
    transport::Transport,
    transport::async_rw::AsyncRwTransport,
};

#[tokio::test]
async fn test_initialize_and_ping() -> anyhow::Result<()> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(serve_server(Calculator::default(), server_io));
    let client = serve_client((), client_io).await?;

    let server_info = client.peer_info().expect("server info cached at initialize");
    assert_eq!(server_info.server_info.name, "calculator");
    assert_eq!(server_info.protocol_version, ProtocolVersion::LATEST);
    assert!(server_info.capabilities.tools.is_some());
    assert_eq!(server_info.instructions.as_deref(), Some("a calculator for tests"));

    client.ping().await?;

    let server = server_task.await??;
    let client_info = server.peer_info().expect("client info cached at initialize");
    assert_eq!(client_info.protocol_version, ProtocolVersion::LATEST);

    client.cancel().await?;
    server.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn test_server_downgrades_to_older_version() -> anyhow::Result<()> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(async move {
        let mut transport: AsyncRwTransport<mcplex::RoleServer, _, _> = {
            let (read, write) = tokio::io::split(server_io);
            AsyncRwTransport::new(read, write)
        };
        let (request, id) = transport.receive().await.unwrap().into_request().unwrap();
        let ClientRequest::InitializeRequest(request) = request else {
            panic!("expected initialize request");
        };
        // an old server negotiates down regardless of the client's
        // newer proposal
        let requested = request.params.protocol_version;
        let negotiated = ProtocolVersion::negotiate(&requested);
        assert_eq!(negotiated, requested);
        transport
            .send(ServerJsonRpcMessage::response(
                ServerResult::InitializeResult(InitializeResult {
                    protocol_version: ProtocolVersion::V_2024_11_05,
                    ..Default::default()
                }),
                id,
            ))
            .await
            .unwrap();
        // swallow the initialized notification, then idle
        let _ = transport.receive().await;
        transport
    });

    let client = serve_client((), client_io).await?;
    let info = client.peer_info().unwrap();
    assert_eq!(info.protocol_version, ProtocolVersion::V_2024_11_05);
    drop(server_task);
    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn test_unsupported_server_version_closes_connect() {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        let mut transport: AsyncRwTransport<mcplex::RoleServer, _, _> = {
            let (read, write) = tokio::io::split(server_io);
            AsyncRwTransport::new(read, write)
        };
        let (_, id) = transport.receive().await.unwrap().into_request().unwrap();
        transport
            .send(ServerJsonRpcMessage::response(
                ServerResult::InitializeResult(InitializeResult {
                    protocol_version: ProtocolVersion::from("2099-12-31".to_string()),
                    ..Default::default()
                }),
                id,
            ))
            .await
            .unwrap();
        // hold the pipe open so the client decides on its own
        let _ = transport.receive().await;
    });

    let error = serve_client((), client_io).await.expect_err("must refuse");
    let ClientInitializeError::UnsupportedProtocolVersion(version) = &error else {
        panic!("unexpected error: {error:?}");
    };
    assert_eq!(version.as_str(), "2099-12-31");
    assert_eq!(
        error.to_string(),
        "Server's protocol version is not supported: 2099-12-31"
    );
}

#[tokio::test]
async fn test_requests_before_initialized_are_deferred() -> anyhow::Result<()> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let server_task = tokio::spawn(serve_server(Calculator::default(), server_io));

    let mut transport: AsyncRwTransport<mcplex::RoleClient, _, _> = {
        let (read, write) = tokio::io::split(client_io);
        AsyncRwTransport::new(read, write)
    };
    transport
        .send(ClientJsonRpcMessage::request(
            ClientRequest::InitializeRequest(InitializeRequest::new(
                InitializeRequestParam::default(),
            )),
            RequestId::Number(0),
        ))
        .await?;
    let _init_response = transport.receive().await.unwrap();
    // fire a request before announcing initialized; the server must
    // answer it after the handshake completes instead of rejecting it
    transport
        .send(ClientJsonRpcMessage::request(
            ClientRequest::PingRequest(PingRequest {
                method: Default::default(),
                extensions: Default::default(),
            }),
            RequestId::Number(1),
        ))
        .await?;
    transport
        .send(ClientJsonRpcMessage::notification(
            ClientNotification::InitializedNotification(InitializedNotification {
                method: Default::default(),
                extensions: Default::default(),
            }),
        ))
        .await?;

    let response = transport.receive().await.unwrap();
    let (_, id) = response.into_response().expect("ping answered");
    assert_eq!(id, RequestId::Number(1));

    drop(transport);
    let _ = server_task.await?;
    Ok(())
}
