use mcplex::model::*;
use serde_json::json;

#[test]
fn test_initialize_round_trip() {
    let raw = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {"name": "c", "version": "1"}
        }
    });
    let message: ClientJsonRpcMessage = serde_json::from_value(raw.clone()).unwrap();
    assert_eq!(serde_json::to_value(&message).unwrap(), raw);
}

#[test]
fn test_initialize_result_wire_format() {
    let result = ServerResult::InitializeResult(InitializeResult {
        protocol_version: ProtocolVersion::V_2025_03_26,
        capabilities: ServerCapabilities::builder().enable_tools().build(),
        server_info: Implementation {
            name: "s".into(),
            version: "1".into(),
            title: None,
        },
        instructions: None,
    });
    let message = ServerJsonRpcMessage::response(result, RequestId::Number(1));
    assert_eq!(
        serde_json::to_value(&message).unwrap(),
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "s", "version": "1"}
            }
        })
    );
}

#[test]
fn test_request_and_notification_disambiguation() {
    let request: ClientJsonRpcMessage = serde_json::from_value(json!({
        "jsonrpc": "2.0", "id": "a", "method": "ping"
    }))
    .unwrap();
    assert!(matches!(request, ClientJsonRpcMessage::Request(_)));

    let notification: ClientJsonRpcMessage = serde_json::from_value(json!({
        "jsonrpc": "2.0", "method": "notifications/initialized"
    }))
    .unwrap();
    assert!(matches!(notification, ClientJsonRpcMessage::Notification(_)));
}

#[test]
fn test_response_and_error_disambiguation() {
    let response: ServerJsonRpcMessage = serde_json::from_value(json!({
        "jsonrpc": "2.0", "id": 1, "result": {}
    }))
    .unwrap();
    assert!(matches!(response, ServerJsonRpcMessage::Response(_)));

    let error: ServerJsonRpcMessage = serde_json::from_value(json!({
        "jsonrpc": "2.0", "id": 1,
        "error": {"code": -32601, "message": "Method not found"}
    }))
    .unwrap();
    let (error, _) = error.into_error().unwrap();
    assert_eq!(error.code, ErrorCode::METHOD_NOT_FOUND);
}

#[test]
fn test_progress_token_defaults_into_meta() {
    let mut request = CallToolRequest::new(CallToolRequestParam {
        name: "sum".into(),
        arguments: None,
    });
    request
        .get_meta_mut()
        .set_progress_token(ProgressToken(NumberOrString::Number(5)));
    let value = serde_json::to_value(&ClientJsonRpcMessage::request(
        ClientRequest::CallToolRequest(request),
        RequestId::Number(5),
    ))
    .unwrap();
    assert_eq!(value["params"]["_meta"]["progressToken"], 5);
}

#[test]
fn test_batch_round_trip() {
    let raw = json!([
        {"jsonrpc": "2.0", "id": 1, "method": "tools/list"},
        {"jsonrpc": "2.0", "method": "notifications/cancelled", "params": {"requestId": 9}}
    ]);
    let message: ClientJsonRpcMessage = serde_json::from_value(raw.clone()).unwrap();
    let ClientJsonRpcMessage::BatchRequest(items) = &message else {
        panic!("expected batch request");
    };
    assert_eq!(items.len(), 2);
    assert_eq!(serde_json::to_value(&message).unwrap(), raw);
}

#[test]
fn test_unknown_method_is_rejected() {
    let result: Result<ClientJsonRpcMessage, _> = serde_json::from_value(json!({
        "jsonrpc": "2.0", "id": 1, "method": "no/such/method"
    }));
    assert!(result.is_err());
}

#[test]
fn test_wrong_jsonrpc_version_is_rejected() {
    let result: Result<ClientJsonRpcMessage, _> = serde_json::from_value(json!({
        "jsonrpc": "1.0", "id": 1, "method": "ping"
    }));
    assert!(result.is_err());
}
