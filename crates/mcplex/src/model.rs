//! Basic data types of the protocol: JSON-RPC envelopes, lifecycle
//! messages, capabilities and the payload types exchanged between an
//! application host (client) and a capability provider (server).
use std::{borrow::Cow, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod capabilities;
mod completion;
mod content;
mod elicitation;
mod extension;
mod meta;
mod prompt;
mod resource;
mod roots;
mod sampling;
mod serde_impl;
mod tool;
pub use capabilities::*;
pub use completion::*;
pub use content::*;
pub use elicitation::*;
pub use extension::Extensions;
pub use meta::*;
pub use prompt::*;
pub use resource::*;
pub use roots::*;
pub use sampling::*;
pub use tool::*;

pub type JsonObject<F = Value> = serde_json::Map<String, F>;

/// unwrap the JsonObject under [`serde_json::Value`]
///
/// # Panic
/// This will panic when the value is not a object in debug mode.
pub fn object(value: serde_json::Value) -> JsonObject {
    debug_assert!(value.is_object());
    match value {
        serde_json::Value::Object(map) => map,
        _ => JsonObject::default(),
    }
}

/// Marker for the `"jsonrpc": "2.0"` field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion2_0;

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let version: Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        if version != "2.0" {
            return Err(serde::de::Error::custom(format!(
                "invalid JSON-RPC version: {version}"
            )));
        }
        Ok(JsonRpcVersion2_0)
    }
}

/// An opaque, ordered protocol revision identifier such as `2025-03-26`.
///
/// Versions are date strings, so the lexicographic order of the inner
/// string is the chronological order of revisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ProtocolVersion(Cow<'static, str>);

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ProtocolVersion {
    fn from(value: String) -> Self {
        Self(Cow::Owned(value))
    }
}

impl ProtocolVersion {
    pub const V_2024_10_07: Self = Self(Cow::Borrowed("2024-10-07"));
    pub const V_2024_11_05: Self = Self(Cow::Borrowed("2024-11-05"));
    pub const V_2025_03_26: Self = Self(Cow::Borrowed("2025-03-26"));
    pub const LATEST: Self = Self::V_2025_03_26;
    /// Every revision this crate can speak, oldest first.
    pub const SUPPORTED: &[Self] = &[Self::V_2024_10_07, Self::V_2024_11_05, Self::V_2025_03_26];

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }

    /// Server-side negotiation: answer with the client's version when we
    /// speak it, otherwise with the newest supported version that is not
    /// newer than the client's proposal. A proposal older than everything
    /// we speak gets our oldest version, which the client will then
    /// reject on its side.
    pub fn negotiate(requested: &Self) -> Self {
        if requested.is_supported() {
            return requested.clone();
        }
        Self::SUPPORTED
            .iter()
            .rev()
            .find(|v| *v <= requested)
            .unwrap_or(&Self::SUPPORTED[0])
            .clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(u32),
    String(Arc<str>),
}

impl NumberOrString {
    pub fn into_json_value(self) -> Value {
        match self {
            NumberOrString::Number(n) => Value::Number(serde_json::Number::from(n)),
            NumberOrString::String(s) => Value::String(s.to_string()),
        }
    }
}

impl std::fmt::Display for NumberOrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumberOrString::Number(n) => n.fmt(f),
            NumberOrString::String(s) => s.fmt(f),
        }
    }
}

impl From<u32> for NumberOrString {
    fn from(n: u32) -> Self {
        NumberOrString::Number(n)
    }
}

impl From<String> for NumberOrString {
    fn from(s: String) -> Self {
        NumberOrString::String(s.into())
    }
}

/// The id of an outstanding request, unique within one peer's id space.
pub type RequestId = NumberOrString;

/// Correlates progress notifications with the request that asked for
/// them; defaults to the request id when the caller does not set one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ProgressToken(pub NumberOrString);

/// A JSON-RPC request carrying a typed method marker and params.
#[derive(Debug, Clone, PartialEq)]
pub struct Request<M = String, P = JsonObject> {
    pub method: M,
    pub params: P,
    /// Out-of-band state attached to this message, including [`Meta`].
    pub extensions: Extensions,
}

impl<M: Default, P> Request<M, P> {
    pub fn new(params: P) -> Self {
        Self {
            method: Default::default(),
            params,
            extensions: Extensions::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptionalParam<M = String, P = JsonObject> {
    pub method: M,
    pub params: Option<P>,
    pub extensions: Extensions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestNoParam<M = String> {
    pub method: M,
    pub extensions: Extensions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification<M = String, P = JsonObject> {
    pub method: M,
    pub params: P,
    pub extensions: Extensions,
}

impl<M: Default, P> Notification<M, P> {
    pub fn new(params: P) -> Self {
        Self {
            method: Default::default(),
            params,
            extensions: Extensions::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationNoParam<M = String> {
    pub method: M,
    pub extensions: Extensions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest<R = Request> {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    #[serde(flatten)]
    pub request: R,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse<R = JsonObject> {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub result: R,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification<N = Notification> {
    pub jsonrpc: JsonRpcVersion2_0,
    #[serde(flatten)]
    pub notification: N,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub error: ErrorData,
}

/// Standard and implementation-defined JSON-RPC error codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const CONNECTION_CLOSED: Self = Self(-32000);
    pub const REQUEST_TIMEOUT: Self = Self(-32001);
    pub const CANCELLED: Self = Self(-32800);
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
}

/// Error information for JSON-RPC error responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorData {
    /// The error type that occurred.
    pub code: ErrorCode,

    /// A short description of the error. The message SHOULD be limited
    /// to a concise single sentence.
    pub message: Cow<'static, str>,

    /// Additional information about the error. The value of this member
    /// is defined by the sender (e.g. detailed error information, nested errors etc.).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        data: Option<Value>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }
    pub fn parse_error(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message, data)
    }
    pub fn invalid_request(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message, data)
    }
    pub fn method_not_found<M: ConstString>() -> Self {
        Self::new(ErrorCode::METHOD_NOT_FOUND, M::VALUE, None)
    }
    pub fn invalid_params(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message, data)
    }
    pub fn internal_error(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message, data)
    }
    pub fn request_timeout(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::REQUEST_TIMEOUT, message, None)
    }
    pub fn cancelled(reason: Option<String>) -> Self {
        Self::new(
            ErrorCode::CANCELLED,
            reason
                .map(Cow::Owned)
                .unwrap_or(Cow::Borrowed("request cancelled")),
            None,
        )
    }
}

pub trait ConstString: Default {
    const VALUE: &'static str;
}

macro_rules! const_string {
    ($name:ident = $value:literal) => {
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
        pub struct $name;

        impl ConstString for $name {
            const VALUE: &'static str = $value;
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str($value)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s: std::borrow::Cow<'de, str> = Deserialize::deserialize(deserializer)?;
                if s == $value {
                    Ok($name)
                } else {
                    Err(serde::de::Error::custom(format!(concat!(
                        "expect const string value \"",
                        $value,
                        "\""
                    ))))
                }
            }
        }
    };
}
pub(crate) use const_string;

const_string!(InitializeResultMethod = "initialize");
const_string!(PingRequestMethod = "ping");
const_string!(InitializedNotificationMethod = "notifications/initialized");
const_string!(CancelledNotificationMethod = "notifications/cancelled");
const_string!(ProgressNotificationMethod = "notifications/progress");

/// Name and version of the program speaking one end of the protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Default for Implementation {
    fn default() -> Self {
        Self::from_build_env()
    }
}

impl Implementation {
    pub fn from_build_env() -> Self {
        Self {
            name: env!("CARGO_CRATE_NAME").to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            title: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParam {
    pub protocol_version: ProtocolVersion,
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: ProtocolVersion,
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    /// Usage hints the server wants the host application to see.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

pub type ServerInfo = InitializeResult;
pub type ClientInfo = InitializeRequestParam;

impl Default for InitializeResult {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::default(),
            server_info: Implementation::from_build_env(),
            instructions: None,
        }
    }
}

impl Default for InitializeRequestParam {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::from_build_env(),
        }
    }
}

pub type InitializeRequest = Request<InitializeResultMethod, InitializeRequestParam>;
pub type PingRequest = RequestNoParam<PingRequestMethod>;
pub type InitializedNotification = NotificationNoParam<InitializedNotificationMethod>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancelledNotificationParam {
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub type CancelledNotification =
    Notification<CancelledNotificationMethod, CancelledNotificationParam>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressNotificationParam {
    pub progress_token: ProgressToken,
    /// The progress thus far. This should increase every time progress
    /// is made, even if the total is unknown.
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub type ProgressNotification = Notification<ProgressNotificationMethod, ProgressNotificationParam>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetLevelRequestParam {
    pub level: LoggingLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoggingMessageNotificationParam {
    pub level: LoggingLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedRequestParam {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EmptyObject {}

pub type EmptyResult = EmptyObject;

const_string!(ListToolsRequestMethod = "tools/list");
const_string!(CallToolRequestMethod = "tools/call");
const_string!(ListPromptsRequestMethod = "prompts/list");
const_string!(GetPromptRequestMethod = "prompts/get");
const_string!(ListResourcesRequestMethod = "resources/list");
const_string!(ListResourceTemplatesRequestMethod = "resources/templates/list");
const_string!(ReadResourceRequestMethod = "resources/read");
const_string!(SubscribeRequestMethod = "resources/subscribe");
const_string!(UnsubscribeRequestMethod = "resources/unsubscribe");
const_string!(SetLevelRequestMethod = "logging/setLevel");
const_string!(CompleteRequestMethod = "completion/complete");
const_string!(CreateMessageRequestMethod = "sampling/createMessage");
const_string!(ListRootsRequestMethod = "roots/list");
const_string!(CreateElicitationRequestMethod = "elicitation/create");
const_string!(LoggingMessageNotificationMethod = "notifications/message");
const_string!(ResourceUpdatedNotificationMethod = "notifications/resources/updated");
const_string!(ResourceListChangedNotificationMethod = "notifications/resources/list_changed");
const_string!(ToolListChangedNotificationMethod = "notifications/tools/list_changed");
const_string!(PromptListChangedNotificationMethod = "notifications/prompts/list_changed");
const_string!(RootsListChangedNotificationMethod = "notifications/roots/list_changed");

pub type ListToolsRequest = RequestOptionalParam<ListToolsRequestMethod, PaginatedRequestParam>;
pub type CallToolRequest = Request<CallToolRequestMethod, CallToolRequestParam>;
pub type ListPromptsRequest = RequestOptionalParam<ListPromptsRequestMethod, PaginatedRequestParam>;
pub type GetPromptRequest = Request<GetPromptRequestMethod, GetPromptRequestParam>;
pub type ListResourcesRequest =
    RequestOptionalParam<ListResourcesRequestMethod, PaginatedRequestParam>;
pub type ListResourceTemplatesRequest =
    RequestOptionalParam<ListResourceTemplatesRequestMethod, PaginatedRequestParam>;
pub type ReadResourceRequest = Request<ReadResourceRequestMethod, ReadResourceRequestParam>;
pub type SubscribeRequest = Request<SubscribeRequestMethod, SubscribeRequestParam>;
pub type UnsubscribeRequest = Request<UnsubscribeRequestMethod, UnsubscribeRequestParam>;
pub type SetLevelRequest = Request<SetLevelRequestMethod, SetLevelRequestParam>;
pub type CompleteRequest = Request<CompleteRequestMethod, CompleteRequestParam>;
pub type CreateMessageRequest = Request<CreateMessageRequestMethod, CreateMessageRequestParam>;
pub type ListRootsRequest = RequestNoParam<ListRootsRequestMethod>;
pub type CreateElicitationRequest =
    Request<CreateElicitationRequestMethod, CreateElicitationRequestParam>;
pub type LoggingMessageNotification =
    Notification<LoggingMessageNotificationMethod, LoggingMessageNotificationParam>;
pub type ResourceUpdatedNotification =
    Notification<ResourceUpdatedNotificationMethod, ResourceUpdatedNotificationParam>;
pub type ResourceListChangedNotification =
    NotificationNoParam<ResourceListChangedNotificationMethod>;
pub type ToolListChangedNotification = NotificationNoParam<ToolListChangedNotificationMethod>;
pub type PromptListChangedNotification = NotificationNoParam<PromptListChangedNotificationMethod>;
pub type RootsListChangedNotification = NotificationNoParam<RootsListChangedNotificationMethod>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUpdatedNotificationParam {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequestParam {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequestParam {
    pub uri: String,
}

macro_rules! ts_union {
    (
        export type $U:ident = $(| $V:ident)*;
    ) => {
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
        #[serde(untagged)]
        pub enum $U {
            $($V($V),)*
        }
    };
}

ts_union!(
    export type ClientRequest =
    | InitializeRequest
    | PingRequest
    | ListToolsRequest
    | CallToolRequest
    | ListPromptsRequest
    | GetPromptRequest
    | ListResourcesRequest
    | ListResourceTemplatesRequest
    | ReadResourceRequest
    | SubscribeRequest
    | UnsubscribeRequest
    | SetLevelRequest
    | CompleteRequest
    ;
);

ts_union!(
    export type ClientNotification =
    | CancelledNotification
    | ProgressNotification
    | InitializedNotification
    | RootsListChangedNotification
    ;
);

ts_union!(
    export type ClientResult =
    | CreateMessageResult
    | ListRootsResult
    | CreateElicitationResult
    | EmptyResult
    ;
);

impl ClientResult {
    pub fn empty(_: ()) -> ClientResult {
        ClientResult::EmptyResult(EmptyObject {})
    }
}

ts_union!(
    export type ServerRequest =
    | PingRequest
    | CreateMessageRequest
    | ListRootsRequest
    | CreateElicitationRequest
    ;
);

ts_union!(
    export type ServerNotification =
    | CancelledNotification
    | ProgressNotification
    | LoggingMessageNotification
    | ResourceUpdatedNotification
    | ResourceListChangedNotification
    | ToolListChangedNotification
    | PromptListChangedNotification
    ;
);

ts_union!(
    export type ServerResult =
    | InitializeResult
    | ListToolsResult
    | CallToolResult
    | ListPromptsResult
    | GetPromptResult
    | ListResourcesResult
    | ListResourceTemplatesResult
    | ReadResourceResult
    | CompleteResult
    | EmptyResult
    ;
);

impl ServerResult {
    pub fn empty(_: ()) -> ServerResult {
        ServerResult::EmptyResult(EmptyObject {})
    }
}

impl ClientRequest {
    pub fn method(&self) -> &'static str {
        match self {
            ClientRequest::InitializeRequest(_) => InitializeResultMethod::VALUE,
            ClientRequest::PingRequest(_) => PingRequestMethod::VALUE,
            ClientRequest::ListToolsRequest(_) => ListToolsRequestMethod::VALUE,
            ClientRequest::CallToolRequest(_) => CallToolRequestMethod::VALUE,
            ClientRequest::ListPromptsRequest(_) => ListPromptsRequestMethod::VALUE,
            ClientRequest::GetPromptRequest(_) => GetPromptRequestMethod::VALUE,
            ClientRequest::ListResourcesRequest(_) => ListResourcesRequestMethod::VALUE,
            ClientRequest::ListResourceTemplatesRequest(_) => {
                ListResourceTemplatesRequestMethod::VALUE
            }
            ClientRequest::ReadResourceRequest(_) => ReadResourceRequestMethod::VALUE,
            ClientRequest::SubscribeRequest(_) => SubscribeRequestMethod::VALUE,
            ClientRequest::UnsubscribeRequest(_) => UnsubscribeRequestMethod::VALUE,
            ClientRequest::SetLevelRequest(_) => SetLevelRequestMethod::VALUE,
            ClientRequest::CompleteRequest(_) => CompleteRequestMethod::VALUE,
        }
    }
}

impl ClientNotification {
    pub fn method(&self) -> &'static str {
        match self {
            ClientNotification::CancelledNotification(_) => CancelledNotificationMethod::VALUE,
            ClientNotification::ProgressNotification(_) => ProgressNotificationMethod::VALUE,
            ClientNotification::InitializedNotification(_) => InitializedNotificationMethod::VALUE,
            ClientNotification::RootsListChangedNotification(_) => {
                RootsListChangedNotificationMethod::VALUE
            }
        }
    }
}

impl ServerRequest {
    pub fn method(&self) -> &'static str {
        match self {
            ServerRequest::PingRequest(_) => PingRequestMethod::VALUE,
            ServerRequest::CreateMessageRequest(_) => CreateMessageRequestMethod::VALUE,
            ServerRequest::ListRootsRequest(_) => ListRootsRequestMethod::VALUE,
            ServerRequest::CreateElicitationRequest(_) => CreateElicitationRequestMethod::VALUE,
        }
    }
}

impl ServerNotification {
    pub fn method(&self) -> &'static str {
        match self {
            ServerNotification::CancelledNotification(_) => CancelledNotificationMethod::VALUE,
            ServerNotification::ProgressNotification(_) => ProgressNotificationMethod::VALUE,
            ServerNotification::LoggingMessageNotification(_) => {
                LoggingMessageNotificationMethod::VALUE
            }
            ServerNotification::ResourceUpdatedNotification(_) => {
                ResourceUpdatedNotificationMethod::VALUE
            }
            ServerNotification::ResourceListChangedNotification(_) => {
                ResourceListChangedNotificationMethod::VALUE
            }
            ServerNotification::ToolListChangedNotification(_) => {
                ToolListChangedNotificationMethod::VALUE
            }
            ServerNotification::PromptListChangedNotification(_) => {
                PromptListChangedNotificationMethod::VALUE
            }
        }
    }
}

impl From<CancelledNotification> for ClientNotification {
    fn from(value: CancelledNotification) -> Self {
        ClientNotification::CancelledNotification(value)
    }
}

impl From<ProgressNotification> for ClientNotification {
    fn from(value: ProgressNotification) -> Self {
        ClientNotification::ProgressNotification(value)
    }
}

impl From<CancelledNotification> for ServerNotification {
    fn from(value: CancelledNotification) -> Self {
        ServerNotification::CancelledNotification(value)
    }
}

impl From<ProgressNotification> for ServerNotification {
    fn from(value: ProgressNotification) -> Self {
        ServerNotification::ProgressNotification(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcBatchRequestItem<Req, Not> {
    Request(JsonRpcRequest<Req>),
    Notification(JsonRpcNotification<Not>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcBatchResponseItem<Resp> {
    Response(JsonRpcResponse<Resp>),
    Error(JsonRpcError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcMessage<Req = Request, Resp = JsonObject, Not = Notification> {
    Request(JsonRpcRequest<Req>),
    Response(JsonRpcResponse<Resp>),
    Notification(JsonRpcNotification<Not>),
    BatchRequest(Vec<JsonRpcBatchRequestItem<Req, Not>>),
    BatchResponse(Vec<JsonRpcBatchResponseItem<Resp>>),
    Error(JsonRpcError),
}

impl<Req, Resp, Not> JsonRpcMessage<Req, Resp, Not> {
    #[inline]
    pub const fn request(request: Req, id: RequestId) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id,
            request,
        })
    }
    #[inline]
    pub const fn response(response: Resp, id: RequestId) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id,
            result: response,
        })
    }
    #[inline]
    pub const fn error(error: ErrorData, id: RequestId) -> Self {
        JsonRpcMessage::Error(JsonRpcError {
            jsonrpc: JsonRpcVersion2_0,
            id,
            error,
        })
    }
    #[inline]
    pub const fn notification(notification: Not) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            notification,
        })
    }
    pub fn into_request(self) -> Option<(Req, RequestId)> {
        match self {
            JsonRpcMessage::Request(r) => Some((r.request, r.id)),
            _ => None,
        }
    }
    pub fn into_response(self) -> Option<(Resp, RequestId)> {
        match self {
            JsonRpcMessage::Response(r) => Some((r.result, r.id)),
            _ => None,
        }
    }
    pub fn into_notification(self) -> Option<Not> {
        match self {
            JsonRpcMessage::Notification(n) => Some(n.notification),
            _ => None,
        }
    }
    pub fn into_error(self) -> Option<(ErrorData, RequestId)> {
        match self {
            JsonRpcMessage::Error(e) => Some((e.error, e.id)),
            _ => None,
        }
    }
}

/// A message sent from client to server.
pub type ClientJsonRpcMessage = JsonRpcMessage<ClientRequest, ClientResult, ClientNotification>;
/// A message sent from server to client.
pub type ServerJsonRpcMessage = JsonRpcMessage<ServerRequest, ServerResult, ServerNotification>;

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_protocol_version_order() {
        assert!(ProtocolVersion::V_2024_10_07 < ProtocolVersion::V_2024_11_05);
        assert!(ProtocolVersion::V_2024_11_05 < ProtocolVersion::V_2025_03_26);
        assert_eq!(ProtocolVersion::LATEST, ProtocolVersion::V_2025_03_26);
    }

    #[test]
    fn test_protocol_version_negotiate_known() {
        let picked = ProtocolVersion::negotiate(&ProtocolVersion::V_2024_11_05);
        assert_eq!(picked, ProtocolVersion::V_2024_11_05);
    }

    #[test]
    fn test_protocol_version_negotiate_future() {
        let future = ProtocolVersion(Cow::Borrowed("2099-01-01"));
        let picked = ProtocolVersion::negotiate(&future);
        assert_eq!(picked, ProtocolVersion::LATEST);
    }

    #[test]
    fn test_protocol_version_negotiate_ancient() {
        let ancient = ProtocolVersion(Cow::Borrowed("2020-01-01"));
        let picked = ProtocolVersion::negotiate(&ancient);
        assert_eq!(picked, ProtocolVersion::V_2024_10_07);
        assert!(picked.is_supported());
    }

    #[test]
    fn test_initialize_request_wire_format() {
        let message: ClientJsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": { "name": "c", "version": "1" }
            }
        }))
        .unwrap();
        let (request, id) = message.into_request().unwrap();
        assert_eq!(id, RequestId::Number(1));
        let ClientRequest::InitializeRequest(init) = request else {
            panic!("expected initialize request");
        };
        assert_eq!(init.params.protocol_version, ProtocolVersion::V_2025_03_26);
        assert_eq!(init.params.client_info.name, "c");
    }

    #[test]
    fn test_response_wire_format() {
        let message = ServerJsonRpcMessage::response(
            ServerResult::empty(()),
            RequestId::Number(4),
        );
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 4, "result": {}}));
    }

    #[test]
    fn test_error_wire_format() {
        let raw = json!({
            "jsonrpc": "2.0",
            "id": "req-1",
            "error": { "code": -32601, "message": "Method not found" }
        });
        let message: ServerJsonRpcMessage = serde_json::from_value(raw).unwrap();
        let (error, id) = message.into_error().unwrap();
        assert_eq!(id, RequestId::String("req-1".into()));
        assert_eq!(error.code, ErrorCode::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_notification_distinguished_from_request() {
        let raw = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        });
        let message: ClientJsonRpcMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            message,
            ClientJsonRpcMessage::Notification(JsonRpcNotification {
                notification: ClientNotification::InitializedNotification(_),
                ..
            })
        ));
    }

    #[test]
    fn test_batch_request_wire_format() {
        let raw = json!([
            { "jsonrpc": "2.0", "id": 1, "method": "ping" },
            { "jsonrpc": "2.0", "method": "notifications/initialized" }
        ]);
        let message: ClientJsonRpcMessage = serde_json::from_value(raw).unwrap();
        let ClientJsonRpcMessage::BatchRequest(items) = message else {
            panic!("expected batch");
        };
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], JsonRpcBatchRequestItem::Request(_)));
        assert!(matches!(items[1], JsonRpcBatchRequestItem::Notification(_)));
    }

    #[test]
    fn test_cancelled_notification_wire_format() {
        let notification =
            ClientJsonRpcMessage::notification(ClientNotification::CancelledNotification(
                CancelledNotification::new(CancelledNotificationParam {
                    request_id: RequestId::Number(2),
                    reason: Some("Cancelled by test".into()),
                }),
            ));
        let value = serde_json::to_value(&notification).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "method": "notifications/cancelled",
                "params": { "requestId": 2, "reason": "Cancelled by test" }
            })
        );
    }
}
