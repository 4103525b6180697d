use std::borrow::Cow;

use thiserror::Error;

use super::*;
use crate::{
    model::{
        CancelledNotification, CancelledNotificationParam, ClientInfo, ClientJsonRpcMessage,
        ClientNotification, ClientRequest, ClientResult, CreateElicitationRequest,
        CreateElicitationRequestParam, CreateElicitationResult, CreateMessageRequest,
        CreateMessageRequestParam, CreateMessageResult, EmptyResult, ListRootsRequest,
        ListRootsResult, LoggingMessageNotification, LoggingMessageNotificationParam, PingRequest,
        ProgressNotification, ProgressNotificationParam, PromptListChangedNotification,
        ProtocolVersion, ResourceListChangedNotification, ResourceUpdatedNotification,
        ResourceUpdatedNotificationParam, ServerInfo, ServerJsonRpcMessage, ServerNotification,
        ServerRequest, ServerResult, ToolListChangedNotification,
    },
    transport::DynamicTransportError,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleServer;

impl ServiceRole for RoleServer {
    type Req = ServerRequest;
    type Resp = ServerResult;
    type Not = ServerNotification;
    type PeerReq = ClientRequest;
    type PeerResp = ClientResult;
    type PeerNot = ClientNotification;
    type Info = ServerInfo;
    type PeerInfo = ClientInfo;
    type InitializeError = ServerInitializeError;
    const IS_CLIENT: bool = false;

    fn request_method(request: &Self::Req) -> &'static str {
        request.method()
    }

    fn request_permitted(request: &Self::Req, peer_info: &Self::PeerInfo) -> bool {
        peer_info.capabilities.permits(request)
    }

    fn peer_request_method(request: &Self::PeerReq) -> &'static str {
        request.method()
    }

    fn peer_notification_method(notification: &Self::PeerNot) -> &'static str {
        notification.method()
    }
}

/// A handle to the client, from the server's point of view.
pub type ClientSink = Peer<RoleServer>;

#[derive(Error, Debug)]
pub enum ServerInitializeError {
    #[error("expect initialize request, but received: {0:?}")]
    ExpectedInitRequest(Option<ClientJsonRpcMessage>),

    #[error("expect initialized notification, but received: {0:?}")]
    ExpectedInitNotification(Option<ClientJsonRpcMessage>),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Send message error {error}, when {context}")]
    TransportError {
        error: DynamicTransportError,
        context: Cow<'static, str>,
    },

    #[error("Cancelled")]
    Cancelled,
}

impl ServerInitializeError {
    pub fn transport<T: Transport<RoleServer> + 'static>(
        error: T::Error,
        context: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::TransportError {
            error: DynamicTransportError::new::<T, _>(error),
            context: context.into(),
        }
    }
}

impl<S: Service<RoleServer>> ServiceExt<RoleServer> for S {
    fn serve_with_ct<T, E, A>(
        self,
        transport: T,
        ct: CancellationToken,
    ) -> impl Future<Output = Result<RunningService<RoleServer, Self>, ServerInitializeError>> + Send
    where
        T: IntoTransport<RoleServer, E, A>,
        E: std::error::Error + Send + Sync + 'static,
        Self: Sized,
    {
        serve_server_with_ct(self, transport, ct)
    }
}

pub async fn serve_server<S, T, E, A>(
    service: S,
    transport: T,
) -> Result<RunningService<RoleServer, S>, ServerInitializeError>
where
    S: Service<RoleServer>,
    T: IntoTransport<RoleServer, E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    serve_server_with_ct(service, transport, Default::default()).await
}

pub async fn serve_server_with_ct<S, T, E, A>(
    service: S,
    transport: T,
    ct: CancellationToken,
) -> Result<RunningService<RoleServer, S>, ServerInitializeError>
where
    S: Service<RoleServer>,
    T: IntoTransport<RoleServer, E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    tokio::select! {
        result = serve_server_inner(service, transport.into_transport(), ct.clone()) => result,
        _ = ct.cancelled() => Err(ServerInitializeError::Cancelled),
    }
}

async fn serve_server_inner<S, T>(
    service: S,
    mut transport: T,
    ct: CancellationToken,
) -> Result<RunningService<RoleServer, S>, ServerInitializeError>
where
    S: Service<RoleServer>,
    T: Transport<RoleServer> + 'static,
{
    let id_provider = <Arc<AtomicU32RequestIdProvider>>::default();

    let message = transport
        .receive()
        .await
        .ok_or_else(|| ServerInitializeError::ConnectionClosed("initialize request".into()))?;
    let (request, id) = match message {
        ClientJsonRpcMessage::Request(r) => (r.request, r.id),
        other => return Err(ServerInitializeError::ExpectedInitRequest(Some(other))),
    };
    let initialize_request = match request {
        ClientRequest::InitializeRequest(request) => request,
        other => {
            return Err(ServerInitializeError::ExpectedInitRequest(Some(
                ClientJsonRpcMessage::request(other, id),
            )));
        }
    };
    let peer_info = initialize_request.params;

    let mut init_response = service.get_info();
    init_response.protocol_version = ProtocolVersion::negotiate(&peer_info.protocol_version);
    transport
        .send(ServerJsonRpcMessage::response(
            ServerResult::InitializeResult(init_response),
            id,
        ))
        .await
        .map_err(|error| ServerInitializeError::transport::<T>(error, "send initialize response"))?;

    // anything the client fires before `notifications/initialized` is
    // deferred, not rejected; the event loop replays it first
    let mut deferred = Vec::new();
    loop {
        let message = transport.receive().await.ok_or_else(|| {
            ServerInitializeError::ConnectionClosed("initialized notification".into())
        })?;
        match message {
            ClientJsonRpcMessage::Notification(n)
                if matches!(n.notification, ClientNotification::InitializedNotification(_)) =>
            {
                break;
            }
            premature => {
                tracing::debug!(?premature, "deferring message until the handshake completes");
                deferred.push(premature);
            }
        }
    }

    let (peer, peer_rx) = Peer::new(id_provider, Some(peer_info));
    Ok(serve_inner(service, transport, peer, peer_rx, deferred, ct))
}

macro_rules! method {
    (peer_req $method:ident $Req:ident() => $Resp: ident ) => {
        pub async fn $method(&self) -> Result<$Resp, ServiceError> {
            let result = self
                .send_request(ServerRequest::$Req($Req {
                    method: Default::default(),
                    extensions: Default::default(),
                }))
                .await?;
            match result {
                ClientResult::$Resp(result) => Ok(result),
                _ => Err(ServiceError::UnexpectedResponse),
            }
        }
    };
    (peer_req $method:ident $Req:ident($Param: ident) => $Resp: ident ) => {
        pub async fn $method(&self, params: $Param) -> Result<$Resp, ServiceError> {
            let result = self
                .send_request(ServerRequest::$Req($Req {
                    method: Default::default(),
                    params,
                    extensions: Default::default(),
                }))
                .await?;
            match result {
                ClientResult::$Resp(result) => Ok(result),
                _ => Err(ServiceError::UnexpectedResponse),
            }
        }
    };
    (peer_not $method:ident $Not:ident($Param: ident)) => {
        pub async fn $method(&self, params: $Param) -> Result<(), ServiceError> {
            self.send_notification(ServerNotification::$Not($Not {
                method: Default::default(),
                params,
                extensions: Default::default(),
            }))
            .await?;
            Ok(())
        }
    };
    (peer_not $method:ident $Not:ident) => {
        pub async fn $method(&self) -> Result<(), ServiceError> {
            self.send_notification(ServerNotification::$Not($Not {
                method: Default::default(),
                extensions: Default::default(),
            }))
            .await?;
            Ok(())
        }
    };
}

impl Peer<RoleServer> {
    method!(peer_req ping PingRequest() => EmptyResult);
    method!(peer_req create_message CreateMessageRequest(CreateMessageRequestParam) => CreateMessageResult);
    method!(peer_req list_roots ListRootsRequest() => ListRootsResult);
    method!(peer_req create_elicitation CreateElicitationRequest(CreateElicitationRequestParam) => CreateElicitationResult);

    method!(peer_not notify_cancelled CancelledNotification(CancelledNotificationParam));
    method!(peer_not notify_progress ProgressNotification(ProgressNotificationParam));
    method!(peer_not notify_logging_message LoggingMessageNotification(LoggingMessageNotificationParam));
    method!(peer_not notify_resource_updated ResourceUpdatedNotification(ResourceUpdatedNotificationParam));
    method!(peer_not notify_resource_list_changed ResourceListChangedNotification);
    method!(peer_not notify_tool_list_changed ToolListChangedNotification);
    method!(peer_not notify_prompt_list_changed PromptListChangedNotification);
}
