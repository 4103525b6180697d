//! Server side of the streamable HTTP transport, as a
//! [`tower_service::Service`] over plain `http` types so it mounts into
//! any hyper-compatible stack (axum's `Router::fallback_service`, a
//! bare hyper server, etc.).
pub mod event_store;
pub mod session;

use std::{convert::Infallible, sync::Arc, time::Duration};

use futures::StreamExt;
use http::{Method, Request, StatusCode, header};

use self::session::{SessionError, SessionManager};
use crate::{
    RoleServer, Service,
    model::{
        ClientJsonRpcMessage, ClientRequest, JsonRpcBatchRequestItem, JsonRpcMessage,
        ProtocolVersion, RequestId, ServerJsonRpcMessage,
    },
    service::serve_directly,
    transport::{
        OneshotTransport, TransportAdapterIdentity,
        common::{
            http_header::{
                EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_PROTOCOL_VERSION,
                HEADER_SESSION_ID, JSON_MIME_TYPE,
            },
            server_side_http::{
                BoxResponse, DnsRebindingProtection, ServerSseMessage, accepted_response,
                empty_response, json_response, problem_response, sse_stream_response,
            },
        },
    },
};

#[derive(Debug, Clone)]
pub struct StreamableHttpServerConfig {
    /// Interval of `:ping` comments on idle SSE streams.
    pub sse_keep_alive: Option<Duration>,
    /// With stateful mode off, every POST runs against a throwaway
    /// service instance and no session ids are issued.
    pub stateful_mode: bool,
    /// Answer request POSTs with a plain JSON body instead of an SSE
    /// stream. Intermediate server→client traffic then goes over the
    /// standalone stream only.
    pub json_response_mode: bool,
    /// Host/Origin allowlists; permissive when left at default.
    pub dns_protection: DnsRebindingProtection,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive: Some(Duration::from_secs(15)),
            stateful_mode: true,
            json_response_mode: false,
            dns_protection: DnsRebindingProtection::default(),
        }
    }
}

pub struct StreamableHttpService<S, M = session::local::LocalSessionManager> {
    pub config: StreamableHttpServerConfig,
    session_manager: Arc<M>,
    service_factory: Arc<dyn Fn() -> Result<S, std::io::Error> + Send + Sync>,
}

impl<S, M> Clone for StreamableHttpService<S, M> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            session_manager: self.session_manager.clone(),
            service_factory: self.service_factory.clone(),
        }
    }
}

impl<S, M> StreamableHttpService<S, M>
where
    S: Service<RoleServer> + Send + 'static,
    M: SessionManager,
{
    pub fn new(
        service_factory: impl Fn() -> Result<S, std::io::Error> + Send + Sync + 'static,
        session_manager: Arc<M>,
        config: StreamableHttpServerConfig,
    ) -> Self {
        Self {
            config,
            session_manager,
            service_factory: Arc::new(service_factory),
        }
    }

    fn get_service(&self) -> Result<S, std::io::Error> {
        (self.service_factory)()
    }

    pub async fn handle<B>(&self, request: Request<B>) -> BoxResponse
    where
        B: http_body::Body + Send + 'static,
        B::Error: std::fmt::Display,
    {
        if !self.config.dns_protection.permits(request.headers()) {
            return problem_response(StatusCode::FORBIDDEN, "Forbidden: host or origin not allowed");
        }
        if let Some(version) = request
            .headers()
            .get(HEADER_PROTOCOL_VERSION)
            .and_then(|v| v.to_str().ok())
        {
            let version = ProtocolVersion::from(version.to_string());
            if !version.is_supported() {
                return problem_response(
                    StatusCode::BAD_REQUEST,
                    "Bad Request: unsupported MCP-Protocol-Version",
                );
            }
        }
        let method = request.method().clone();
        if method == Method::POST {
            self.handle_post(request).await
        } else if method == Method::GET {
            self.handle_get(request).await
        } else if method == Method::DELETE {
            self.handle_delete(request).await
        } else {
            problem_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
        }
    }

    fn session_id_of<B>(request: &Request<B>) -> Option<session::SessionId> {
        request
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_owned().into())
    }

    async fn handle_get<B>(&self, request: Request<B>) -> BoxResponse {
        if !self.config.stateful_mode {
            return problem_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "Method Not Allowed: no server event stream in stateless mode",
            );
        }
        let accept = request
            .headers()
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok());
        if !accept.is_some_and(|accept| accept.contains(EVENT_STREAM_MIME_TYPE)) {
            return problem_response(
                StatusCode::NOT_ACCEPTABLE,
                "Not Acceptable: client must accept text/event-stream",
            );
        }
        let Some(session_id) = Self::session_id_of(&request) else {
            return problem_response(StatusCode::BAD_REQUEST, "Bad Request: missing session id");
        };
        let last_event_id = request
            .headers()
            .get(HEADER_LAST_EVENT_ID)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        match last_event_id {
            Some(last_event_id) => {
                tracing::debug!(%session_id, %last_event_id, "resuming event stream");
                match self.session_manager.resume(&session_id, last_event_id).await {
                    Ok(stream) => sse_stream_response(stream, self.config.sse_keep_alive),
                    Err(error) => session_error_response(error),
                }
            }
            None => {
                tracing::debug!(%session_id, "opening standalone event stream");
                match self.session_manager.create_standalone_stream(&session_id).await {
                    Ok(stream) => sse_stream_response(stream, self.config.sse_keep_alive),
                    Err(error) => session_error_response(error),
                }
            }
        }
    }

    async fn handle_delete<B>(&self, request: Request<B>) -> BoxResponse {
        if !self.config.stateful_mode {
            return problem_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }
        let Some(session_id) = Self::session_id_of(&request) else {
            return problem_response(StatusCode::BAD_REQUEST, "Bad Request: missing session id");
        };
        match self.session_manager.close_session(&session_id).await {
            Ok(()) => {
                tracing::info!(%session_id, "session closed");
                empty_response(StatusCode::NO_CONTENT)
            }
            Err(error) => session_error_response(error),
        }
    }

    async fn handle_post<B>(&self, request: Request<B>) -> BoxResponse
    where
        B: http_body::Body + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let accept = request
            .headers()
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok());
        if !accept.is_some_and(|accept| {
            accept.contains(JSON_MIME_TYPE) && accept.contains(EVENT_STREAM_MIME_TYPE)
        }) {
            return problem_response(
                StatusCode::NOT_ACCEPTABLE,
                "Not Acceptable: client must accept both application/json and text/event-stream",
            );
        }
        let content_type = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        if !content_type.is_some_and(|ct| ct.starts_with(JSON_MIME_TYPE)) {
            return problem_response(
                StatusCode::BAD_REQUEST,
                "Bad Request: Content-Type must be application/json",
            );
        }
        let session_id = Self::session_id_of(&request);
        let body = match http_body_util::BodyExt::collect(request.into_body()).await {
            Ok(collected) => collected.to_bytes(),
            Err(error) => {
                tracing::warn!(%error, "failed to read request body");
                return problem_response(StatusCode::BAD_REQUEST, "Bad Request: unreadable body");
            }
        };
        let message: ClientJsonRpcMessage = match serde_json::from_slice(&body) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, "failed to parse request body");
                return problem_response(StatusCode::BAD_REQUEST, "Bad Request: invalid JSON-RPC");
            }
        };

        if !self.config.stateful_mode {
            return self.handle_post_stateless(message).await;
        }

        // flatten batches; request count decides the response shape
        let (messages, request_ids) = split_message(message);
        match session_id {
            Some(session_id) => {
                if request_ids.is_empty() {
                    match self
                        .session_manager
                        .accept_messages(&session_id, messages)
                        .await
                    {
                        Ok(()) => accepted_response(),
                        Err(error) => session_error_response(error),
                    }
                } else {
                    match self.session_manager.create_stream(&session_id, messages).await {
                        Ok(stream) => {
                            if self.config.json_response_mode {
                                collect_json_responses(stream, request_ids).await
                            } else {
                                sse_stream_response(stream, self.config.sse_keep_alive)
                            }
                        }
                        Err(error) => session_error_response(error),
                    }
                }
            }
            None => self.handle_initialize_post(messages, request_ids).await,
        }
    }

    /// The first POST of a session: exactly one request, and it must be
    /// `initialize`.
    async fn handle_initialize_post(
        &self,
        mut messages: Vec<ClientJsonRpcMessage>,
        request_ids: Vec<RequestId>,
    ) -> BoxResponse {
        let is_initialize = request_ids.len() == 1
            && messages.len() == 1
            && matches!(
                messages.first(),
                Some(JsonRpcMessage::Request(r))
                    if matches!(r.request, ClientRequest::InitializeRequest(_))
            );
        if !is_initialize {
            return problem_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Unprocessable Entity: expected an initialize request",
            );
        }
        let message = messages.remove(0);

        let (session_id, transport) = match self.session_manager.create_session().await {
            Ok(created) => created,
            Err(error) => return session_error_response(error),
        };
        tracing::info!(%session_id, "created new session");
        let service = match self.get_service() {
            Ok(service) => service,
            Err(error) => {
                tracing::error!(%error, "service factory failed");
                return problem_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        };
        // drive the session's service for as long as the session lives
        tokio::spawn({
            let session_manager = self.session_manager.clone();
            let session_id = session_id.clone();
            async move {
                match crate::service::serve_server::<S, M::Transport, _, TransportAdapterIdentity>(
                    service, transport,
                )
                .await
                {
                    Ok(running) => {
                        let _ = running.waiting().await;
                    }
                    Err(error) => {
                        tracing::error!(%error, "failed to serve session");
                    }
                }
                if let Err(error) = session_manager.close_session(&session_id).await {
                    tracing::debug!(%error, "session already gone");
                }
            }
        });

        let response = match self
            .session_manager
            .initialize_session(&session_id, message)
            .await
        {
            Ok(response) => response,
            Err(error) => return session_error_response(error),
        };
        let mut http_response = json_response(&response);
        if let Ok(header_value) = session_id.parse() {
            http_response
                .headers_mut()
                .insert(HEADER_SESSION_ID, header_value);
        }
        http_response
    }

    async fn handle_post_stateless(&self, message: ClientJsonRpcMessage) -> BoxResponse {
        match message {
            // without sessions there is no handshake to run; answer
            // `initialize` straight from the service info
            JsonRpcMessage::Request(request)
                if matches!(request.request, ClientRequest::InitializeRequest(_)) =>
            {
                let ClientRequest::InitializeRequest(initialize_request) = request.request else {
                    unreachable!("matched above");
                };
                let service = match self.get_service() {
                    Ok(service) => service,
                    Err(error) => {
                        tracing::error!(%error, "service factory failed");
                        return problem_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Internal Server Error",
                        );
                    }
                };
                let mut info = service.get_info();
                info.protocol_version =
                    ProtocolVersion::negotiate(&initialize_request.params.protocol_version);
                json_response(&ServerJsonRpcMessage::response(
                    crate::model::ServerResult::InitializeResult(info),
                    request.id,
                ))
            }
            JsonRpcMessage::Notification(_) => accepted_response(),
            JsonRpcMessage::Request(request) => {
                let service = match self.get_service() {
                    Ok(service) => service,
                    Err(error) => {
                        tracing::error!(%error, "service factory failed");
                        return problem_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Internal Server Error",
                        );
                    }
                };
                let (transport, mut receiver) =
                    OneshotTransport::<RoleServer>::new(JsonRpcMessage::Request(request));
                let running = serve_directly(service, transport, None);
                let ct = running.cancellation_token();
                tokio::spawn(async move {
                    let _ = running.waiting().await;
                });
                let stream = futures::stream::poll_fn(move |cx| receiver.poll_recv(cx))
                    .map(move |message| {
                        // the only response terminates the session
                        if matches!(
                            message,
                            ServerJsonRpcMessage::Response(_) | ServerJsonRpcMessage::Error(_)
                        ) {
                            ct.cancel();
                        }
                        ServerSseMessage {
                            event_id: None,
                            message: Arc::new(message),
                        }
                    });
                sse_stream_response(stream, self.config.sse_keep_alive)
            }
            _ => problem_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Unprocessable Entity: stateless mode only accepts requests",
            ),
        }
    }
}

fn session_error_response(error: SessionError) -> BoxResponse {
    let status =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    tracing::debug!(%error, %status, "session operation failed");
    empty_response(status)
}

/// Flatten one POST body into individual messages, collecting the ids
/// of contained requests (in body order).
fn split_message(message: ClientJsonRpcMessage) -> (Vec<ClientJsonRpcMessage>, Vec<RequestId>) {
    match message {
        JsonRpcMessage::BatchRequest(items) => {
            let mut ids = Vec::new();
            let messages = items
                .into_iter()
                .map(|item| match item {
                    JsonRpcBatchRequestItem::Request(r) => {
                        ids.push(r.id.clone());
                        JsonRpcMessage::Request(r)
                    }
                    JsonRpcBatchRequestItem::Notification(n) => JsonRpcMessage::Notification(n),
                })
                .collect();
            (messages, ids)
        }
        JsonRpcMessage::BatchResponse(items) => (
            items
                .into_iter()
                .map(|item| match item {
                    crate::model::JsonRpcBatchResponseItem::Response(r) => {
                        JsonRpcMessage::Response(r)
                    }
                    crate::model::JsonRpcBatchResponseItem::Error(e) => JsonRpcMessage::Error(e),
                })
                .collect(),
            Vec::new(),
        ),
        JsonRpcMessage::Request(request) => {
            let id = request.id.clone();
            (vec![JsonRpcMessage::Request(request)], vec![id])
        }
        other => (vec![other], Vec::new()),
    }
}

/// JSON response mode: wait for every response on the stream, then
/// answer with one object (single request) or an array in request
/// order.
async fn collect_json_responses(
    stream: impl futures::Stream<Item = ServerSseMessage> + Send,
    request_ids: Vec<RequestId>,
) -> BoxResponse {
    use std::collections::HashMap;
    let mut responses: HashMap<RequestId, Arc<ServerJsonRpcMessage>> = HashMap::new();
    let mut stream = std::pin::pin!(stream);
    while responses.len() < request_ids.len() {
        let Some(event) = stream.next().await else {
            break;
        };
        let id = match event.message.as_ref() {
            ServerJsonRpcMessage::Response(response) => Some(response.id.clone()),
            ServerJsonRpcMessage::Error(error) => Some(error.id.clone()),
            _ => None,
        };
        if let Some(id) = id {
            responses.insert(id, event.message);
        }
    }
    if request_ids.len() == 1 {
        match responses.remove(&request_ids[0]) {
            Some(message) => json_response(&message),
            None => problem_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error: request produced no response",
            ),
        }
    } else {
        let batch: Vec<_> = request_ids
            .iter()
            .filter_map(|id| responses.remove(id))
            .collect();
        let body = serde_json::to_vec(&batch).unwrap_or_else(|_| b"[]".to_vec());
        http::Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, JSON_MIME_TYPE)
            .body(http_body_util::BodyExt::boxed_unsync(
                http_body_util::Full::new(bytes::Bytes::from(body)),
            ))
            .expect("valid response")
    }
}

impl<S, M, B> tower_service::Service<Request<B>> for StreamableHttpService<S, M>
where
    S: Service<RoleServer> + Send + 'static,
    M: SessionManager,
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::fmt::Display,
{
    type Response = BoxResponse;
    type Error = Infallible;
    type Future =
        std::pin::Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(request).await) })
    }
}
