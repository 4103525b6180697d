//! Client side of the streamable HTTP transport: one URL, POST for
//! client→server envelopes (answered directly as JSON or over a
//! per-request SSE stream), GET for the standalone server→client
//! stream, DELETE to end the session.
use std::sync::Arc;

use futures::StreamExt;
pub use sse_stream::Error as SseError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{
    common::client_side_sse::{BoxedSseResponse, SseRetryPolicy},
    worker::{Worker, WorkerContext, WorkerQuitReason, WorkerSendRequest, WorkerTransport},
};
use crate::{
    RoleClient,
    model::{
        ClientJsonRpcMessage, ProtocolVersion, ServerJsonRpcMessage, ServerResult,
    },
};

#[derive(Error, Debug)]
pub enum StreamableHttpError<E: std::error::Error + Send + Sync + 'static> {
    #[error("SSE error: {0}")]
    Sse(#[from] SseError),
    #[error("HTTP client error: {0}")]
    Client(E),
    #[error("unexpected content type: {0:?}")]
    UnexpectedContentType(Option<String>),
    #[error("session not found on server")]
    SessionNotFound,
    #[error("unexpected server response, status {0}")]
    UnexpectedServerResponse(u16),
    #[error("unexpected end of stream")]
    UnexpectedEndOfStream,
    #[error("server does not support the standalone event stream")]
    ServerDoesNotSupportSse,
    #[error("server does not support session deletion")]
    ServerDoesNotSupportDeleteSession,
    #[error("deserialize error: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("tokio join error: {0}")]
    TokioJoinError(#[from] tokio::task::JoinError),
    #[error("transport channel closed")]
    TransportChannelClosed,
}

#[cfg(feature = "__reqwest")]
impl From<reqwest::Error> for StreamableHttpError<reqwest::Error> {
    fn from(e: reqwest::Error) -> Self {
        StreamableHttpError::Client(e)
    }
}

/// Everything a [`StreamableHttpClient`] needs to address one request.
#[derive(Debug, Clone, Default)]
pub struct StreamableHttpRequestContext {
    pub uri: Arc<str>,
    pub session_id: Option<Arc<str>>,
    /// Sent as `MCP-Protocol-Version` once negotiation has happened.
    pub protocol_version: Option<ProtocolVersion>,
    pub auth_token: Option<String>,
}

/// What a POST came back with.
pub enum StreamableHttpPostResponse {
    /// 202, body ignored.
    Accepted,
    /// A direct JSON envelope, plus the session id header if present.
    Json(ServerJsonRpcMessage, Option<String>),
    /// An SSE stream scoped to the posted request.
    Sse(BoxedSseResponse, Option<String>),
}

impl std::fmt::Debug for StreamableHttpPostResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted => f.write_str("Accepted"),
            Self::Json(message, session_id) => {
                f.debug_tuple("Json").field(message).field(session_id).finish()
            }
            Self::Sse(_, session_id) => f.debug_tuple("Sse").field(session_id).finish(),
        }
    }
}

pub trait StreamableHttpClient: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn post_message(
        &self,
        context: StreamableHttpRequestContext,
        message: ClientJsonRpcMessage,
    ) -> impl Future<Output = Result<StreamableHttpPostResponse, StreamableHttpError<Self::Error>>>
    + Send
    + '_;

    fn get_stream(
        &self,
        context: StreamableHttpRequestContext,
        last_event_id: Option<String>,
    ) -> impl Future<Output = Result<BoxedSseResponse, StreamableHttpError<Self::Error>>> + Send + '_;

    fn delete_session(
        &self,
        context: StreamableHttpRequestContext,
    ) -> impl Future<Output = Result<(), StreamableHttpError<Self::Error>>> + Send + '_;
}

type ResumptionTokenCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct StreamableHttpClientTransportConfig {
    pub uri: Arc<str>,
    pub retry_policy: SseRetryPolicy,
    pub channel_buffer_capacity: usize,
    /// Seed for resuming the standalone stream of an earlier session;
    /// replay starts strictly after this event id.
    pub resumption_token: Option<String>,
    /// Observes every event id seen on any stream, so the caller can
    /// persist the newest token for a later resume.
    pub on_resumption_token: Option<ResumptionTokenCallback>,
    /// Some servers never assign a session id; allow operating without
    /// one instead of failing the handshake.
    pub allow_stateless: bool,
}

impl std::fmt::Debug for StreamableHttpClientTransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpClientTransportConfig")
            .field("uri", &self.uri)
            .field("retry_policy", &self.retry_policy)
            .field("channel_buffer_capacity", &self.channel_buffer_capacity)
            .field("resumption_token", &self.resumption_token)
            .field("allow_stateless", &self.allow_stateless)
            .finish()
    }
}

impl Default for StreamableHttpClientTransportConfig {
    fn default() -> Self {
        Self {
            uri: "localhost".into(),
            retry_policy: SseRetryPolicy::default(),
            channel_buffer_capacity: 16,
            resumption_token: None,
            on_resumption_token: None,
            allow_stateless: true,
        }
    }
}

impl StreamableHttpClientTransportConfig {
    pub fn with_uri(uri: impl Into<Arc<str>>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct StreamableHttpClientWorker<C: StreamableHttpClient> {
    pub client: C,
    pub config: StreamableHttpClientTransportConfig,
}

impl<C: StreamableHttpClient> StreamableHttpClientWorker<C> {
    pub fn new(client: C, config: StreamableHttpClientTransportConfig) -> Self {
        Self { client, config }
    }

    fn notify_resumption_token(&self, token: &str) {
        if let Some(on_resumption_token) = &self.config.on_resumption_token {
            on_resumption_token(token);
        }
    }

    /// Pump one SSE stream into the shared inbound channel, resuming
    /// with `Last-Event-ID` whenever it breaks.
    async fn execute_sse_stream(
        self,
        mut sse_stream: BoxedSseResponse,
        mut last_event_id: Option<String>,
        context: StreamableHttpRequestContext,
        messages_tx: tokio::sync::mpsc::Sender<ServerJsonRpcMessage>,
        ct: CancellationToken,
    ) -> Result<(), StreamableHttpError<C::Error>> {
        let mut retry_interval = self.config.retry_policy.min_duration;
        loop {
            let event = tokio::select! {
                event = sse_stream.next() => event,
                _ = ct.cancelled() => {
                    tracing::debug!("sse stream cancelled");
                    break;
                }
            };
            let sse = match event {
                Some(Ok(sse)) => sse,
                Some(Err(error)) => {
                    tracing::warn!(%error, "sse stream broke, resuming");
                    let mut retry_times = 0;
                    sse_stream = loop {
                        tokio::time::sleep(retry_interval).await;
                        retry_times += 1;
                        match self
                            .client
                            .get_stream(context.clone(), last_event_id.clone())
                            .await
                        {
                            Ok(stream) => break stream,
                            Err(error) => {
                                if retry_times
                                    >= self.config.retry_policy.max_times.unwrap_or(usize::MAX)
                                {
                                    tracing::error!(%error, "sse stream resume gave up");
                                    return Err(error);
                                }
                            }
                        }
                    };
                    continue;
                }
                None => {
                    tracing::debug!("sse stream terminated");
                    break;
                }
            };
            if let Some(server_retry_ms) = sse.retry {
                retry_interval =
                    retry_interval.min(std::time::Duration::from_millis(server_retry_ms));
            }
            if let Some(data) = &sse.data {
                match serde_json::from_slice::<ServerJsonRpcMessage>(data.as_bytes()) {
                    Ok(message) => {
                        if messages_tx.send(message).await.is_err() {
                            tracing::trace!("transport handler dropped, stopping stream");
                            break;
                        }
                    }
                    Err(error) => tracing::warn!(%error, "failed to deserialize server message"),
                }
            }
            if let Some(id) = sse.id {
                self.notify_resumption_token(&id);
                last_event_id = Some(id);
            }
        }
        Ok(())
    }

    /// POST the stored `initialize` request and pull its response out of
    /// whichever body shape the server picked.
    async fn post_initialize(
        &self,
        initialize_request: &ClientJsonRpcMessage,
    ) -> Result<(ServerJsonRpcMessage, Option<Arc<str>>), StreamableHttpError<C::Error>> {
        let context = StreamableHttpRequestContext {
            uri: self.config.uri.clone(),
            session_id: None,
            protocol_version: None,
            auth_token: None,
        };
        let response = self
            .client
            .post_message(context, initialize_request.clone())
            .await?;
        match response {
            StreamableHttpPostResponse::Json(message, session_id) => {
                Ok((message, session_id.map(Into::into)))
            }
            StreamableHttpPostResponse::Sse(mut stream, session_id) => {
                // the response envelope is the first message event
                let message = loop {
                    let sse = stream
                        .next()
                        .await
                        .ok_or(StreamableHttpError::UnexpectedEndOfStream)??;
                    if let Some(data) = sse.data {
                        break serde_json::from_slice::<ServerJsonRpcMessage>(data.as_bytes())?;
                    }
                };
                Ok((message, session_id.map(Into::into)))
            }
            StreamableHttpPostResponse::Accepted => {
                Err(StreamableHttpError::UnexpectedServerResponse(202))
            }
        }
    }
}

fn negotiated_version(message: &ServerJsonRpcMessage) -> Option<ProtocolVersion> {
    match message {
        ServerJsonRpcMessage::Response(response) => match &response.result {
            ServerResult::InitializeResult(result) => Some(result.protocol_version.clone()),
            _ => None,
        },
        _ => None,
    }
}

impl<C: StreamableHttpClient> Worker for StreamableHttpClientWorker<C> {
    type Role = RoleClient;
    type Error = StreamableHttpError<C::Error>;

    fn err_closed() -> Self::Error {
        StreamableHttpError::TransportChannelClosed
    }
    fn err_join(e: tokio::task::JoinError) -> Self::Error {
        StreamableHttpError::TokioJoinError(e)
    }
    fn config(&self) -> super::worker::WorkerConfig {
        super::worker::WorkerConfig {
            name: Some("streamable-http-client".into()),
            channel_buffer_capacity: self.config.channel_buffer_capacity,
        }
    }

    async fn run(self, mut context: WorkerContext<Self>) -> Result<(), WorkerQuitReason> {
        let (messages_tx, mut messages_rx) =
            tokio::sync::mpsc::channel::<ServerJsonRpcMessage>(self.config.channel_buffer_capacity);
        let ct = context.cancellation_token.clone();
        let _drop_guard = ct.clone().drop_guard();

        // --- handshake ---------------------------------------------------
        let WorkerSendRequest {
            message: initialize_request,
            responder,
        } = context.recv_from_handler().await?;
        let _ = responder.send(Ok(()));
        let (response, mut session_id) = self
            .post_initialize(&initialize_request)
            .await
            .map_err(WorkerQuitReason::fatal_context("send initialize request"))?;
        if session_id.is_none() && !self.config.allow_stateless {
            return Err(WorkerQuitReason::fatal(
                "missing session id in initialize response",
                "process initialize response",
            ));
        }
        let mut protocol_version = negotiated_version(&response);
        context.send_to_handler(response).await?;

        let request_context = |session_id: &Option<Arc<str>>,
                               protocol_version: &Option<ProtocolVersion>| {
            StreamableHttpRequestContext {
                uri: self.config.uri.clone(),
                session_id: session_id.clone(),
                protocol_version: protocol_version.clone(),
                auth_token: None,
            }
        };

        let initialized_notification = context.recv_from_handler().await?;
        let accepted = self
            .client
            .post_message(
                request_context(&session_id, &protocol_version),
                initialized_notification.message.clone(),
            )
            .await
            .map_err(WorkerQuitReason::fatal_context(
                "send initialized notification",
            ))?;
        if !matches!(accepted, StreamableHttpPostResponse::Accepted) {
            return Err(WorkerQuitReason::fatal(
                "initialized notification not accepted",
                "send initialized notification",
            ));
        }
        let _ = initialized_notification.responder.send(Ok(()));
        let initialized_notification = initialized_notification.message;

        // delete the session on shutdown
        if session_id.is_some() {
            let client = self.client.clone();
            let delete_context = request_context(&session_id, &protocol_version);
            let ct = ct.clone();
            tokio::spawn(async move {
                ct.cancelled().await;
                match client.delete_session(delete_context).await {
                    Ok(()) => tracing::info!("session deleted"),
                    Err(StreamableHttpError::ServerDoesNotSupportDeleteSession) => {
                        tracing::debug!("server does not support session deletion")
                    }
                    Err(error) => tracing::warn!(%error, "failed to delete session"),
                }
            });
        }

        // --- standalone server→client stream -----------------------------
        let mut streams = tokio::task::JoinSet::new();
        if session_id.is_some() {
            match self
                .client
                .get_stream(
                    request_context(&session_id, &protocol_version),
                    self.config.resumption_token.clone(),
                )
                .await
            {
                Ok(stream) => {
                    streams.spawn(self.clone().execute_sse_stream(
                        stream,
                        self.config.resumption_token.clone(),
                        request_context(&session_id, &protocol_version),
                        messages_tx.clone(),
                        ct.child_token(),
                    ));
                }
                Err(StreamableHttpError::ServerDoesNotSupportSse) => {
                    tracing::debug!("server does not offer a standalone event stream");
                }
                Err(error) => {
                    tracing::error!(%error, "failed to open the standalone event stream");
                    return Err(WorkerQuitReason::fatal(
                        error.to_string(),
                        "open standalone event stream",
                    ));
                }
            }
        }

        // --- main loop ----------------------------------------------------
        enum Event<W: Worker> {
            FromHandler(WorkerSendRequest<W>),
            ServerMessage(ServerJsonRpcMessage),
            StreamFinished,
        }
        loop {
            let event = tokio::select! {
                _ = ct.cancelled() => return Err(WorkerQuitReason::Cancelled),
                from_handler = context.recv_from_handler() => Event::FromHandler(from_handler?),
                message = messages_rx.recv() => match message {
                    Some(message) => Event::ServerMessage(message),
                    None => return Err(WorkerQuitReason::HandlerTerminated),
                },
                finished = streams.join_next(), if !streams.is_empty() => {
                    if let Some(Ok(Err(error))) = finished {
                        tracing::warn!(%error, "sse stream task finished with error");
                    }
                    Event::StreamFinished
                }
            };
            match event {
                Event::FromHandler(WorkerSendRequest { message, responder }) => {
                    let mut response = self
                        .client
                        .post_message(
                            request_context(&session_id, &protocol_version),
                            message.clone(),
                        )
                        .await;
                    // a 404 under a live session means the server dropped
                    // it: start over with the stored handshake and replay
                    // the message on the fresh session
                    if matches!(response, Err(StreamableHttpError::SessionNotFound))
                        && session_id.is_some()
                    {
                        tracing::info!("session expired, re-initializing");
                        let reinit = async {
                            let (response, new_session) =
                                self.post_initialize(&initialize_request).await?;
                            let new_version = negotiated_version(&response);
                            let accepted = self
                                .client
                                .post_message(
                                    request_context(&new_session, &new_version),
                                    initialized_notification.clone(),
                                )
                                .await?;
                            if !matches!(accepted, StreamableHttpPostResponse::Accepted) {
                                return Err(StreamableHttpError::UnexpectedServerResponse(200));
                            }
                            Ok::<_, StreamableHttpError<C::Error>>((new_session, new_version))
                        }
                        .await;
                        match reinit {
                            Ok((new_session, new_version)) => {
                                session_id = new_session;
                                protocol_version = new_version;
                                response = self
                                    .client
                                    .post_message(
                                        request_context(&session_id, &protocol_version),
                                        message,
                                    )
                                    .await;
                            }
                            Err(error) => {
                                tracing::error!(%error, "re-initialization failed");
                                response = Err(error);
                            }
                        }
                    }
                    let send_result = match response {
                        Err(error) => Err(error),
                        Ok(StreamableHttpPostResponse::Accepted) => Ok(()),
                        Ok(StreamableHttpPostResponse::Json(message, _)) => {
                            context.send_to_handler(message).await?;
                            Ok(())
                        }
                        Ok(StreamableHttpPostResponse::Sse(stream, _)) => {
                            streams.spawn(self.clone().execute_sse_stream(
                                stream,
                                None,
                                request_context(&session_id, &protocol_version),
                                messages_tx.clone(),
                                ct.child_token(),
                            ));
                            Ok(())
                        }
                    };
                    let _ = responder.send(send_result);
                }
                Event::ServerMessage(message) => {
                    context.send_to_handler(message).await?;
                }
                Event::StreamFinished => {}
            }
        }
    }
}

pub type StreamableHttpClientTransport<C> = WorkerTransport<StreamableHttpClientWorker<C>>;

impl<C: StreamableHttpClient> StreamableHttpClientTransport<C> {
    pub fn with_client(client: C, config: StreamableHttpClientTransportConfig) -> Self {
        WorkerTransport::spawn(StreamableHttpClientWorker::new(client, config))
    }
}

#[cfg(feature = "__reqwest")]
impl<C: StreamableHttpClient + Default> StreamableHttpClientTransport<C> {
    /// Connect to a URL with a default-constructed HTTP client.
    pub fn from_uri(uri: impl Into<Arc<str>>) -> Self {
        Self::with_client(
            C::default(),
            StreamableHttpClientTransportConfig::with_uri(uri),
        )
    }
}

#[cfg(feature = "__reqwest")]
mod reqwest_impl {
    use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};

    use super::*;
    use crate::transport::common::http_header::{
        EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID,
        JSON_MIME_TYPE,
    };

    /// Both `reqwest::Client` and the middleware-wrapped client expose
    /// the same builder surface, so one macro serves both.
    macro_rules! impl_streamable_http_client {
        ($client:ty, $error:ty) => {
            impl StreamableHttpClient for $client {
                type Error = $error;

                async fn post_message(
                    &self,
                    context: StreamableHttpRequestContext,
                    message: ClientJsonRpcMessage,
                ) -> Result<StreamableHttpPostResponse, StreamableHttpError<Self::Error>> {
                    let mut request = self
                        .post(context.uri.as_ref())
                        .header(ACCEPT, [JSON_MIME_TYPE, EVENT_STREAM_MIME_TYPE].join(", "))
                        .header(CONTENT_TYPE, JSON_MIME_TYPE);
                    if let Some(session_id) = context.session_id.as_deref() {
                        request = request.header(HEADER_SESSION_ID, session_id);
                    }
                    if let Some(version) = &context.protocol_version {
                        request = request.header(HEADER_PROTOCOL_VERSION, version.as_str());
                    }
                    if let Some(auth_token) = &context.auth_token {
                        request = request.header(AUTHORIZATION, format!("Bearer {auth_token}"));
                    }
                    let response = request
                        .json(&message)
                        .send()
                        .await
                        .map_err(|e| StreamableHttpError::Client(<$error>::from(e)))?;
                    if response.status() == reqwest::StatusCode::ACCEPTED {
                        return Ok(StreamableHttpPostResponse::Accepted);
                    }
                    if response.status() == reqwest::StatusCode::NOT_FOUND {
                        return Err(StreamableHttpError::SessionNotFound);
                    }
                    if let Err(error) = response.error_for_status_ref() {
                        return Err(StreamableHttpError::Client(<$error>::from(error)));
                    }
                    let session_id = response
                        .headers()
                        .get(HEADER_SESSION_ID)
                        .and_then(|v| v.to_str().ok())
                        .map(ToOwned::to_owned);
                    let content_type = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok());
                    match content_type {
                        Some(ct) if ct.starts_with(EVENT_STREAM_MIME_TYPE) => {
                            let stream =
                                sse_stream::SseStream::from_byte_stream(response.bytes_stream())
                                    .boxed();
                            Ok(StreamableHttpPostResponse::Sse(stream, session_id))
                        }
                        Some(ct) if ct.starts_with(JSON_MIME_TYPE) => {
                            let message: ServerJsonRpcMessage =
                                response.json().await.map_err(|e| StreamableHttpError::Client(<$error>::from(e)))?;
                            Ok(StreamableHttpPostResponse::Json(message, session_id))
                        }
                        other => Err(StreamableHttpError::UnexpectedContentType(
                            other.map(ToOwned::to_owned),
                        )),
                    }
                }

                async fn get_stream(
                    &self,
                    context: StreamableHttpRequestContext,
                    last_event_id: Option<String>,
                ) -> Result<BoxedSseResponse, StreamableHttpError<Self::Error>> {
                    let mut request = self
                        .get(context.uri.as_ref())
                        .header(ACCEPT, EVENT_STREAM_MIME_TYPE);
                    if let Some(session_id) = context.session_id.as_deref() {
                        request = request.header(HEADER_SESSION_ID, session_id);
                    }
                    if let Some(version) = &context.protocol_version {
                        request = request.header(HEADER_PROTOCOL_VERSION, version.as_str());
                    }
                    if let Some(last_event_id) = last_event_id {
                        request = request.header(HEADER_LAST_EVENT_ID, last_event_id);
                    }
                    if let Some(auth_token) = &context.auth_token {
                        request = request.header(AUTHORIZATION, format!("Bearer {auth_token}"));
                    }
                    let response = request.send().await.map_err(|e| StreamableHttpError::Client(<$error>::from(e)))?;
                    if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED
                        || response.status() == reqwest::StatusCode::NOT_FOUND
                    {
                        return Err(StreamableHttpError::ServerDoesNotSupportSse);
                    }
                    if let Err(error) = response.error_for_status_ref() {
                        return Err(StreamableHttpError::Client(<$error>::from(error)));
                    }
                    let content_type = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok());
                    if !content_type.is_some_and(|ct| ct.starts_with(EVENT_STREAM_MIME_TYPE)) {
                        return Err(StreamableHttpError::UnexpectedContentType(
                            content_type.map(ToOwned::to_owned),
                        ));
                    }
                    Ok(sse_stream::SseStream::from_byte_stream(response.bytes_stream()).boxed())
                }

                async fn delete_session(
                    &self,
                    context: StreamableHttpRequestContext,
                ) -> Result<(), StreamableHttpError<Self::Error>> {
                    let Some(session_id) = context.session_id.as_deref() else {
                        return Ok(());
                    };
                    let mut request = self
                        .delete(context.uri.as_ref())
                        .header(HEADER_SESSION_ID, session_id);
                    if let Some(version) = &context.protocol_version {
                        request = request.header(HEADER_PROTOCOL_VERSION, version.as_str());
                    }
                    if let Some(auth_token) = &context.auth_token {
                        request = request.header(AUTHORIZATION, format!("Bearer {auth_token}"));
                    }
                    let response = request.send().await.map_err(|e| StreamableHttpError::Client(<$error>::from(e)))?;
                    if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
                        return Err(StreamableHttpError::ServerDoesNotSupportDeleteSession);
                    }
                    if let Err(error) = response.error_for_status_ref() {
                        return Err(StreamableHttpError::Client(<$error>::from(error)));
                    }
                    Ok(())
                }
            }
        };
    }

    impl_streamable_http_client!(reqwest::Client, reqwest::Error);
    #[cfg(feature = "middleware")]
    impl_streamable_http_client!(
        reqwest_middleware::ClientWithMiddleware,
        reqwest_middleware::Error
    );
}
