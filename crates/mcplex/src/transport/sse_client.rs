//! Client side of the legacy two-endpoint SSE transport: a GET opens
//! the server→client stream, whose first `endpoint` event names the URL
//! to POST client→server envelopes to.
//!
//! Reference: <https://html.spec.whatwg.org/multipage/server-sent-events.html>
use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use sse_stream::{Error as SseError, Sse};
use thiserror::Error;

use super::{
    common::client_side_sse::{BoxedSseResponse, SseRetryPolicy},
    worker::{Worker, WorkerContext, WorkerQuitReason, WorkerSendRequest, WorkerTransport},
};
use crate::{
    RoleClient,
    model::{ClientJsonRpcMessage, ServerJsonRpcMessage},
};

#[derive(Error, Debug)]
pub enum SseTransportError<E: std::error::Error + Send + Sync + 'static> {
    #[error("SSE error: {0}")]
    Sse(#[from] SseError),
    #[error("HTTP client error: {0}")]
    Client(E),
    #[error("unexpected content type: {0:?}")]
    UnexpectedContentType(Option<String>),
    #[error("unexpected end of stream")]
    UnexpectedEndOfStream,
    #[error("tokio join error: {0}")]
    TokioJoinError(#[from] tokio::task::JoinError),
    #[error("transport terminated")]
    TransportTerminated,
}

#[cfg(feature = "__reqwest")]
impl From<reqwest::Error> for SseTransportError<reqwest::Error> {
    fn from(e: reqwest::Error) -> Self {
        SseTransportError::Client(e)
    }
}

pub trait SseClient: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn post_message(
        &self,
        uri: Arc<str>,
        message: ClientJsonRpcMessage,
        auth_token: Option<String>,
    ) -> impl Future<Output = Result<(), SseTransportError<Self::Error>>> + Send + '_;

    fn get_stream(
        &self,
        uri: Arc<str>,
        last_event_id: Option<String>,
        auth_token: Option<String>,
    ) -> impl Future<Output = Result<BoxedSseResponse, SseTransportError<Self::Error>>> + Send + '_;
}

#[derive(Debug, Clone)]
pub struct SseClientConfig {
    /// The URL of the SSE endpoint (`GET`, `text/event-stream`).
    pub uri: Arc<str>,
    pub retry_policy: SseRetryPolicy,
}

impl Default for SseClientConfig {
    fn default() -> Self {
        Self {
            uri: "localhost".into(),
            retry_policy: SseRetryPolicy::default(),
        }
    }
}

impl SseClientConfig {
    pub fn with_uri(uri: impl Into<Arc<str>>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SseClientWorker<C: SseClient> {
    pub client: C,
    pub config: SseClientConfig,
}

impl<C: SseClient> SseClientWorker<C> {
    pub fn new(client: C, config: SseClientConfig) -> Self {
        Self { client, config }
    }
}

/// The endpoint event's data is a URL relative to the SSE endpoint's
/// origin, usually carrying a `sessionId` query parameter.
fn resolve_endpoint(sse_uri: &str, endpoint: &str) -> Arc<str> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.into();
    }
    // keep scheme://host[:port], replace path and query
    let origin_end = sse_uri
        .find("://")
        .map(|scheme| {
            sse_uri[scheme + 3..]
                .find('/')
                .map(|p| scheme + 3 + p)
                .unwrap_or(sse_uri.len())
        })
        .unwrap_or(sse_uri.len());
    let origin = &sse_uri[..origin_end];
    format!("{}/{}", origin.trim_end_matches('/'), endpoint.trim_start_matches('/')).into()
}

impl<C: SseClient> Worker for SseClientWorker<C> {
    type Role = RoleClient;
    type Error = SseTransportError<C::Error>;

    fn err_closed() -> Self::Error {
        SseTransportError::TransportTerminated
    }
    fn err_join(e: tokio::task::JoinError) -> Self::Error {
        SseTransportError::TokioJoinError(e)
    }
    fn config(&self) -> super::worker::WorkerConfig {
        super::worker::WorkerConfig {
            name: Some("sse-client".into()),
            ..Default::default()
        }
    }

    async fn run(self, mut context: WorkerContext<Self>) -> Result<(), WorkerQuitReason> {
        let mut sse_stream = self
            .client
            .get_stream(self.config.uri.clone(), None, None)
            .await
            .map_err(WorkerQuitReason::fatal_context("get sse stream"))?;

        // the first thing on the stream must be the endpoint event
        let endpoint = loop {
            let sse = sse_stream
                .next()
                .await
                .ok_or_else(|| {
                    WorkerQuitReason::fatal("unexpected end of stream", "wait for endpoint event")
                })?
                .map_err(WorkerQuitReason::fatal_context("wait for endpoint event"))?;
            let Some("endpoint") = sse.event.as_deref() else {
                continue;
            };
            let Some(endpoint) = sse.data else {
                return Err(WorkerQuitReason::fatal(
                    "endpoint event without data",
                    "wait for endpoint event",
                ));
            };
            break endpoint;
        };
        let post_uri = resolve_endpoint(&self.config.uri, &endpoint);
        tracing::debug!(%post_uri, "sse session established");

        let mut retry_interval = self.config.retry_policy.min_duration;
        let mut last_event_id: Option<String> = None;
        enum Event<W: Worker> {
            Sse(Option<Result<Sse, SseError>>),
            FromHandler(WorkerSendRequest<W>),
        }
        loop {
            let event = tokio::select! {
                sse = sse_stream.next() => Event::Sse(sse),
                _ = context.cancellation_token.cancelled() => {
                    return Err(WorkerQuitReason::Cancelled);
                }
                from_handler = context.from_handler_rx.recv() => {
                    match from_handler {
                        Some(request) => Event::FromHandler(request),
                        None => return Err(WorkerQuitReason::HandlerTerminated),
                    }
                }
            };
            let sse = match event {
                Event::FromHandler(WorkerSendRequest { message, responder }) => {
                    let result = self
                        .client
                        .post_message(post_uri.clone(), message, None)
                        .await;
                    let _ = responder.send(result);
                    continue;
                }
                Event::Sse(Some(Ok(sse))) => sse,
                Event::Sse(Some(Err(error))) => {
                    tracing::warn!(%error, "sse stream broke, reconnecting");
                    let mut retry_times = 0;
                    sse_stream = loop {
                        tokio::time::sleep(retry_interval).await;
                        retry_times += 1;
                        match self
                            .client
                            .get_stream(self.config.uri.clone(), last_event_id.clone(), None)
                            .await
                        {
                            Ok(stream) => break stream,
                            Err(error) => {
                                if retry_times
                                    >= self.config.retry_policy.max_times.unwrap_or(usize::MAX)
                                {
                                    tracing::error!(%error, "sse reconnect gave up");
                                    return Err(WorkerQuitReason::fatal(
                                        error.to_string(),
                                        "reconnect sse stream",
                                    ));
                                }
                            }
                        }
                    };
                    continue;
                }
                Event::Sse(None) => {
                    tracing::debug!("sse stream terminated");
                    return Err(WorkerQuitReason::HandlerTerminated);
                }
            };
            if let Some(server_retry_ms) = sse.retry {
                retry_interval = retry_interval.min(Duration::from_millis(server_retry_ms));
            }
            if let Some(data) = sse.data {
                match serde_json::from_slice::<ServerJsonRpcMessage>(data.as_bytes()) {
                    Ok(message) => context.send_to_handler(message).await?,
                    Err(error) => tracing::warn!(%error, "failed to deserialize server message"),
                }
            }
            if let Some(id) = sse.id {
                last_event_id = Some(id);
            }
        }
    }
}

pub type SseClientTransport<C> = WorkerTransport<SseClientWorker<C>>;

impl<C: SseClient> SseClientTransport<C> {
    pub fn with_client(client: C, config: SseClientConfig) -> Self {
        WorkerTransport::spawn(SseClientWorker::new(client, config))
    }
}

#[cfg(feature = "__reqwest")]
mod reqwest_impl {
    use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};

    use super::*;
    use crate::transport::common::http_header::{
        EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, JSON_MIME_TYPE,
    };

    macro_rules! impl_sse_client {
        ($client:ty, $error:ty) => {
            impl SseClient for $client {
                type Error = $error;

                async fn post_message(
                    &self,
                    uri: Arc<str>,
                    message: ClientJsonRpcMessage,
                    auth_token: Option<String>,
                ) -> Result<(), SseTransportError<Self::Error>> {
                    let mut request = self
                        .post(uri.as_ref())
                        .header(CONTENT_TYPE, JSON_MIME_TYPE);
                    if let Some(auth_token) = auth_token {
                        request = request.header(AUTHORIZATION, format!("Bearer {auth_token}"));
                    }
                    let response = request
                        .json(&message)
                        .send()
                        .await
                        .map_err(|e| SseTransportError::Client(<$error>::from(e)))?;
                    response
                        .error_for_status()
                        .map(drop)
                        .map_err(|e| SseTransportError::Client(<$error>::from(e)))
                }

                async fn get_stream(
                    &self,
                    uri: Arc<str>,
                    last_event_id: Option<String>,
                    auth_token: Option<String>,
                ) -> Result<BoxedSseResponse, SseTransportError<Self::Error>> {
                    use futures::StreamExt;
                    let mut request = self.get(uri.as_ref()).header(ACCEPT, EVENT_STREAM_MIME_TYPE);
                    if let Some(last_event_id) = last_event_id {
                        request = request.header(HEADER_LAST_EVENT_ID, last_event_id);
                    }
                    if let Some(auth_token) = auth_token {
                        request = request.header(AUTHORIZATION, format!("Bearer {auth_token}"));
                    }
                    let response = request
                        .send()
                        .await
                        .map_err(|e| SseTransportError::Client(<$error>::from(e)))?;
                    let response = response
                        .error_for_status()
                        .map_err(|e| SseTransportError::Client(<$error>::from(e)))?;
                    let content_type = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok());
                    if !content_type.is_some_and(|ct| ct.starts_with(EVENT_STREAM_MIME_TYPE)) {
                        return Err(SseTransportError::UnexpectedContentType(
                            content_type.map(ToOwned::to_owned),
                        ));
                    }
                    Ok(sse_stream::SseStream::from_byte_stream(response.bytes_stream()).boxed())
                }
            }
        };
    }

    impl_sse_client!(reqwest::Client, reqwest::Error);
    #[cfg(feature = "middleware")]
    impl_sse_client!(
        reqwest_middleware::ClientWithMiddleware,
        reqwest_middleware::Error
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_endpoint() {
        let resolved = resolve_endpoint(
            "http://127.0.0.1:8080/sse",
            "/message?sessionId=abc",
        );
        assert_eq!(resolved.as_ref(), "http://127.0.0.1:8080/message?sessionId=abc");
    }

    #[test]
    fn test_resolve_absolute_endpoint() {
        let resolved = resolve_endpoint(
            "http://127.0.0.1:8080/sse",
            "http://other.example.com/message?sessionId=abc",
        );
        assert_eq!(resolved.as_ref(), "http://other.example.com/message?sessionId=abc");
    }

    #[test]
    fn test_resolve_endpoint_without_scheme() {
        let resolved = resolve_endpoint("localhost:8080/sse", "message?sessionId=x");
        assert!(resolved.as_ref().ends_with("message?sessionId=x"));
    }
}
