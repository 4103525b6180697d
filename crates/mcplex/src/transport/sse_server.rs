//! Server side of the legacy two-endpoint SSE transport: `GET /sse`
//! opens the event stream and announces the POST inbox URL (with a
//! `sessionId` query parameter) in an `endpoint` event; the client then
//! POSTs envelopes there and receives everything else on the stream.
use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::Instrument;

use super::common::server_side_http::{DnsRebindingProtection, SessionId, session_id};
use crate::{
    RoleServer, Service,
    model::ClientJsonRpcMessage,
    service::{RxJsonRpcMessage, TxJsonRpcMessage, serve_server},
};

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct SseServerConfig {
    pub bind: SocketAddr,
    pub sse_path: String,
    pub post_path: String,
    pub ct: CancellationToken,
    pub sse_keep_alive: Option<Duration>,
    pub dns_protection: DnsRebindingProtection,
}

impl Default for SseServerConfig {
    fn default() -> Self {
        Self {
            bind: ([127, 0, 0, 1], 0).into(),
            sse_path: "/sse".to_string(),
            post_path: "/message".to_string(),
            ct: CancellationToken::new(),
            sse_keep_alive: None,
            dns_protection: DnsRebindingProtection::default(),
        }
    }
}

type SessionTxStore =
    Arc<tokio::sync::RwLock<HashMap<SessionId, tokio::sync::mpsc::Sender<ClientJsonRpcMessage>>>>;

#[derive(Clone)]
struct App {
    sessions: SessionTxStore,
    transport_tx: tokio::sync::mpsc::UnboundedSender<SseServerTransport>,
    post_path: Arc<str>,
    keep_alive: Option<Duration>,
    dns_protection: DnsRebindingProtection,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostQuery {
    session_id: String,
}

async fn post_handler(
    State(app): State<App>,
    Query(PostQuery { session_id }): Query<PostQuery>,
    headers: HeaderMap,
    Json(message): Json<ClientJsonRpcMessage>,
) -> Result<StatusCode, StatusCode> {
    if !app.dns_protection.permits(&headers) {
        return Err(StatusCode::FORBIDDEN);
    }
    tracing::debug!(session_id, "inbound client message");
    let tx = {
        let sessions = app.sessions.read().await;
        sessions
            .get(session_id.as_str())
            .ok_or(StatusCode::NOT_FOUND)?
            .clone()
    };
    if tx.send(message).await.is_err() {
        tracing::warn!(session_id, "session terminated, dropping message");
        return Err(StatusCode::GONE);
    }
    Ok(StatusCode::ACCEPTED)
}

async fn sse_handler(
    State(app): State<App>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, io::Error>>>, Response<String>> {
    if !app.dns_protection.permits(&headers) {
        let mut response = Response::new("Forbidden: host or origin not allowed".to_string());
        *response.status_mut() = StatusCode::FORBIDDEN;
        return Err(response);
    }
    let session = session_id();
    tracing::info!(%session, "new sse connection");
    let (from_client_tx, from_client_rx) = tokio::sync::mpsc::channel(64);
    let (to_client_tx, to_client_rx) = tokio::sync::mpsc::channel(64);
    app.sessions
        .write()
        .await
        .insert(session.clone(), from_client_tx);

    let transport = SseServerTransport {
        stream: ReceiverStream::new(from_client_rx),
        sink: PollSender::new(to_client_tx.clone()),
        session_id: session.clone(),
        session_store: app.sessions.clone(),
    };
    if app.transport_tx.send(transport).is_err() {
        let mut response = Response::new("server is shutting down".to_string());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return Err(response);
    }

    // clean up the session entry once the connection goes away
    tokio::spawn({
        let session = session.clone();
        let sessions = app.sessions.clone();
        async move {
            to_client_tx.closed().await;
            sessions.write().await.remove(&session);
            tracing::debug!(%session, "sse session cleaned up");
        }
    });

    let endpoint = format!("{}?sessionId={}", app.post_path, session);
    let stream = futures::stream::once(futures::future::ok(
        Event::default().event("endpoint").data(endpoint),
    ))
    .chain(ReceiverStream::new(to_client_rx).map(|message| {
        match serde_json::to_string(&message) {
            Ok(json) => Ok(Event::default().event("message").data(json)),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }));
    let keep_alive = app.keep_alive.unwrap_or(DEFAULT_KEEP_ALIVE);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive)))
}

pub struct SseServerTransport {
    stream: ReceiverStream<RxJsonRpcMessage<RoleServer>>,
    sink: PollSender<TxJsonRpcMessage<RoleServer>>,
    session_id: SessionId,
    session_store: SessionTxStore,
}

impl Sink<TxJsonRpcMessage<RoleServer>> for SseServerTransport {
    type Error = io::Error;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.sink.poll_ready_unpin(cx).map_err(io::Error::other)
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: TxJsonRpcMessage<RoleServer>,
    ) -> Result<(), Self::Error> {
        self.sink.start_send_unpin(item).map_err(io::Error::other)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.sink.poll_flush_unpin(cx).map_err(io::Error::other)
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        let result = self.sink.poll_close_unpin(cx).map_err(io::Error::other);
        if result.is_ready() {
            let session_id = self.session_id.clone();
            let session_store = self.session_store.clone();
            tokio::spawn(async move {
                session_store.write().await.remove(&session_id);
            });
        }
        result
    }
}

impl Stream for SseServerTransport {
    type Item = RxJsonRpcMessage<RoleServer>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}

/// Accepts SSE connections and yields one [`SseServerTransport`] per
/// client, each ready to be served.
pub struct SseServer {
    transport_rx: tokio::sync::mpsc::UnboundedReceiver<SseServerTransport>,
    pub config: SseServerConfig,
}

impl SseServer {
    /// Bind and serve with default paths.
    pub async fn serve(bind: SocketAddr) -> io::Result<Self> {
        Self::serve_with_config(SseServerConfig {
            bind,
            ..Default::default()
        })
        .await
    }

    pub async fn serve_with_config(mut config: SseServerConfig) -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(config.bind).await?;
        // when binding port 0, report the address actually bound
        config.bind = listener.local_addr()?;
        let (sse_server, router) = Self::new(config);
        let ct = sse_server.config.ct.child_token();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            ct.cancelled().await;
            tracing::info!("sse server shutting down");
        });
        tokio::spawn(
            async move {
                if let Err(error) = server.await {
                    tracing::error!(%error, "sse server terminated");
                }
            }
            .instrument(tracing::info_span!("sse-server", bind = %sse_server.config.bind)),
        );
        Ok(sse_server)
    }

    pub fn new(config: SseServerConfig) -> (SseServer, Router) {
        let (transport_tx, transport_rx) = tokio::sync::mpsc::unbounded_channel();
        let app = App {
            sessions: Default::default(),
            transport_tx,
            post_path: config.post_path.clone().into(),
            keep_alive: config.sse_keep_alive,
            dns_protection: config.dns_protection.clone(),
        };
        let router = Router::new()
            .route(&config.sse_path, get(sse_handler))
            .route(&config.post_path, post(post_handler))
            .with_state(app);
        (
            SseServer {
                transport_rx,
                config,
            },
            router,
        )
    }

    /// Serve every accepted connection with a fresh service from the
    /// factory. Returns a token that stops the accept loop.
    pub fn with_service<S, F>(mut self, service_provider: F) -> CancellationToken
    where
        S: Service<RoleServer>,
        F: Fn() -> S + Send + 'static,
    {
        let ct = self.config.ct.clone();
        tokio::spawn(async move {
            while let Some(transport) = self.next_transport().await {
                let service = service_provider();
                tokio::spawn(async move {
                    match serve_server(service, transport).await {
                        Ok(running) => {
                            let _ = running.waiting().await;
                        }
                        Err(error) => {
                            tracing::error!(%error, "failed to serve sse connection");
                        }
                    }
                });
            }
        });
        ct
    }

    pub fn cancel(&self) {
        self.config.ct.cancel();
    }

    pub async fn next_transport(&mut self) -> Option<SseServerTransport> {
        self.transport_rx.recv().await
    }
}

impl Stream for SseServer {
    type Item = SseServerTransport;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.transport_rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_store_insert_and_cleanup() {
        let (transport_tx, _transport_rx) = tokio::sync::mpsc::unbounded_channel();
        let app = App {
            sessions: Default::default(),
            transport_tx,
            post_path: "/message".into(),
            keep_alive: None,
            dns_protection: Default::default(),
        };
        let session = session_id();
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        app.sessions.write().await.insert(session.clone(), tx);
        assert!(app.sessions.read().await.contains_key(&session));
        app.sessions.write().await.remove(&session);
        assert!(!app.sessions.read().await.contains_key(&session));
    }

    #[tokio::test]
    async fn test_post_to_unknown_session_is_404() {
        let (transport_tx, _transport_rx) = tokio::sync::mpsc::unbounded_channel();
        let app = App {
            sessions: Default::default(),
            transport_tx,
            post_path: "/message".into(),
            keep_alive: None,
            dns_protection: Default::default(),
        };
        let message = ClientJsonRpcMessage::notification(
            crate::model::ClientNotification::InitializedNotification(
                crate::model::InitializedNotification {
                    method: Default::default(),
                    extensions: Default::default(),
                },
            ),
        );
        let result = post_handler(
            State(app),
            Query(PostQuery {
                session_id: "missing".to_string(),
            }),
            HeaderMap::new(),
            Json(message),
        )
        .await;
        assert_eq!(result, Err(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_server_stops_accepting_after_cancel() {
        let (mut server, _router) = SseServer::new(SseServerConfig::default());
        server.config.ct.cancel();
        // the channel is empty and every handler sender was dropped with
        // the router
        let next = tokio::time::timeout(Duration::from_millis(50), server.next_transport()).await;
        assert!(matches!(next, Ok(None) | Err(_)));
    }
}
