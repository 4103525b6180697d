//! The in-memory session backend: one actor task per session owns all
//! routing state, the HTTP layer and the service talk to it through
//! channels.
use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use super::{ServerSseMessage, SessionError, SessionId, SessionManager};
use crate::{
    RoleServer,
    model::{
        ClientJsonRpcMessage, ClientRequest, GetMeta, JsonRpcMessage, Meta, ProgressToken,
        RequestId, ServerJsonRpcMessage, ServerNotification,
    },
    transport::{
        Transport,
        common::server_side_http::session_id,
        streamable_http_server::event_store::{
            EventId, EventStore, InMemoryEventStore, ReplayError, STANDALONE_STREAM_ID, StreamId,
        },
    },
};

type StreamSender = mpsc::Sender<ServerSseMessage>;

pub(crate) enum SessionCommand {
    Initialize {
        message: ClientJsonRpcMessage,
        responder: oneshot::Sender<Result<ServerJsonRpcMessage, SessionError>>,
    },
    CreateStream {
        messages: Vec<ClientJsonRpcMessage>,
        responder: oneshot::Sender<Result<ReceiverStream<ServerSseMessage>, SessionError>>,
    },
    AcceptMessages {
        messages: Vec<ClientJsonRpcMessage>,
        responder: oneshot::Sender<Result<(), SessionError>>,
    },
    CreateStandaloneStream {
        responder: oneshot::Sender<Result<ReceiverStream<ServerSseMessage>, SessionError>>,
    },
    Resume {
        last_event_id: String,
        responder: oneshot::Sender<Result<ReceiverStream<ServerSseMessage>, SessionError>>,
    },
    FromService(ServerJsonRpcMessage),
    Close,
}

/// The service side of a session: what `serve_server` runs on.
pub struct LocalSessionTransport {
    to_service_rx: mpsc::Receiver<ClientJsonRpcMessage>,
    commands: mpsc::Sender<SessionCommand>,
}

impl Transport<RoleServer> for LocalSessionTransport {
    type Error = std::io::Error;

    fn send(
        &mut self,
        item: ServerJsonRpcMessage,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        let commands = self.commands.clone();
        async move {
            commands
                .send(SessionCommand::FromService(item))
                .await
                .map_err(|_| std::io::Error::other("session closed"))
        }
    }

    async fn receive(&mut self) -> Option<ClientJsonRpcMessage> {
        self.to_service_rx.recv().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

struct StreamState {
    tx: StreamSender,
    /// Responses still owed on this stream; the stream closes once it
    /// reaches zero.
    outstanding: usize,
}

struct SessionActor {
    id: SessionId,
    to_service_tx: mpsc::Sender<ClientJsonRpcMessage>,
    commands: mpsc::Receiver<SessionCommand>,
    event_store: Arc<dyn EventStore>,
    channel_capacity: usize,
    next_stream_id: StreamId,
    streams: HashMap<StreamId, StreamState>,
    standalone: Option<StreamSender>,
    request_streams: HashMap<RequestId, StreamId>,
    progress_streams: HashMap<ProgressToken, StreamId>,
    pending_initialize: Option<(RequestId, oneshot::Sender<Result<ServerJsonRpcMessage, SessionError>>)>,
}

impl SessionActor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                SessionCommand::Initialize { message, responder } => {
                    let result = self.handle_initialize(message, responder).await;
                    if let Err((responder, error)) = result {
                        let _ = responder.send(Err(error));
                    }
                }
                SessionCommand::CreateStream {
                    messages,
                    responder,
                } => {
                    let result = self.handle_create_stream(messages).await;
                    let _ = responder.send(result);
                }
                SessionCommand::AcceptMessages {
                    messages,
                    responder,
                } => {
                    let mut result = Ok(());
                    for message in messages {
                        if self.to_service_tx.send(message).await.is_err() {
                            result = Err(SessionError::SessionClosed);
                            break;
                        }
                    }
                    let _ = responder.send(result);
                }
                SessionCommand::CreateStandaloneStream { responder } => {
                    let (tx, rx) = mpsc::channel(self.channel_capacity);
                    self.standalone = Some(tx);
                    let _ = responder.send(Ok(ReceiverStream::new(rx)));
                }
                SessionCommand::Resume {
                    last_event_id,
                    responder,
                } => {
                    let result = self.handle_resume(&last_event_id).await;
                    let _ = responder.send(result);
                }
                SessionCommand::FromService(message) => {
                    self.route_from_service(message).await;
                }
                SessionCommand::Close => break,
            }
        }
        tracing::debug!(session_id = %self.id, "session actor stopped");
    }

    async fn handle_initialize(
        &mut self,
        message: ClientJsonRpcMessage,
        responder: oneshot::Sender<Result<ServerJsonRpcMessage, SessionError>>,
    ) -> Result<(), (oneshot::Sender<Result<ServerJsonRpcMessage, SessionError>>, SessionError)>
    {
        let JsonRpcMessage::Request(request) = &message else {
            return Err((responder, SessionError::ExpectedInitializeRequest));
        };
        if !matches!(request.request, ClientRequest::InitializeRequest(_)) {
            return Err((responder, SessionError::ExpectedInitializeRequest));
        }
        let id = request.id.clone();
        if self.to_service_tx.send(message).await.is_err() {
            return Err((responder, SessionError::SessionClosed));
        }
        self.pending_initialize = Some((id, responder));
        Ok(())
    }

    async fn handle_create_stream(
        &mut self,
        messages: Vec<ClientJsonRpcMessage>,
    ) -> Result<ReceiverStream<ServerSseMessage>, SessionError> {
        let stream_id = self.next_stream_id + 1;
        let mut outstanding = 0usize;
        for message in &messages {
            if let JsonRpcMessage::Request(request) = message {
                if self.request_streams.contains_key(&request.id) {
                    return Err(SessionError::DuplicatedRequestId);
                }
                outstanding += 1;
            }
        }
        self.next_stream_id = stream_id;
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        for message in &messages {
            if let JsonRpcMessage::Request(request) = message {
                self.request_streams.insert(request.id.clone(), stream_id);
                if let Some(token) = request.request.get_meta().and_then(Meta::get_progress_token)
                {
                    self.progress_streams.insert(token, stream_id);
                }
            }
        }
        self.streams.insert(
            stream_id,
            StreamState {
                tx,
                outstanding,
            },
        );
        for message in messages {
            if self.to_service_tx.send(message).await.is_err() {
                self.drop_stream(stream_id);
                return Err(SessionError::SessionClosed);
            }
        }
        Ok(ReceiverStream::new(rx))
    }

    fn drop_stream(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
        self.request_streams.retain(|_, s| *s != stream_id);
        self.progress_streams.retain(|_, s| *s != stream_id);
    }

    async fn handle_resume(
        &mut self,
        last_event_id: &str,
    ) -> Result<ReceiverStream<ServerSseMessage>, SessionError> {
        let after: EventId = last_event_id
            .parse()
            .map_err(|_| SessionError::InvalidLastEventId)?;
        let replayed = self.event_store.replay_after(after).await.map_err(|e| match e {
            ReplayError::UnknownStream => SessionError::InvalidLastEventId,
            ReplayError::OutOfWindow => SessionError::ReplayOutOfWindow,
        })?;
        // replay window must cover the backlog; live delivery continues
        // on the same channel afterwards
        let (tx, rx) = mpsc::channel(self.channel_capacity.max(replayed.len() + 1));
        for event in replayed {
            let _ = tx.try_send(ServerSseMessage {
                event_id: Some(event.event_id.to_string()),
                message: event.message,
            });
        }
        if after.stream_id == STANDALONE_STREAM_ID {
            self.standalone = Some(tx);
        } else if let Some(state) = self.streams.get_mut(&after.stream_id) {
            state.tx = tx;
        }
        // a finished request stream is not re-attached: the replay
        // already carried its final response and the channel ends here
        Ok(ReceiverStream::new(rx))
    }

    async fn route_from_service(&mut self, message: ServerJsonRpcMessage) {
        if let Some((id, _)) = &self.pending_initialize {
            let matches = match &message {
                JsonRpcMessage::Response(response) => response.id == *id,
                JsonRpcMessage::Error(error) => error.id == *id,
                _ => false,
            };
            if matches {
                let (_, responder) = self.pending_initialize.take().expect("checked above");
                let _ = responder.send(Ok(message));
                return;
            }
        }
        let (stream_id, closes_request) = self.resolve_stream(&message);
        let message = Arc::new(message);
        let event_id = self.event_store.append(stream_id, message.clone()).await;
        let sse_message = ServerSseMessage {
            event_id: Some(event_id.to_string()),
            message,
        };
        if stream_id == STANDALONE_STREAM_ID {
            if let Some(tx) = &self.standalone {
                if tx.send(sse_message).await.is_err() {
                    self.standalone = None;
                }
            }
        } else if let Some(state) = self.streams.get_mut(&stream_id) {
            if state.tx.send(sse_message).await.is_err() {
                tracing::debug!(stream_id, "stream receiver went away");
            }
            if let Some(request_id) = closes_request {
                self.request_streams.remove(&request_id);
                state.outstanding = state.outstanding.saturating_sub(1);
                if state.outstanding == 0 {
                    self.drop_stream(stream_id);
                }
            }
        }
    }

    /// Which stream an outbound message belongs on, and the request id
    /// it terminates if it is a response.
    fn resolve_stream(&self, message: &ServerJsonRpcMessage) -> (StreamId, Option<RequestId>) {
        match message {
            JsonRpcMessage::Response(response) => {
                let stream = self
                    .request_streams
                    .get(&response.id)
                    .copied()
                    .unwrap_or(STANDALONE_STREAM_ID);
                (stream, Some(response.id.clone()))
            }
            JsonRpcMessage::Error(error) => {
                let stream = self
                    .request_streams
                    .get(&error.id)
                    .copied()
                    .unwrap_or(STANDALONE_STREAM_ID);
                (stream, Some(error.id.clone()))
            }
            JsonRpcMessage::Notification(notification) => match &notification.notification {
                ServerNotification::ProgressNotification(progress) => {
                    let stream = self
                        .progress_streams
                        .get(&progress.params.progress_token)
                        .copied()
                        .unwrap_or(STANDALONE_STREAM_ID);
                    (stream, None)
                }
                ServerNotification::CancelledNotification(cancelled) => {
                    let stream = self
                        .request_streams
                        .get(&cancelled.params.request_id)
                        .copied()
                        .unwrap_or(STANDALONE_STREAM_ID);
                    (stream, None)
                }
                _ => (STANDALONE_STREAM_ID, None),
            },
            // server-initiated requests go to the standalone stream
            _ => (STANDALONE_STREAM_ID, None),
        }
    }
}

struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

/// Per-manager tuning knobs.
#[derive(Clone)]
pub struct LocalSessionManagerConfig {
    pub channel_capacity: usize,
    /// Builds the per-session event store; defaults to
    /// [`InMemoryEventStore`] with its default replay window.
    pub event_store_factory: Arc<dyn Fn() -> Arc<dyn EventStore> + Send + Sync>,
}

impl std::fmt::Debug for LocalSessionManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSessionManagerConfig")
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl Default for LocalSessionManagerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            event_store_factory: Arc::new(|| Arc::new(InMemoryEventStore::default())),
        }
    }
}

/// In-memory [`SessionManager`]: a map from session id to its actor's
/// mailbox.
#[derive(Default)]
pub struct LocalSessionManager {
    sessions: tokio::sync::RwLock<HashMap<SessionId, SessionHandle>>,
    config: LocalSessionManagerConfig,
}

impl LocalSessionManager {
    pub fn new(config: LocalSessionManagerConfig) -> Self {
        Self {
            sessions: Default::default(),
            config,
        }
    }

    /// Ids of every live session, for administration and tests.
    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    async fn command_sender(
        &self,
        id: &SessionId,
    ) -> Result<mpsc::Sender<SessionCommand>, SessionError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .map(|handle| handle.commands.clone())
            .ok_or(SessionError::SessionNotFound)
    }
}

async fn send_command<T>(
    commands: mpsc::Sender<SessionCommand>,
    build: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> SessionCommand,
) -> Result<T, SessionError> {
    let (responder, receiver) = oneshot::channel();
    commands
        .send(build(responder))
        .await
        .map_err(|_| SessionError::SessionClosed)?;
    receiver.await.map_err(|_| SessionError::SessionClosed)?
}

impl SessionManager for LocalSessionManager {
    type Transport = LocalSessionTransport;

    async fn create_session(&self) -> Result<(SessionId, Self::Transport), SessionError> {
        let id = session_id();
        let (to_service_tx, to_service_rx) = mpsc::channel(self.config.channel_capacity);
        let (commands_tx, commands_rx) = mpsc::channel(self.config.channel_capacity);
        let actor = SessionActor {
            id: id.clone(),
            to_service_tx,
            commands: commands_rx,
            event_store: (self.config.event_store_factory)(),
            channel_capacity: self.config.channel_capacity,
            next_stream_id: STANDALONE_STREAM_ID,
            streams: HashMap::new(),
            standalone: None,
            request_streams: HashMap::new(),
            progress_streams: HashMap::new(),
            pending_initialize: None,
        };
        tokio::spawn(actor.run());
        self.sessions.write().await.insert(
            id.clone(),
            SessionHandle {
                commands: commands_tx.clone(),
            },
        );
        Ok((
            id,
            LocalSessionTransport {
                to_service_rx,
                commands: commands_tx,
            },
        ))
    }

    async fn initialize_session(
        &self,
        id: &SessionId,
        message: ClientJsonRpcMessage,
    ) -> Result<ServerJsonRpcMessage, SessionError> {
        let commands = self.command_sender(id).await?;
        send_command(commands, |responder| SessionCommand::Initialize {
            message,
            responder,
        })
        .await
    }

    async fn has_session(&self, id: &SessionId) -> Result<bool, SessionError> {
        Ok(self.sessions.read().await.contains_key(id))
    }

    async fn close_session(&self, id: &SessionId) -> Result<(), SessionError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or(SessionError::SessionNotFound)?;
        let _ = handle.commands.send(SessionCommand::Close).await;
        Ok(())
    }

    async fn create_stream(
        &self,
        id: &SessionId,
        messages: Vec<ClientJsonRpcMessage>,
    ) -> Result<impl futures::Stream<Item = ServerSseMessage> + Send + 'static, SessionError>
    {
        let commands = self.command_sender(id).await?;
        send_command(commands, |responder| SessionCommand::CreateStream {
            messages,
            responder,
        })
        .await
    }

    async fn accept_messages(
        &self,
        id: &SessionId,
        messages: Vec<ClientJsonRpcMessage>,
    ) -> Result<(), SessionError> {
        let commands = self.command_sender(id).await?;
        send_command(commands, |responder| SessionCommand::AcceptMessages {
            messages,
            responder,
        })
        .await
    }

    async fn create_standalone_stream(
        &self,
        id: &SessionId,
    ) -> Result<impl futures::Stream<Item = ServerSseMessage> + Send + 'static, SessionError>
    {
        let commands = self.command_sender(id).await?;
        send_command(commands, |responder| SessionCommand::CreateStandaloneStream {
            responder,
        })
        .await
    }

    async fn resume(
        &self,
        id: &SessionId,
        last_event_id: String,
    ) -> Result<impl futures::Stream<Item = ServerSseMessage> + Send + 'static, SessionError>
    {
        let commands = self.command_sender(id).await?;
        send_command(commands, |responder| SessionCommand::Resume {
            last_event_id,
            responder,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::model::{
        ClientRequest, EmptyResult, PingRequest, RequestId, ServerResult,
    };

    fn ping_message(id: u32) -> ClientJsonRpcMessage {
        ClientJsonRpcMessage::request(
            ClientRequest::PingRequest(PingRequest {
                method: Default::default(),
                extensions: Default::default(),
            }),
            RequestId::Number(id),
        )
    }

    #[tokio::test]
    async fn test_stream_closes_after_response() {
        let manager = LocalSessionManager::default();
        let (id, mut transport) = manager.create_session().await.unwrap();

        let mut stream = Box::pin(
            manager
                .create_stream(&id, vec![ping_message(1)])
                .await
                .unwrap(),
        );
        // the service side sees the request and answers
        let inbound = transport.receive().await.unwrap();
        let (_, request_id) = inbound.into_request().unwrap();
        transport
            .send(ServerJsonRpcMessage::response(
                ServerResult::EmptyResult(EmptyResult::default()),
                request_id,
            ))
            .await
            .unwrap();

        let event = stream.next().await.unwrap();
        assert!(event.event_id.is_some());
        assert!(stream.next().await.is_none(), "stream must close after the response");
    }

    #[tokio::test]
    async fn test_resume_replays_missed_events() {
        let manager = LocalSessionManager::default();
        let (id, mut transport) = manager.create_session().await.unwrap();

        // a standalone subscriber that goes away immediately
        let standalone = manager.create_standalone_stream(&id).await.unwrap();
        drop(standalone);

        for n in 0..3 {
            transport
                .send(ServerJsonRpcMessage::notification(
                    ServerNotification::ToolListChangedNotification(
                        crate::model::ToolListChangedNotification {
                            method: Default::default(),
                            extensions: Default::default(),
                        },
                    ),
                ))
                .await
                .unwrap();
            let _ = n;
        }
        // give the actor a beat to route
        tokio::task::yield_now().await;

        let resumed = manager
            .resume(&id, format!("{STANDALONE_STREAM_ID}/1"))
            .await
            .unwrap();
        let events: Vec<_> = resumed
            .take(2)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id.as_deref(), Some("0/2"));
        assert_eq!(events[1].event_id.as_deref(), Some("0/3"));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let manager = LocalSessionManager::default();
        let unknown: SessionId = "missing".into();
        assert!(matches!(
            manager.accept_messages(&unknown, vec![]).await,
            Err(SessionError::SessionNotFound)
        ));
    }
}
