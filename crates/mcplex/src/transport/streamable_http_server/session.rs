//! Session management for the streamable HTTP server.
//!
//! A session groups every interaction of one client with the server,
//! starting at the `initialize` handshake. The server mints a
//! [`SessionId`] (sent back in the `Mcp-Session-Id` header) and the
//! client echoes it on every later request; the id is immutable for the
//! session's lifetime.
use futures::Stream;
use thiserror::Error;

pub use crate::transport::common::server_side_http::{ServerSseMessage, SessionId};
use crate::{
    RoleServer,
    model::{ClientJsonRpcMessage, ServerJsonRpcMessage},
};

pub mod local;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found")]
    SessionNotFound,
    #[error("session closed")]
    SessionClosed,
    #[error("invalid last event id")]
    InvalidLastEventId,
    #[error("event id below the replay window")]
    ReplayOutOfWindow,
    #[error("duplicated request id")]
    DuplicatedRequestId,
    #[error("expected an initialize request")]
    ExpectedInitializeRequest,
    #[error("session manager error: {0}")]
    Other(String),
}

impl SessionError {
    /// The HTTP status this error maps onto.
    pub fn status(&self) -> u16 {
        match self {
            SessionError::SessionNotFound | SessionError::SessionClosed => 404,
            SessionError::InvalidLastEventId | SessionError::ReplayOutOfWindow => 404,
            SessionError::DuplicatedRequestId | SessionError::ExpectedInitializeRequest => 400,
            SessionError::Other(_) => 500,
        }
    }
}

/// Creates, routes into, and tears down sessions on behalf of the
/// [`StreamableHttpService`](super::StreamableHttpService).
///
/// [`local::LocalSessionManager`] keeps everything in memory; implement
/// this trait to back sessions with external storage.
pub trait SessionManager: Send + Sync + 'static {
    type Transport: crate::transport::Transport<RoleServer>;

    /// Mint a session and hand back the transport its service will run
    /// on.
    fn create_session(
        &self,
    ) -> impl Future<Output = Result<(SessionId, Self::Transport), SessionError>> + Send;

    /// Feed the `initialize` request in and intercept its response.
    fn initialize_session(
        &self,
        id: &SessionId,
        message: ClientJsonRpcMessage,
    ) -> impl Future<Output = Result<ServerJsonRpcMessage, SessionError>> + Send;

    fn has_session(&self, id: &SessionId)
    -> impl Future<Output = Result<bool, SessionError>> + Send;

    fn close_session(&self, id: &SessionId)
    -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Route one POST's worth of messages (at least one of them a
    /// request) into the session; the stream carries everything emitted
    /// for those requests and closes after the last response.
    fn create_stream(
        &self,
        id: &SessionId,
        messages: Vec<ClientJsonRpcMessage>,
    ) -> impl Future<
        Output = Result<impl Stream<Item = ServerSseMessage> + Send + 'static, SessionError>,
    > + Send;

    /// Accept responses and notifications that produce no response
    /// stream.
    fn accept_messages(
        &self,
        id: &SessionId,
        messages: Vec<ClientJsonRpcMessage>,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// The standalone server→client stream (HTTP GET without
    /// `Last-Event-ID`).
    fn create_standalone_stream(
        &self,
        id: &SessionId,
    ) -> impl Future<
        Output = Result<impl Stream<Item = ServerSseMessage> + Send + 'static, SessionError>,
    > + Send;

    /// Replay everything after `last_event_id` on its stream, then keep
    /// delivering live events.
    fn resume(
        &self,
        id: &SessionId,
        last_event_id: String,
    ) -> impl Future<
        Output = Result<impl Stream<Item = ServerSseMessage> + Send + 'static, SessionError>,
    > + Send;
}
