//! The protocol runtime: request/response correlation, cancellation,
//! timeouts, progress routing and capability gating, independent of any
//! concrete transport.
use std::{
    collections::HashMap,
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    model::{
        CancelledNotification, CancelledNotificationMethod, CancelledNotificationParam,
        ErrorData, Extensions, GetExtensions, GetMeta, JsonRpcMessage, Meta,
        ProgressNotification, ProgressNotificationParam, ProgressToken, RequestId,
    },
    transport::{DynamicTransportError, IntoTransport, Transport},
};

mod cancellation;
pub use cancellation::CancelSignal;

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
pub use client::*;
#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::*;

pub trait ServiceRole: std::fmt::Debug + Send + Sync + Default + Copy + Clone + 'static {
    type Req: std::fmt::Debug
        + GetMeta
        + GetExtensions
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static;
    type Resp: std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static;
    type Not: std::fmt::Debug
        + Send
        + Sync
        + From<CancelledNotification>
        + From<ProgressNotification>
        + Serialize
        + DeserializeOwned
        + 'static;
    type PeerReq: std::fmt::Debug
        + GetMeta
        + GetExtensions
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static;
    type PeerResp: std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static;
    type PeerNot: std::fmt::Debug
        + RoutableNotification
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static;
    type InitializeError: std::error::Error + Send + Sync + 'static;
    type Info: std::fmt::Debug + Send + Sync + Clone + Serialize + DeserializeOwned + 'static;
    type PeerInfo: std::fmt::Debug + Send + Sync + Clone + Serialize + DeserializeOwned + 'static;

    const IS_CLIENT: bool;

    /// The wire method name of an outbound request, used in diagnostics
    /// and gate errors.
    fn request_method(request: &Self::Req) -> &'static str;

    /// Whether the remote peer advertised the capability this request
    /// needs. `initialize` and `ping` always pass.
    fn request_permitted(request: &Self::Req, peer_info: &Self::PeerInfo) -> bool;

    /// The wire method name of an inbound request, used for dynamic
    /// dispatch.
    fn peer_request_method(request: &Self::PeerReq) -> &'static str;

    /// The wire method name of an inbound notification.
    fn peer_notification_method(notification: &Self::PeerNot) -> &'static str;
}

/// Lets the runtime recognize the lifecycle notifications it must act on
/// itself before (also) handing them to the service.
pub trait RoutableNotification {
    fn as_cancelled(&self) -> Option<&CancelledNotificationParam>;
    fn as_progress(&self) -> Option<&ProgressNotificationParam>;
}

impl RoutableNotification for crate::model::ClientNotification {
    fn as_cancelled(&self) -> Option<&CancelledNotificationParam> {
        match self {
            Self::CancelledNotification(n) => Some(&n.params),
            _ => None,
        }
    }
    fn as_progress(&self) -> Option<&ProgressNotificationParam> {
        match self {
            Self::ProgressNotification(n) => Some(&n.params),
            _ => None,
        }
    }
}

impl RoutableNotification for crate::model::ServerNotification {
    fn as_cancelled(&self) -> Option<&CancelledNotificationParam> {
        match self {
            Self::CancelledNotification(n) => Some(&n.params),
            _ => None,
        }
    }
    fn as_progress(&self) -> Option<&ProgressNotificationParam> {
        match self {
            Self::ProgressNotification(n) => Some(&n.params),
            _ => None,
        }
    }
}

pub type TxJsonRpcMessage<R> = JsonRpcMessage<
    <R as ServiceRole>::Req,
    <R as ServiceRole>::Resp,
    <R as ServiceRole>::Not,
>;
pub type RxJsonRpcMessage<R> = JsonRpcMessage<
    <R as ServiceRole>::PeerReq,
    <R as ServiceRole>::PeerResp,
    <R as ServiceRole>::PeerNot,
>;

/// Errors surfaced to the initiator of a request.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ServiceError {
    #[error("Mcp error: {0}")]
    McpError(ErrorData),
    #[error("Transport send error: {0}")]
    TransportSend(DynamicTransportError),
    #[error("Transport closed")]
    TransportClosed,
    #[error("Unexpected response type")]
    UnexpectedResponse,
    #[error("Request cancelled{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled { reason: Option<String> },
    #[error("Request timeout after {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("Method {method} is not supported by the peer's capabilities")]
    MethodNotSupported { method: &'static str },
}

/// Hands out the next outbound request id. Ids restart for every new
/// service instance, so they never leak across sessions.
pub trait RequestIdProvider: Send + Sync + 'static {
    fn next_request_id(&self) -> RequestId;
}

#[derive(Debug, Default)]
pub struct AtomicU32RequestIdProvider {
    id: AtomicU32,
}

impl RequestIdProvider for AtomicU32RequestIdProvider {
    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Context handed to a request handler; carries the inbound id, a
/// cancellation signal wired to `notifications/cancelled`, and the peer
/// for sending nested requests or notifications.
#[derive(Debug, Clone)]
pub struct RequestContext<R: ServiceRole> {
    /// Fires when the remote peer cancels this request.
    pub ct: CancelSignal,
    pub id: RequestId,
    pub meta: Meta,
    pub extensions: Extensions,
    pub peer: Peer<R>,
}

#[derive(Debug, Clone)]
pub struct NotificationContext<R: ServiceRole> {
    pub meta: Meta,
    pub extensions: Extensions,
    pub peer: Peer<R>,
}

pub trait Service<R: ServiceRole>: Send + Sync + 'static {
    fn handle_request(
        &self,
        request: R::PeerReq,
        context: RequestContext<R>,
    ) -> impl Future<Output = Result<R::Resp, ErrorData>> + Send + '_;
    fn handle_notification(
        &self,
        notification: R::PeerNot,
        context: NotificationContext<R>,
    ) -> impl Future<Output = Result<(), ErrorData>> + Send + '_;
    fn get_info(&self) -> R::Info;
}

/// Default deadline for a request when the caller does not set one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

type ProgressCallback = Box<dyn FnMut(ProgressNotificationParam) + Send>;
type Responder<T> = oneshot::Sender<T>;

/// Per-request options of [`Peer::send_cancellable_request`].
#[derive(Default)]
pub struct PeerRequestOptions {
    /// Per-attempt deadline; `None` means [`DEFAULT_REQUEST_TIMEOUT`].
    pub timeout: Option<Duration>,
    /// Disable the deadline entirely. The request then only terminates
    /// on response, cancellation or transport failure.
    pub no_timeout: bool,
    /// Restart the deadline whenever a progress notification for this
    /// request arrives.
    pub reset_timeout_on_progress: bool,
    /// Hard ceiling on the total time, independent of progress resets.
    pub max_total_timeout: Option<Duration>,
    /// Invoked for every progress notification carrying this request's
    /// progress token.
    pub on_progress: Option<ProgressCallback>,
    /// External abort signal; cancelling it resolves the request with
    /// [`ServiceError::Cancelled`] and notifies the peer.
    pub cancel_signal: Option<CancelSignal>,
    /// Correlates this request with an inbound request it was made on
    /// behalf of; transports that route by request may use it to pick a
    /// delivery stream. Stored in the message extensions as
    /// [`RelatedRequestId`].
    pub related_request_id: Option<RequestId>,
    /// Extra `_meta` fields to attach to the request.
    pub meta: Option<Meta>,
}

/// Extension marker carrying [`PeerRequestOptions::related_request_id`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedRequestId(pub RequestId);

impl std::fmt::Debug for PeerRequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRequestOptions")
            .field("timeout", &self.timeout)
            .field("no_timeout", &self.no_timeout)
            .field("reset_timeout_on_progress", &self.reset_timeout_on_progress)
            .field("max_total_timeout", &self.max_total_timeout)
            .field("on_progress", &self.on_progress.is_some())
            .field("cancel_signal", &self.cancel_signal)
            .finish()
    }
}

impl PeerRequestOptions {
    pub fn no_options() -> Self {
        Self::default()
    }
}

pub(crate) enum PeerSinkMessage<R: ServiceRole> {
    Request {
        request: R::Req,
        id: RequestId,
        responder: Responder<Result<R::PeerResp, ServiceError>>,
        progress_tx: Option<mpsc::Sender<ProgressNotificationParam>>,
    },
    Notification {
        notification: R::Not,
        responder: Responder<Result<(), ServiceError>>,
    },
    /// Evict the pending entry for an outbound request that terminated
    /// locally (timeout or abort); a late response is then dropped.
    CancelRequest { id: RequestId },
}

/// A handle to a remote peer, cloneable and usable from handler tasks.
///
/// Dropping every clone (including the owning [`RunningService`]) shuts
/// the session down.
pub struct Peer<R: ServiceRole> {
    tx: mpsc::Sender<PeerSinkMessage<R>>,
    request_id_provider: Arc<dyn RequestIdProvider>,
    info: Arc<std::sync::OnceLock<R::PeerInfo>>,
    strict_capabilities: Arc<AtomicBool>,
}

impl<R: ServiceRole> Clone for Peer<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            request_id_provider: self.request_id_provider.clone(),
            info: self.info.clone(),
            strict_capabilities: self.strict_capabilities.clone(),
        }
    }
}

impl<R: ServiceRole> std::fmt::Debug for Peer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("role", &R::IS_CLIENT.then_some("client").unwrap_or("server"))
            .field("peer_info", &self.info.get())
            .finish()
    }
}

pub(crate) type PeerReceiver<R> = mpsc::Receiver<PeerSinkMessage<R>>;

impl<R: ServiceRole> Peer<R> {
    const CHANNEL_BUFFER_CAPACITY: usize = 1024;
    const PROGRESS_CHANNEL_CAPACITY: usize = 16;

    pub(crate) fn new(
        request_id_provider: Arc<dyn RequestIdProvider>,
        peer_info: Option<R::PeerInfo>,
    ) -> (Peer<R>, PeerReceiver<R>) {
        let (tx, rx) = mpsc::channel(Self::CHANNEL_BUFFER_CAPACITY);
        let info = std::sync::OnceLock::new();
        if let Some(peer_info) = peer_info {
            let _ = info.set(peer_info);
        }
        (
            Self {
                tx,
                request_id_provider,
                info: Arc::new(info),
                strict_capabilities: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// The remote peer's initialize-time info, available once the
    /// handshake has completed.
    pub fn peer_info(&self) -> Option<&R::PeerInfo> {
        self.info.get()
    }

    pub(crate) fn set_peer_info(&self, info: R::PeerInfo) {
        let _ = self.info.set(info);
    }

    /// With strict capabilities on, a request whose method the remote
    /// peer did not advertise fails locally with
    /// [`ServiceError::MethodNotSupported`] before anything hits the
    /// wire.
    pub fn set_strict_capabilities(&self, strict: bool) {
        self.strict_capabilities.store(strict, Ordering::Relaxed);
    }

    pub fn is_transport_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn send_notification(&self, notification: R::Not) -> Result<(), ServiceError> {
        let (responder, receiver) = oneshot::channel();
        self.tx
            .send(PeerSinkMessage::Notification {
                notification,
                responder,
            })
            .await
            .map_err(|_| ServiceError::TransportClosed)?;
        receiver.await.map_err(|_| ServiceError::TransportClosed)?
    }

    pub async fn send_request(&self, request: R::Req) -> Result<R::PeerResp, ServiceError> {
        self.send_cancellable_request(request, PeerRequestOptions::no_options())
            .await?
            .await_response()
            .await
    }

    pub async fn send_cancellable_request(
        &self,
        mut request: R::Req,
        options: PeerRequestOptions,
    ) -> Result<RequestHandle<R>, ServiceError> {
        if self.strict_capabilities.load(Ordering::Relaxed)
            && let Some(peer_info) = self.peer_info()
            && !R::request_permitted(&request, peer_info)
        {
            return Err(ServiceError::MethodNotSupported {
                method: R::request_method(&request),
            });
        }
        let id = self.request_id_provider.next_request_id();
        if let Some(meta) = options.meta.clone() {
            request.get_meta_mut().extend(meta);
        }
        if let Some(related) = options.related_request_id.clone() {
            request.extensions_mut().insert(RelatedRequestId(related));
        }
        let (progress_tx, progress_rx) = if options.on_progress.is_some()
            || options.reset_timeout_on_progress
        {
            // progress defaults to being keyed by the request id
            let meta = request.get_meta_mut();
            if meta.get_progress_token().is_none() {
                meta.set_progress_token(ProgressToken(id.clone()));
            }
            let (tx, rx) = mpsc::channel(Self::PROGRESS_CHANNEL_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (responder, receiver) = oneshot::channel();
        self.tx
            .send(PeerSinkMessage::Request {
                request,
                id: id.clone(),
                responder,
                progress_tx,
            })
            .await
            .map_err(|_| ServiceError::TransportClosed)?;
        Ok(RequestHandle {
            rx: receiver,
            progress_rx,
            options,
            peer: self.clone(),
            id,
        })
    }

    pub(crate) async fn cancel_pending(&self, id: RequestId) {
        let _ = self.tx.send(PeerSinkMessage::CancelRequest { id }).await;
    }
}

/// An in-flight outbound request. Await it with [`await_response`] or
/// abort it with [`cancel`].
///
/// [`await_response`]: RequestHandle::await_response
/// [`cancel`]: RequestHandle::cancel
pub struct RequestHandle<R: ServiceRole> {
    rx: oneshot::Receiver<Result<R::PeerResp, ServiceError>>,
    progress_rx: Option<mpsc::Receiver<ProgressNotificationParam>>,
    options: PeerRequestOptions,
    peer: Peer<R>,
    pub id: RequestId,
}

impl<R: ServiceRole> RequestHandle<R> {
    /// Drive the request to completion under the configured deadlines.
    ///
    /// The per-attempt deadline restarts on matching progress
    /// notifications when `reset_timeout_on_progress` is set;
    /// `max_total_timeout` is an absolute ceiling that never moves.
    pub async fn await_response(self) -> Result<R::PeerResp, ServiceError> {
        let RequestHandle {
            mut rx,
            mut progress_rx,
            mut options,
            peer,
            id,
        } = self;
        let per_attempt = if options.no_timeout {
            None
        } else {
            Some(options.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))
        };
        let now = tokio::time::Instant::now();
        let total_deadline = options.max_total_timeout.map(|d| now + d);
        let mut attempt_deadline = per_attempt.map(|d| now + d);
        let mut on_progress = options.on_progress.take();
        let cancel_signal = options.cancel_signal.take();
        loop {
            let deadline = match (attempt_deadline, total_deadline) {
                (Some(a), Some(t)) => Some(a.min(t)),
                (a, t) => a.or(t),
            };
            tokio::select! {
                // drain pending progress before resolving, so a
                // subscriber never misses events that beat the response
                biased;
                progress = recv_or_pending(&mut progress_rx) => {
                    match progress {
                        Some(progress) => {
                            if options.reset_timeout_on_progress
                                && let Some(d) = per_attempt
                            {
                                attempt_deadline = Some(tokio::time::Instant::now() + d);
                            }
                            if let Some(on_progress) = on_progress.as_mut() {
                                on_progress(progress);
                            }
                        }
                        None => {
                            progress_rx = None;
                        }
                    }
                }
                reason = cancelled_or_pending(cancel_signal.as_ref()), if cancel_signal.is_some() => {
                    send_cancel_notification(&peer, &id, reason.clone()).await;
                    return Err(ServiceError::Cancelled { reason });
                }
                response = &mut rx => {
                    return response.unwrap_or(Err(ServiceError::TransportClosed));
                }
                _ = sleep_until_or_pending(deadline), if deadline.is_some() => {
                    let timeout = per_attempt
                        .or(options.max_total_timeout)
                        .unwrap_or_default();
                    send_cancel_notification(&peer, &id, None).await;
                    return Err(ServiceError::Timeout { timeout });
                }
            }
        }
    }

    /// Abort the request: the peer is sent `notifications/cancelled` and
    /// the local entry is dropped without waiting for any remote ack.
    pub async fn cancel(self, reason: Option<String>) -> Result<(), ServiceError> {
        send_cancel_notification(&self.peer, &self.id, reason).await;
        Ok(())
    }
}

/// Evict the local entry first so a late response is dropped, then tell
/// the peer.
async fn send_cancel_notification<R: ServiceRole>(
    peer: &Peer<R>,
    id: &RequestId,
    reason: Option<String>,
) {
    peer.cancel_pending(id.clone()).await;
    let notification = CancelledNotification {
        method: CancelledNotificationMethod,
        params: CancelledNotificationParam {
            request_id: id.clone(),
            reason,
        },
        extensions: Extensions::new(),
    };
    if let Err(error) = peer.send_notification(notification.into()).await {
        tracing::debug!(%id, %error, "failed to send cancellation notification");
    }
}

async fn recv_or_pending(
    rx: &mut Option<mpsc::Receiver<ProgressNotificationParam>>,
) -> Option<ProgressNotificationParam> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_or_pending(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn cancelled_or_pending(signal: Option<&CancelSignal>) -> Option<String> {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Why the session's event loop stopped.
#[derive(Debug)]
pub enum QuitReason {
    /// The local side asked for shutdown.
    Cancelled,
    /// The transport reported the peer is gone.
    Closed,
    /// Every peer handle was dropped.
    PeerDropped,
}

/// A live session: the spawned event loop plus the peer handle.
pub struct RunningService<R: ServiceRole, S: Service<R>> {
    service: Arc<S>,
    peer: Peer<R>,
    handle: tokio::task::JoinHandle<QuitReason>,
    ct: CancellationToken,
}

impl<R: ServiceRole, S: Service<R>> Deref for RunningService<R, S> {
    type Target = Peer<R>;

    fn deref(&self) -> &Self::Target {
        &self.peer
    }
}

impl<R: ServiceRole, S: Service<R>> RunningService<R, S> {
    pub fn peer(&self) -> &Peer<R> {
        &self.peer
    }
    pub fn service(&self) -> &S {
        self.service.as_ref()
    }
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ct.clone()
    }
    /// Wait for the session to end on its own.
    pub async fn waiting(self) -> Result<QuitReason, tokio::task::JoinError> {
        self.handle.await
    }
    /// Shut the session down and wait for the event loop to drain.
    pub async fn cancel(self) -> Result<QuitReason, tokio::task::JoinError> {
        self.ct.cancel();
        self.waiting().await
    }
}

pub trait ServiceExt<R: ServiceRole>: Service<R> + Sized {
    /// Connect a transport, run the initialization handshake and spawn
    /// the session's event loop.
    fn serve<T, E, A>(
        self,
        transport: T,
    ) -> impl Future<Output = Result<RunningService<R, Self>, R::InitializeError>> + Send
    where
        T: IntoTransport<R, E, A>,
        E: std::error::Error + Send + Sync + 'static,
        Self: Sized,
    {
        self.serve_with_ct(transport, Default::default())
    }
    fn serve_with_ct<T, E, A>(
        self,
        transport: T,
        ct: CancellationToken,
    ) -> impl Future<Output = Result<RunningService<R, Self>, R::InitializeError>> + Send
    where
        T: IntoTransport<R, E, A>,
        E: std::error::Error + Send + Sync + 'static,
        Self: Sized;
}

/// Serve a pre-initialized transport, skipping the handshake. The
/// caller supplies the peer info captured elsewhere, if any.
pub fn serve_directly<R, S, T, E, A>(
    service: S,
    transport: T,
    peer_info: Option<R::PeerInfo>,
) -> RunningService<R, S>
where
    R: ServiceRole,
    S: Service<R>,
    T: IntoTransport<R, E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    serve_directly_with_ct(service, transport, peer_info, Default::default())
}

pub fn serve_directly_with_ct<R, S, T, E, A>(
    service: S,
    transport: T,
    peer_info: Option<R::PeerInfo>,
    ct: CancellationToken,
) -> RunningService<R, S>
where
    R: ServiceRole,
    S: Service<R>,
    T: IntoTransport<R, E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    let id_provider = <Arc<AtomicU32RequestIdProvider>>::default();
    let (peer, peer_rx) = Peer::new(id_provider, peer_info);
    serve_inner(
        service,
        transport.into_transport(),
        peer,
        peer_rx,
        Vec::new(),
        ct,
    )
}

struct PendingOutbound<R: ServiceRole> {
    responder: Responder<Result<R::PeerResp, ServiceError>>,
    progress_token: Option<ProgressToken>,
    progress_tx: Option<mpsc::Sender<ProgressNotificationParam>>,
}

enum LoopEvent<R: ServiceRole> {
    Outbound(PeerSinkMessage<R>),
    Inbound(RxJsonRpcMessage<R>),
    HandlerResponse {
        id: RequestId,
        result: Result<R::Resp, ErrorData>,
    },
}

pub(crate) fn serve_inner<R, S, T>(
    service: S,
    mut transport: T,
    peer: Peer<R>,
    mut peer_rx: PeerReceiver<R>,
    deferred: Vec<RxJsonRpcMessage<R>>,
    ct: CancellationToken,
) -> RunningService<R, S>
where
    R: ServiceRole,
    S: Service<R>,
    T: Transport<R> + 'static,
{
    let service = Arc::new(service);
    let peer_return = peer.clone();
    let service_return = service.clone();
    let ct_return = ct.clone();
    let serve_span = tracing::debug_span!(
        "serve",
        role = if R::IS_CLIENT { "client" } else { "server" }
    );
    let event_loop = async move {
        let mut pending: HashMap<RequestId, PendingOutbound<R>> = HashMap::new();
        let mut inbound_cts: HashMap<RequestId, CancelSignal> = HashMap::new();
        let (event_tx, mut event_rx) =
            mpsc::unbounded_channel::<(RequestId, Result<R::Resp, ErrorData>)>();

        let mut backlog = deferred.into_iter().collect::<std::collections::VecDeque<_>>();
        let quit_reason = loop {
            let event = if let Some(message) = backlog.pop_front() {
                LoopEvent::Inbound(message)
            } else {
                tokio::select! {
                    _ = ct.cancelled() => {
                        break QuitReason::Cancelled;
                    }
                    outbound = peer_rx.recv() => {
                        match outbound {
                            Some(message) => LoopEvent::Outbound(message),
                            None => break QuitReason::PeerDropped,
                        }
                    }
                    inbound = transport.receive() => {
                        match inbound {
                            Some(message) => LoopEvent::Inbound(message),
                            None => break QuitReason::Closed,
                        }
                    }
                    handler_response = event_rx.recv() => {
                        // the loop owns a sender, so recv never yields None
                        match handler_response {
                            Some((id, result)) => LoopEvent::HandlerResponse { id, result },
                            None => continue,
                        }
                    }
                }
            };
            match event {
                LoopEvent::Outbound(PeerSinkMessage::Request {
                    request,
                    id,
                    responder,
                    progress_tx,
                }) => {
                    let progress_token = request.get_meta().and_then(Meta::get_progress_token);
                    pending.insert(
                        id.clone(),
                        PendingOutbound {
                            responder,
                            progress_token,
                            progress_tx,
                        },
                    );
                    let send_result = transport
                        .send(TxJsonRpcMessage::<R>::request(request, id.clone()))
                        .await;
                    if let Err(error) = send_result {
                        tracing::warn!(%id, %error, "failed to send request");
                        if let Some(entry) = pending.remove(&id) {
                            let _ = entry.responder.send(Err(ServiceError::TransportSend(
                                DynamicTransportError::new::<T, _>(error),
                            )));
                        }
                    }
                }
                LoopEvent::Outbound(PeerSinkMessage::Notification {
                    notification,
                    responder,
                }) => {
                    let result = transport
                        .send(TxJsonRpcMessage::<R>::notification(notification))
                        .await
                        .map_err(|error| {
                            ServiceError::TransportSend(DynamicTransportError::new::<T, _>(error))
                        });
                    let _ = responder.send(result);
                }
                LoopEvent::Outbound(PeerSinkMessage::CancelRequest { id }) => {
                    // late responses for this id are stale from now on
                    pending.remove(&id);
                }
                LoopEvent::Inbound(message) => {
                    handle_inbound::<R, S>(
                        message,
                        &service,
                        &peer,
                        &mut pending,
                        &mut inbound_cts,
                        &event_tx,
                    );
                }
                LoopEvent::HandlerResponse { id, result } => {
                    inbound_cts.remove(&id);
                    let message = match result {
                        Ok(result) => TxJsonRpcMessage::<R>::response(result, id),
                        Err(error) => TxJsonRpcMessage::<R>::error(error, id),
                    };
                    if let Err(error) = transport.send(message).await {
                        tracing::warn!(%error, "failed to send response");
                    }
                }
            }
        };
        // every outstanding request fails terminally
        for (_, entry) in pending.drain() {
            let _ = entry.responder.send(Err(ServiceError::TransportClosed));
        }
        for (_, signal) in inbound_cts.drain() {
            signal.cancel(Some("session closed".to_string()));
        }
        if let Err(error) = transport.close().await {
            tracing::warn!(%error, "error closing transport");
        }
        tracing::debug!(?quit_reason, "serve loop terminated");
        quit_reason
    };
    let handle = tokio::spawn(tracing::Instrument::instrument(event_loop, serve_span));
    RunningService {
        service: service_return,
        peer: peer_return,
        handle,
        ct: ct_return,
    }
}

fn handle_inbound<R: ServiceRole, S: Service<R>>(
    message: RxJsonRpcMessage<R>,
    service: &Arc<S>,
    peer: &Peer<R>,
    pending: &mut HashMap<RequestId, PendingOutbound<R>>,
    inbound_cts: &mut HashMap<RequestId, CancelSignal>,
    event_tx: &mpsc::UnboundedSender<(RequestId, Result<R::Resp, ErrorData>)>,
) {
    match message {
        JsonRpcMessage::Request(request) => {
            dispatch_request::<R, S>(request.request, request.id, service, peer, inbound_cts, event_tx);
        }
        JsonRpcMessage::Response(response) => {
            let Some(entry) = pending.remove(&response.id) else {
                tracing::debug!(id = %response.id, "dropping stale response");
                return;
            };
            let _ = entry.responder.send(Ok(response.result));
        }
        JsonRpcMessage::Error(error) => {
            let Some(entry) = pending.remove(&error.id) else {
                tracing::debug!(id = %error.id, "dropping stale error response");
                return;
            };
            let _ = entry.responder.send(Err(ServiceError::McpError(error.error)));
        }
        JsonRpcMessage::Notification(notification) => {
            dispatch_notification::<R, S>(notification.notification, service, peer, pending, inbound_cts);
        }
        JsonRpcMessage::BatchRequest(items) => {
            for item in items {
                match item {
                    crate::model::JsonRpcBatchRequestItem::Request(request) => {
                        dispatch_request::<R, S>(
                            request.request,
                            request.id,
                            service,
                            peer,
                            inbound_cts,
                            event_tx,
                        );
                    }
                    crate::model::JsonRpcBatchRequestItem::Notification(notification) => {
                        dispatch_notification::<R, S>(
                            notification.notification,
                            service,
                            peer,
                            pending,
                            inbound_cts,
                        );
                    }
                }
            }
        }
        JsonRpcMessage::BatchResponse(items) => {
            for item in items {
                let message = match item {
                    crate::model::JsonRpcBatchResponseItem::Response(r) => {
                        JsonRpcMessage::Response(r)
                    }
                    crate::model::JsonRpcBatchResponseItem::Error(e) => JsonRpcMessage::Error(e),
                };
                handle_inbound::<R, S>(message, service, peer, pending, inbound_cts, event_tx);
            }
        }
    }
}

fn dispatch_request<R: ServiceRole, S: Service<R>>(
    request: R::PeerReq,
    id: RequestId,
    service: &Arc<S>,
    peer: &Peer<R>,
    inbound_cts: &mut HashMap<RequestId, CancelSignal>,
    event_tx: &mpsc::UnboundedSender<(RequestId, Result<R::Resp, ErrorData>)>,
) {
    let signal = CancelSignal::new();
    inbound_cts.insert(id.clone(), signal.clone());
    let context = RequestContext {
        ct: signal,
        id: id.clone(),
        meta: request.get_meta().cloned().unwrap_or_default(),
        extensions: request.extensions().clone(),
        peer: peer.clone(),
    };
    let service = service.clone();
    let event_tx = event_tx.clone();
    tokio::spawn(async move {
        let result = service.handle_request(request, context).await;
        let _ = event_tx.send((id, result));
    });
}

fn dispatch_notification<R: ServiceRole, S: Service<R>>(
    notification: R::PeerNot,
    service: &Arc<S>,
    peer: &Peer<R>,
    pending: &mut HashMap<RequestId, PendingOutbound<R>>,
    inbound_cts: &mut HashMap<RequestId, CancelSignal>,
) {
    if let Some(cancelled) = notification.as_cancelled() {
        if let Some(signal) = inbound_cts.remove(&cancelled.request_id) {
            tracing::info!(id = %cancelled.request_id, reason = ?cancelled.reason, "peer cancelled request");
            signal.cancel(cancelled.reason.clone());
        }
    } else if let Some(progress) = notification.as_progress() {
        let entry = pending
            .values_mut()
            .find(|entry| entry.progress_token.as_ref() == Some(&progress.progress_token));
        if let Some(PendingOutbound {
            progress_tx: Some(progress_tx),
            ..
        }) = entry
        {
            if let Err(error) = progress_tx.try_send(progress.clone()) {
                tracing::warn!(%error, "progress subscriber not keeping up, dropping notification");
            }
        }
    }
    let context = NotificationContext {
        meta: Meta::default(),
        extensions: Extensions::new(),
        peer: peer.clone(),
    };
    let service = service.clone();
    // notification handlers run concurrently; their errors are logged,
    // never propagated to the peer
    tokio::spawn(async move {
        if let Err(error) = service.handle_notification(notification, context).await {
            tracing::error!(%error, "notification handler failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_id_provider_is_monotonic() {
        let provider = AtomicU32RequestIdProvider::default();
        let a = provider.next_request_id();
        let b = provider.next_request_id();
        assert_ne!(a, b);
        assert_eq!(a, RequestId::Number(0));
        assert_eq!(b, RequestId::Number(1));
    }

    #[test]
    fn test_service_error_cancelled_display() {
        let error = ServiceError::Cancelled {
            reason: Some("Cancelled by test".into()),
        };
        assert_eq!(error.to_string(), "Request cancelled: Cancelled by test");
    }
}
