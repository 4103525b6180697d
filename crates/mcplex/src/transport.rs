//! Duplex message channels between a service and its peer.
//!
//! A [`Transport`] moves whole JSON-RPC envelopes in both directions and
//! is consumed exclusively by the service runtime: once a transport is
//! handed to [`serve_client`](crate::serve_client) or
//! [`serve_server`](crate::serve_server) the runtime owns it until the
//! session ends.
//!
//! | transport | client | server |
//! |:-:|:-:|:-:|
//! | raw byte pipes | [`async_rw`] | [`async_rw`] |
//! | streamable http | [`streamable_http_client`] | [`streamable_http_server`] |
//! | legacy two-endpoint sse | [`sse_client`] | [`sse_server`] |
//!
//! Anything that implements [`IntoTransport`] can be served, including a
//! `(Sink, Stream)` pair and a `(AsyncRead, AsyncWrite)` pair.
use futures::{Sink, Stream};

use crate::service::{RxJsonRpcMessage, ServiceRole, TxJsonRpcMessage};

#[cfg(feature = "transport-async-rw")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-async-rw")))]
pub mod async_rw;

#[cfg(feature = "transport-worker")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-worker")))]
pub mod worker;
#[cfg(feature = "transport-worker")]
pub use worker::WorkerTransport;

pub mod common;

#[cfg(feature = "transport-streamable-http-client")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-streamable-http-client")))]
pub mod streamable_http_client;
#[cfg(feature = "transport-streamable-http-client")]
pub use streamable_http_client::StreamableHttpClientTransport;

#[cfg(feature = "transport-streamable-http-server")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-streamable-http-server")))]
pub mod streamable_http_server;
#[cfg(feature = "transport-streamable-http-server")]
pub use streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};

#[cfg(feature = "transport-sse-client")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-sse-client")))]
pub mod sse_client;
#[cfg(feature = "transport-sse-client")]
pub use sse_client::SseClientTransport;

#[cfg(feature = "transport-sse-server")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-sse-server")))]
pub mod sse_server;
#[cfg(feature = "transport-sse-server")]
pub use sse_server::SseServer;

#[cfg(feature = "auth")]
#[cfg_attr(docsrs, doc(cfg(feature = "auth")))]
pub mod auth;

#[cfg(feature = "middleware")]
#[cfg_attr(docsrs, doc(cfg(feature = "middleware")))]
pub mod middleware;

/// A duplex channel moving one JSON-RPC envelope per call.
///
/// The three methods map onto the lifecycle the runtime drives: `send`
/// for outbound envelopes, `receive` for inbound ones (`None` means the
/// peer is gone), `close` for graceful shutdown.
///
/// The future returned by `send` must not borrow the transport, so the
/// runtime can keep receiving while a send is in flight.
pub trait Transport<R: ServiceRole>: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn send(
        &mut self,
        item: TxJsonRpcMessage<R>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static;

    fn receive(&mut self) -> impl Future<Output = Option<RxJsonRpcMessage<R>>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// A type-erased transport error, so service-level errors do not need a
/// generic parameter per transport.
#[derive(Debug)]
pub struct DynamicTransportError {
    pub transport_type: std::any::TypeId,
    pub transport_type_name: &'static str,
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl std::fmt::Display for DynamicTransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {}", self.transport_type_name, self.error)
    }
}

impl std::error::Error for DynamicTransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

impl DynamicTransportError {
    pub fn new<T: 'static, E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self {
            transport_type: std::any::TypeId::of::<T>(),
            transport_type_name: std::any::type_name::<T>(),
            error: Box::new(error),
        }
    }
}

/// Conversion of various channel shapes into a [`Transport`].
///
/// The unconstrained type parameter `A` serves as an adapter marker so
/// that multiple blanket impls can coexist.
pub trait IntoTransport<R, E, A>: Send + 'static
where
    R: ServiceRole,
    E: std::error::Error + Send + 'static,
{
    fn into_transport(self) -> impl Transport<R, Error = E> + 'static;
}

/// Adapter marker: the type already is a transport.
pub enum TransportAdapterIdentity {}
/// Adapter marker: a `(Sink, Stream)` pair.
pub enum TransportAdapterSinkStream {}
/// Adapter marker: one object that is both `Sink` and `Stream`.
pub enum TransportAdapterCombinedSinkStream {}
/// Adapter marker: a `(AsyncRead, AsyncWrite)` pair.
pub enum TransportAdapterAsyncRw {}
/// Adapter marker: one object that is both `AsyncRead` and `AsyncWrite`.
pub enum TransportAdapterAsyncCombinedRw {}

impl<R, T> IntoTransport<R, T::Error, TransportAdapterIdentity> for T
where
    T: Transport<R> + Send + 'static,
    R: ServiceRole,
{
    fn into_transport(self) -> impl Transport<R, Error = T::Error> + 'static {
        self
    }
}

/// Transport over a `futures` sink/stream pair.
///
/// A sink is not clonable in general, so sends go through a forwarding
/// task that owns the sink; the returned send future stays `'static` and
/// resolves once the sink has accepted the item. Sink errors are
/// surfaced as `std::io::Error`.
pub struct SinkStreamTransport<R: ServiceRole, St> {
    outbound_tx: Option<
        tokio::sync::mpsc::Sender<(
            TxJsonRpcMessage<R>,
            tokio::sync::oneshot::Sender<Result<(), std::io::Error>>,
        )>,
    >,
    stream: St,
}

impl<R: ServiceRole, St> SinkStreamTransport<R, St> {
    pub fn new<Si>(mut sink: Si, stream: St) -> Self
    where
        Si: Sink<TxJsonRpcMessage<R>> + Send + Unpin + 'static,
        Si::Error: std::error::Error + Send + Sync + 'static,
    {
        use futures::SinkExt;
        let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<(
            TxJsonRpcMessage<R>,
            tokio::sync::oneshot::Sender<Result<(), std::io::Error>>,
        )>(16);
        tokio::spawn(async move {
            while let Some((item, ack)) = outbound_rx.recv().await {
                let result = sink.send(item).await.map_err(std::io::Error::other);
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        Self {
            outbound_tx: Some(outbound_tx),
            stream,
        }
    }
}

impl<R, St> Transport<R> for SinkStreamTransport<R, St>
where
    R: ServiceRole,
    St: Stream<Item = RxJsonRpcMessage<R>> + Send + Unpin + 'static,
{
    type Error = std::io::Error;

    fn send(
        &mut self,
        item: TxJsonRpcMessage<R>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        let outbound_tx = self.outbound_tx.clone();
        async move {
            let Some(outbound_tx) = outbound_tx else {
                return Err(std::io::Error::other("transport closed"));
            };
            let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
            outbound_tx
                .send((item, ack_tx))
                .await
                .map_err(|_| std::io::Error::other("sink task terminated"))?;
            ack_rx
                .await
                .map_err(|_| std::io::Error::other("sink task terminated"))?
        }
    }

    fn receive(&mut self) -> impl Future<Output = Option<RxJsonRpcMessage<R>>> + Send {
        use futures::StreamExt;
        self.stream.next()
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        // dropping the channel lets the forwarding task close the sink
        self.outbound_tx.take();
        Ok(())
    }
}

impl<R, Si, St> IntoTransport<R, std::io::Error, TransportAdapterSinkStream> for (Si, St)
where
    R: ServiceRole,
    Si: Sink<TxJsonRpcMessage<R>> + Send + Unpin + 'static,
    Si::Error: std::error::Error + Send + Sync + 'static,
    St: Stream<Item = RxJsonRpcMessage<R>> + Send + Unpin + 'static,
{
    fn into_transport(self) -> impl Transport<R, Error = std::io::Error> + 'static {
        SinkStreamTransport::new(self.0, self.1)
    }
}

impl<R, T> IntoTransport<R, std::io::Error, TransportAdapterCombinedSinkStream> for T
where
    R: ServiceRole,
    T: Sink<TxJsonRpcMessage<R>> + Stream<Item = RxJsonRpcMessage<R>> + Send + Unpin + 'static,
    <T as Sink<TxJsonRpcMessage<R>>>::Error: std::error::Error + Send + Sync + 'static,
{
    fn into_transport(self) -> impl Transport<R, Error = std::io::Error> + 'static {
        use futures::StreamExt;
        let (sink, stream) = self.split();
        SinkStreamTransport::new(sink, stream)
    }
}

#[cfg(feature = "transport-async-rw")]
impl<R, Rd, Wr> IntoTransport<R, std::io::Error, TransportAdapterAsyncRw> for (Rd, Wr)
where
    R: ServiceRole,
    Rd: tokio::io::AsyncRead + Send + Unpin + 'static,
    Wr: tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    fn into_transport(self) -> impl Transport<R, Error = std::io::Error> + 'static {
        async_rw::AsyncRwTransport::new(self.0, self.1)
    }
}

#[cfg(feature = "transport-async-rw")]
impl<R, S> IntoTransport<R, std::io::Error, TransportAdapterAsyncCombinedRw> for S
where
    R: ServiceRole,
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    fn into_transport(self) -> impl Transport<R, Error = std::io::Error> + 'static {
        let (read, write) = tokio::io::split(self);
        async_rw::AsyncRwTransport::new(read, write)
    }
}

/// A transport that feeds exactly one inbound message to the service and
/// forwards everything the service sends to an mpsc receiver. Used by the
/// stateless mode of the streamable HTTP server.
pub struct OneshotTransport<R: ServiceRole> {
    message: Option<RxJsonRpcMessage<R>>,
    tx: tokio::sync::mpsc::Sender<TxJsonRpcMessage<R>>,
}

impl<R: ServiceRole> OneshotTransport<R> {
    pub fn new(
        message: RxJsonRpcMessage<R>,
    ) -> (Self, tokio::sync::mpsc::Receiver<TxJsonRpcMessage<R>>) {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        (
            Self {
                message: Some(message),
                tx,
            },
            rx,
        )
    }
}

impl<R: ServiceRole> Transport<R> for OneshotTransport<R> {
    type Error = std::io::Error;

    fn send(
        &mut self,
        item: TxJsonRpcMessage<R>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        let tx = self.tx.clone();
        async move {
            tx.send(item)
                .await
                .map_err(|_| std::io::Error::other("response receiver dropped"))
        }
    }

    async fn receive(&mut self) -> Option<RxJsonRpcMessage<R>> {
        match self.message.take() {
            Some(message) => Some(message),
            // keep the transport open until the service is cancelled, so
            // notifications emitted by the handler still flow out
            None => {
                std::future::pending::<()>().await;
                None
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
