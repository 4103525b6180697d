//! An actor-shaped transport: the protocol side talks to a mailbox, a
//! spawned worker task owns the real I/O. Both HTTP client transports
//! are workers.
use std::borrow::Cow;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::Transport;
use crate::service::{RxJsonRpcMessage, ServiceRole, TxJsonRpcMessage};

/// Why a worker's run loop ended.
#[derive(Debug, Error)]
pub enum WorkerQuitReason {
    #[error("cancelled")]
    Cancelled,
    #[error("handler terminated")]
    HandlerTerminated,
    #[error("transport fatal {error}, when {context}")]
    Fatal {
        error: Cow<'static, str>,
        context: Cow<'static, str>,
    },
}

impl WorkerQuitReason {
    pub fn fatal(
        error: impl Into<Cow<'static, str>>,
        context: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::Fatal {
            error: error.into(),
            context: context.into(),
        }
    }
    /// `map_err` helper: wraps any error with the phase it happened in.
    pub fn fatal_context<E: std::fmt::Display>(
        context: impl Into<Cow<'static, str>>,
    ) -> impl FnOnce(E) -> Self {
        let context = context.into();
        move |error| Self::Fatal {
            error: error.to_string().into(),
            context,
        }
    }
}

pub struct WorkerSendRequest<W: Worker> {
    pub message: TxJsonRpcMessage<W::Role>,
    pub responder: oneshot::Sender<Result<(), W::Error>>,
}

pub struct WorkerConfig {
    pub name: Option<String>,
    pub channel_buffer_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            channel_buffer_capacity: 16,
        }
    }
}

pub trait Worker: Sized + Send + 'static {
    type Role: ServiceRole;
    type Error: std::error::Error + Send + Sync + 'static;

    fn err_closed() -> Self::Error;
    fn err_join(e: tokio::task::JoinError) -> Self::Error;
    fn config(&self) -> WorkerConfig {
        WorkerConfig::default()
    }
    fn run(
        self,
        context: WorkerContext<Self>,
    ) -> impl Future<Output = Result<(), WorkerQuitReason>> + Send;
}

/// The worker's side of the mailbox.
pub struct WorkerContext<W: Worker> {
    pub to_handler_tx: mpsc::Sender<RxJsonRpcMessage<W::Role>>,
    pub from_handler_rx: mpsc::Receiver<WorkerSendRequest<W>>,
    pub cancellation_token: CancellationToken,
}

impl<W: Worker> WorkerContext<W> {
    pub async fn send_to_handler(
        &mut self,
        item: RxJsonRpcMessage<W::Role>,
    ) -> Result<(), WorkerQuitReason> {
        self.to_handler_tx
            .send(item)
            .await
            .map_err(|_| WorkerQuitReason::HandlerTerminated)
    }
    pub async fn recv_from_handler(&mut self) -> Result<WorkerSendRequest<W>, WorkerQuitReason> {
        self.from_handler_rx
            .recv()
            .await
            .ok_or(WorkerQuitReason::HandlerTerminated)
    }
}

/// The protocol runtime's side of the mailbox.
pub struct WorkerTransport<W: Worker> {
    rx: mpsc::Receiver<RxJsonRpcMessage<W::Role>>,
    send_service: mpsc::Sender<WorkerSendRequest<W>>,
    join_handle: Option<tokio::task::JoinHandle<Result<(), WorkerQuitReason>>>,
    ct: CancellationToken,
}

impl<W: Worker> WorkerTransport<W> {
    pub fn spawn(worker: W) -> Self {
        Self::spawn_with_ct(worker, CancellationToken::new())
    }

    pub fn spawn_with_ct(worker: W, ct: CancellationToken) -> Self {
        let config = worker.config();
        let (to_handler_tx, from_worker_rx) = mpsc::channel(config.channel_buffer_capacity);
        let (to_worker_tx, from_handler_rx) = mpsc::channel(config.channel_buffer_capacity);
        let context = WorkerContext {
            to_handler_tx,
            from_handler_rx,
            cancellation_token: ct.clone(),
        };
        let worker_name = config.name.unwrap_or_else(|| {
            format!("worker-{}", std::any::type_name::<W>())
        });
        let join_handle = tokio::spawn(async move {
            let result = worker.run(context).await;
            match &result {
                Ok(_) | Err(WorkerQuitReason::Cancelled | WorkerQuitReason::HandlerTerminated) => {
                    tracing::debug!(worker = %worker_name, "worker quit");
                }
                Err(error) => {
                    tracing::error!(worker = %worker_name, %error, "worker quit with fatal error");
                }
            }
            result
        });
        Self {
            rx: from_worker_rx,
            send_service: to_worker_tx,
            join_handle: Some(join_handle),
            ct,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.ct.clone()
    }
}

impl<W: Worker> Transport<W::Role> for WorkerTransport<W> {
    type Error = W::Error;

    fn send(
        &mut self,
        item: TxJsonRpcMessage<W::Role>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        let tx = self.send_service.clone();
        async move {
            let (responder, receiver) = oneshot::channel();
            tx.send(WorkerSendRequest {
                message: item,
                responder,
            })
            .await
            .map_err(|_| W::err_closed())?;
            receiver.await.map_err(|_| W::err_closed())?
        }
    }

    async fn receive(&mut self) -> Option<RxJsonRpcMessage<W::Role>> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.ct.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await.map_err(W::err_join)?;
        }
        Ok(())
    }
}
