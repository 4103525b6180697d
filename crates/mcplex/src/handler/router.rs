//! Dynamic, method-name keyed dispatch.
//!
//! Where [`ServerHandler`](super::ServerHandler) fixes the set of
//! operations at compile time, a [`MethodRouter`] lets the host register
//! and replace handlers at runtime, with optional fallbacks for methods
//! nothing was registered for.
use std::{borrow::Cow, collections::HashMap};

use futures::future::BoxFuture;

use crate::{
    model::ErrorData,
    service::{NotificationContext, RequestContext, Service, ServiceRole},
};

type BoxRequestHandler<R> = Box<
    dyn Fn(
            <R as ServiceRole>::PeerReq,
            RequestContext<R>,
        ) -> BoxFuture<'static, Result<<R as ServiceRole>::Resp, ErrorData>>
        + Send
        + Sync,
>;

type BoxNotificationHandler<R> = Box<
    dyn Fn(<R as ServiceRole>::PeerNot, NotificationContext<R>) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

/// A [`Service`] that dispatches inbound requests and notifications on
/// their wire method name.
///
/// Registering a handler for a method replaces any prior handler for
/// that method. A request with no handler and no fallback is answered
/// with `MethodNotFound`; a notification with no handler is dropped.
pub struct MethodRouter<R: ServiceRole> {
    info: R::Info,
    request_handlers: HashMap<Cow<'static, str>, BoxRequestHandler<R>>,
    notification_handlers: HashMap<Cow<'static, str>, BoxNotificationHandler<R>>,
    fallback_request_handler: Option<BoxRequestHandler<R>>,
    fallback_notification_handler: Option<BoxNotificationHandler<R>>,
}

impl<R: ServiceRole> std::fmt::Debug for MethodRouter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRouter")
            .field("info", &self.info)
            .field(
                "request_methods",
                &self.request_handlers.keys().collect::<Vec<_>>(),
            )
            .field(
                "notification_methods",
                &self.notification_handlers.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<R: ServiceRole> MethodRouter<R> {
    pub fn new(info: R::Info) -> Self {
        Self {
            info,
            request_handlers: HashMap::new(),
            notification_handlers: HashMap::new(),
            fallback_request_handler: None,
            fallback_notification_handler: None,
        }
    }

    /// Register (or replace) the handler for one request method.
    pub fn register_request_handler<F, Fut>(
        &mut self,
        method: impl Into<Cow<'static, str>>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(R::PeerReq, RequestContext<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Resp, ErrorData>> + Send + 'static,
    {
        self.request_handlers.insert(
            method.into(),
            Box::new(move |request, context| Box::pin(handler(request, context))),
        );
        self
    }

    /// Register (or replace) the handler for one notification method.
    pub fn register_notification_handler<F, Fut>(
        &mut self,
        method: impl Into<Cow<'static, str>>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(R::PeerNot, NotificationContext<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.notification_handlers.insert(
            method.into(),
            Box::new(move |notification, context| Box::pin(handler(notification, context))),
        );
        self
    }

    /// Catch-all for requests no specific handler was registered for.
    pub fn set_fallback_request_handler<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(R::PeerReq, RequestContext<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Resp, ErrorData>> + Send + 'static,
    {
        self.fallback_request_handler = Some(Box::new(move |request, context| {
            Box::pin(handler(request, context))
        }));
        self
    }

    /// Catch-all for notifications no specific handler was registered
    /// for.
    pub fn set_fallback_notification_handler<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(R::PeerNot, NotificationContext<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.fallback_notification_handler = Some(Box::new(move |notification, context| {
            Box::pin(handler(notification, context))
        }));
        self
    }

    pub fn has_request_handler(&self, method: &str) -> bool {
        self.request_handlers.contains_key(method)
    }
}

impl<R: ServiceRole> Service<R> for MethodRouter<R>
where
    R::Info: Clone,
{
    fn handle_request(
        &self,
        request: R::PeerReq,
        context: RequestContext<R>,
    ) -> impl Future<Output = Result<R::Resp, ErrorData>> + Send + '_ {
        let method = R::peer_request_method(&request);
        let handler = self
            .request_handlers
            .get(method)
            .or(self.fallback_request_handler.as_ref());
        async move {
            match handler {
                Some(handler) => handler(request, context).await,
                None => Err(ErrorData::new(
                    crate::model::ErrorCode::METHOD_NOT_FOUND,
                    method,
                    None,
                )),
            }
        }
    }

    fn handle_notification(
        &self,
        notification: R::PeerNot,
        context: NotificationContext<R>,
    ) -> impl Future<Output = Result<(), ErrorData>> + Send + '_ {
        let method = R::peer_notification_method(&notification);
        let handler = self
            .notification_handlers
            .get(method)
            .or(self.fallback_notification_handler.as_ref());
        async move {
            if let Some(handler) = handler {
                handler(notification, context).await;
            } else {
                tracing::debug!(method, "no handler for notification");
            }
            Ok(())
        }
    }

    fn get_info(&self) -> R::Info {
        self.info.clone()
    }
}
