//! Shared pieces of the HTTP-serving transports: session ids, SSE
//! response bodies, DNS-rebinding protection and small response
//! helpers over raw `http` types.
use std::{convert::Infallible, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::{Response, StatusCode, header};
use http_body::Frame;
use http_body_util::{BodyExt, Full, StreamBody, combinators::UnsyncBoxBody};

use super::http_header::{EVENT_STREAM_MIME_TYPE, HEADER_X_ACCEL_BUFFERING, JSON_MIME_TYPE};
use crate::model::ServerJsonRpcMessage;

pub type SessionId = Arc<str>;

pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

/// One server→client envelope plus the event id it is replayable under.
#[derive(Debug, Clone)]
pub struct ServerSseMessage {
    pub event_id: Option<String>,
    pub message: Arc<ServerJsonRpcMessage>,
}

pub type BoxResponse = Response<UnsyncBoxBody<Bytes, Infallible>>;

pub(crate) fn accepted_response() -> BoxResponse {
    Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(Full::new(Bytes::new()).boxed_unsync())
        .expect("valid response")
}

pub(crate) fn empty_response(status: StatusCode) -> BoxResponse {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()).boxed_unsync())
        .expect("valid response")
}

pub(crate) fn problem_response(status: StatusCode, body: &'static str) -> BoxResponse {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from_static(body.as_bytes())).boxed_unsync())
        .expect("valid response")
}

pub(crate) fn json_response(message: &ServerJsonRpcMessage) -> BoxResponse {
    let body = serde_json::to_vec(message).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, JSON_MIME_TYPE)
        .body(Full::new(Bytes::from(body)).boxed_unsync())
        .expect("valid response")
}

fn sse_frame(message: &ServerSseMessage) -> Bytes {
    let data = serde_json::to_string(message.message.as_ref()).unwrap_or_else(|_| "{}".into());
    let mut out = String::with_capacity(data.len() + 32);
    if let Some(event_id) = &message.event_id {
        out.push_str("id: ");
        out.push_str(event_id);
        out.push('\n');
    }
    out.push_str("event: message\ndata: ");
    out.push_str(&data);
    out.push_str("\n\n");
    Bytes::from(out)
}

pin_project_lite::pin_project! {
    /// Serializes [`ServerSseMessage`]s into SSE frames, injecting a
    /// `:ping` comment whenever the inner stream stays idle for the
    /// keep-alive interval.
    struct SseBodyStream<S> {
        #[pin]
        inner: S,
        keep_alive: Option<tokio::time::Interval>,
        done: bool,
    }
}

impl<S: Stream<Item = ServerSseMessage>> Stream for SseBodyStream<S> {
    type Item = Result<Frame<Bytes>, Infallible>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return std::task::Poll::Ready(None);
        }
        match this.inner.poll_next(cx) {
            std::task::Poll::Ready(Some(message)) => {
                if let Some(interval) = this.keep_alive.as_mut() {
                    interval.reset();
                }
                std::task::Poll::Ready(Some(Ok(Frame::data(sse_frame(&message)))))
            }
            std::task::Poll::Ready(None) => {
                *this.done = true;
                std::task::Poll::Ready(None)
            }
            std::task::Poll::Pending => {
                if let Some(interval) = this.keep_alive.as_mut()
                    && interval.poll_tick(cx).is_ready()
                {
                    return std::task::Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(
                        b":ping\n\n",
                    )))));
                }
                std::task::Poll::Pending
            }
        }
    }
}

pub(crate) fn sse_stream_response(
    stream: impl Stream<Item = ServerSseMessage> + Send + 'static,
    keep_alive: Option<Duration>,
) -> BoxResponse {
    let keep_alive = keep_alive.map(|duration| {
        let mut interval = tokio::time::interval(duration);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval
    });
    let body = StreamBody::new(SseBodyStream {
        inner: stream.boxed(),
        keep_alive,
        done: false,
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, EVENT_STREAM_MIME_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(HEADER_X_ACCEL_BUFFERING, "no")
        .body(body.boxed_unsync())
        .expect("valid response")
}

/// Optional allowlists for the `Host` and `Origin` headers of inbound
/// HTTP requests, guarding local servers against DNS-rebinding attacks.
///
/// Both lists are matched case-insensitively and an empty list means
/// the corresponding header is not checked, so the default value
/// enforces nothing.
#[derive(Debug, Clone, Default)]
pub struct DnsRebindingProtection {
    pub allowed_hosts: Vec<String>,
    pub allowed_origins: Vec<String>,
}

impl DnsRebindingProtection {
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.push(host.into());
        self
    }

    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    pub fn permits(&self, headers: &http::HeaderMap) -> bool {
        if !self.allowed_hosts.is_empty() {
            let permitted = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|host| {
                    self.allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
                });
            if !permitted {
                return false;
            }
        }
        if !self.allowed_origins.is_empty() {
            let permitted = headers
                .get(header::ORIGIN)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|origin| {
                    self.allowed_origins
                        .iter()
                        .any(|o| o.eq_ignore_ascii_case(origin))
                });
            if !permitted {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> http::HeaderMap {
        let mut map = http::HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::header::HeaderName::try_from(*name).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_rebinding_protection_off_by_default() {
        let protection = DnsRebindingProtection::default();
        assert!(protection.permits(&headers(&[("host", "evil.example.com")])));
    }

    #[test]
    fn test_rebinding_protection_host_allowlist() {
        let protection = DnsRebindingProtection::default().allow_host("127.0.0.1:8080");
        assert!(protection.permits(&headers(&[("host", "127.0.0.1:8080")])));
        assert!(!protection.permits(&headers(&[("host", "evil.example.com")])));
        assert!(!protection.permits(&headers(&[])));
    }

    #[test]
    fn test_rebinding_protection_origin_allowlist() {
        let protection = DnsRebindingProtection::default().allow_origin("http://localhost:8080");
        assert!(protection.permits(&headers(&[("origin", "http://localhost:8080")])));
        assert!(!protection.permits(&headers(&[("origin", "http://evil.example.com")])));
    }

    #[test]
    fn test_sse_frame_layout() {
        let message = ServerSseMessage {
            event_id: Some("0/3".into()),
            message: Arc::new(crate::model::ServerJsonRpcMessage::response(
                crate::model::ServerResult::empty(()),
                crate::model::RequestId::Number(1),
            )),
        };
        let frame = sse_frame(&message);
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("id: 0/3\n"));
        assert!(text.contains("event: message\ndata: {"));
        assert!(text.ends_with("\n\n"));
    }
}
