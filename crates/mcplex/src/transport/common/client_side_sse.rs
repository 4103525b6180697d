//! Shared pieces of the SSE-consuming client transports.
use std::time::Duration;

use futures::stream::BoxStream;
use sse_stream::{Error as SseError, Sse};

pub type BoxedSseResponse = BoxStream<'static, Result<Sse, SseError>>;

/// How an SSE consumer reconnects after the stream breaks.
///
/// The interval may be lowered by a server-sent `retry:` field, and the
/// consumer resumes with `Last-Event-ID` where it left off.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct SseRetryPolicy {
    /// Give up after this many consecutive failed reconnects; `None`
    /// retries forever.
    pub max_times: Option<usize>,
    pub min_duration: Duration,
}

impl SseRetryPolicy {
    pub const DEFAULT_MIN_DURATION: Duration = Duration::from_millis(1000);
}

impl Default for SseRetryPolicy {
    fn default() -> Self {
        Self {
            max_times: None,
            min_duration: Self::DEFAULT_MIN_DURATION,
        }
    }
}

/// Decode the `data:` payload of one event, tracking the last seen
/// event id on the side.
pub fn decode_sse_data<T: serde::de::DeserializeOwned>(
    sse: &Sse,
) -> Option<Result<T, serde_json::Error>> {
    sse.data
        .as_deref()
        .map(|data| serde_json::from_slice(data.as_bytes()))
}
