use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// A one-shot abort signal that carries an optional human-readable
/// reason.
///
/// Built on [`CancellationToken`], so cancelling a signal also cancels
/// every child created with [`CancelSignal::child`]. The reason is
/// resolved from the nearest ancestor that recorded one.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelSignalInner>,
}

#[derive(Debug, Default)]
struct CancelSignalInner {
    token: CancellationToken,
    reason: OnceLock<Option<String>>,
    parent: Option<Arc<CancelSignalInner>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that fires when this one does, and can also be fired on
    /// its own without affecting the parent.
    pub fn child(&self) -> CancelSignal {
        CancelSignal {
            inner: Arc::new(CancelSignalInner {
                token: self.inner.token.child_token(),
                reason: OnceLock::new(),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    /// Fire the signal. The first recorded reason wins; later calls are
    /// no-ops.
    pub fn cancel(&self, reason: Option<String>) {
        let _ = self.inner.reason.set(reason);
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        let mut node = Some(&self.inner);
        while let Some(inner) = node {
            if let Some(reason) = inner.reason.get() {
                return reason.clone();
            }
            node = inner.parent.as_ref();
        }
        None
    }

    /// Resolves with the recorded reason once the signal (or one of its
    /// ancestors) fires.
    pub async fn cancelled(&self) -> Option<String> {
        self.inner.token.cancelled().await;
        self.reason()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_with_reason() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        signal.cancel(Some("stop".into()));
        assert!(signal.is_cancelled());
        assert_eq!(signal.cancelled().await.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_parent_propagates_to_child() {
        let parent = CancelSignal::new();
        let child = parent.child();
        parent.cancel(Some("parent gone".into()));
        assert!(child.is_cancelled());
        assert_eq!(child.cancelled().await.as_deref(), Some("parent gone"));
    }

    #[tokio::test]
    async fn test_child_does_not_propagate_up() {
        let parent = CancelSignal::new();
        let child = parent.child();
        child.cancel(None);
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_first_reason_wins() {
        let signal = CancelSignal::new();
        signal.cancel(Some("first".into()));
        signal.cancel(Some("second".into()));
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }
}
