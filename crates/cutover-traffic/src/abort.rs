//! External abort signal
//!
//! A `watch` channel holding the first abort reason. The handle side is given
//! to whoever may cancel the run; the signal side is polled at every tick and
//! before every provisioning step.

use std::sync::Arc;
use tokio::sync::watch;

/// Requests an abort
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<Option<String>>>,
}

/// Observes abort requests
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<String>>,
}

/// Create a connected handle/signal pair
#[must_use]
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(None);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

impl AbortHandle {
    /// Request an abort; only the first reason is kept
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let first = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.clone());
                true
            } else {
                false
            }
        });
        if first {
            tracing::warn!(%reason, "abort requested");
        }
    }

    /// A new signal observing this handle
    #[must_use]
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl AbortSignal {
    /// A signal that never fires
    #[must_use]
    pub fn never() -> Self {
        abort_pair().1
    }

    /// Reason of the pending abort, if any
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Whether an abort was requested
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for an abort; pends forever once every handle is gone
    pub async fn aborted(&mut self) -> String {
        loop {
            if let Some(reason) = self.rx.borrow_and_update().clone() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
