//! Hierarchical cancellation.
//!
//! A [`CancelSource`] owns a cancel flag; [`CancelSource::child`] creates a
//! source that is cancelled together with its parent but can also be
//! cancelled on its own. The daemon holds the root, every session holds a
//! child.

use std::sync::Arc;

use tokio::sync::watch;

/// Observer side of a cancel flag.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is set. Never resolves if the source is gone
    /// without having cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Owner side of a cancel flag.
#[derive(Debug)]
pub struct CancelSource {
    tx: Arc<watch::Sender<bool>>,
    // Keeps the channel open while the source lives, so the forwarding task
    // of a child only exits once the child and all its tokens are dropped.
    _keep: watch::Receiver<bool>,
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, keep) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            _keep: keep,
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// A source cancelled whenever this one is.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn child(&self) -> CancelSource {
        let child = CancelSource::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }
        let parent = self.token();
        let tx = child.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => {
                    tx.send_replace(true);
                }
                _ = tx.closed() => {}
            }
        });
        child
    }
}
