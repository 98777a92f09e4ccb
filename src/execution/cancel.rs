//! Cancellation signals
//!
//! A `CancelSource` fires its tokens when `cancel()` is called or when the source
//! is dropped. Tokens made from a child source also fire when any ancestor does.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
    parent: Option<CancelToken>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx, parent: None }
    }

    /// A source whose tokens also observe `parent`
    pub fn child_of(parent: &CancelToken) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            parent: Some(parent.clone()),
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
            parent: self.parent.clone().map(Arc::new),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        // A dropped source counts as cancelled
        let own = *self.rx.borrow() || self.rx.has_changed().is_err();
        own || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Resolves once this token or any ancestor is cancelled
    pub fn cancelled(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let own = wait_for_cancel(self.rx.clone());
            match &self.parent {
                None => own.await,
                Some(parent) => {
                    tokio::select! {
                        _ = own => {}
                        _ = parent.cancelled() => {}
                    }
                }
            }
        })
    }
}

async fn wait_for_cancel(mut rx: watch::Receiver<bool>) {
    // Err means the source was dropped
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}
