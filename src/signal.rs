//! Broadcast-once close signal
//!
//! Every link, circuit and stream owns one. Any holder may fire it; every
//! task waiting on it wakes, and it never resets.

use futures::channel::oneshot;
use futures::future::{FusedFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;

/// A cloneable close flag that can be fired exactly once
#[derive(Clone)]
pub struct CloseSignal {
    trigger: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    fired: Shared<oneshot::Receiver<()>>,
}

impl CloseSignal {
    /// Create a new, unfired signal
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            fired: rx.shared(),
        }
    }

    /// Fire the signal
    ///
    /// Returns `true` if this call was the one that fired it.
    pub fn fire(&self) -> bool {
        match self.trigger.lock().take() {
            Some(tx) => {
                // Our own receiver is held in `fired`, so this cannot fail.
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Whether the signal has been fired
    pub fn is_fired(&self) -> bool {
        self.trigger.lock().is_none()
    }

    /// A future that resolves once the signal fires
    pub fn wait(&self) -> impl FusedFuture<Output = ()> + Unpin + Send + 'static {
        self.fired.clone().map(|_| ())
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CloseSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseSignal")
            .field("fired", &self.is_fired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_once() {
        let signal = CloseSignal::new();
        let other = signal.clone();
        assert!(!other.is_fired());

        assert!(signal.fire());
        assert!(!other.fire());
        assert!(other.is_fired());
    }

    #[tokio::test]
    async fn test_wait_wakes_every_clone() {
        let signal = CloseSignal::new();
        let a = signal.wait();
        let b = signal.clone().wait();

        let waiter = tokio::spawn(async move {
            a.await;
            b.await;
        });

        signal.fire();
        waiter.await.unwrap();

        // Waiting after the fact resolves immediately
        signal.wait().await;
    }
}
