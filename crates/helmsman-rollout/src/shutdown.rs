//! Process-wide shutdown: a cancellation signal plus a barrier that
//! counts in-flight supervision episodes.
//!
//! Every held supervision lock carries a `BarrierToken`. `Shutdown::drain`
//! flips the signal, stops handing out tokens, and waits until every
//! outstanding token has been dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    signal: watch::Sender<bool>,
    /// Cloned into every token; taken on drain so the receiver can close.
    barrier: Mutex<Option<mpsc::Sender<()>>>,
    drained: tokio::sync::Mutex<mpsc::Receiver<()>>,
    in_flight: AtomicUsize,
}

/// Registration of one in-flight episode. Dropping it deregisters.
pub struct BarrierToken {
    _barrier: mpsc::Sender<()>,
    inner: Arc<ShutdownInner>,
}

impl Drop for BarrierToken {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        let (tx, rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(ShutdownInner {
                signal,
                barrier: Mutex::new(Some(tx)),
                drained: tokio::sync::Mutex::new(rx),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// A receiver that flips to `true` once shutdown starts.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.signal.subscribe()
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.signal.borrow()
    }

    /// Number of registered episodes still running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Register an episode. `None` once shutdown has started.
    pub fn register(&self) -> Option<BarrierToken> {
        let barrier = self
            .inner
            .barrier
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tx = barrier.as_ref()?.clone();
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(BarrierToken {
            _barrier: tx,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Broadcast cancellation, then wait for every registered episode.
    pub async fn drain(&self) {
        self.inner.signal.send_replace(true);
        let sender = self
            .inner
            .barrier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        info!(in_flight = self.in_flight(), "shutdown signalled, waiting for episodes");
        let mut drained = self.inner.drained.lock().await;
        // Resolves to None once every token's sender clone is gone.
        while drained.recv().await.is_some() {}
        debug!("shutdown barrier drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn drain_waits_for_tokens() {
        let shutdown = Shutdown::new();
        let token = shutdown.register().unwrap();
        assert_eq!(shutdown.in_flight(), 1);

        let mut signal = shutdown.subscribe();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.drain().await })
        };

        signal.changed().await.unwrap();
        assert!(*signal.borrow());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(token);
        waiter.await.unwrap();
        assert_eq!(shutdown.in_flight(), 0);
    }

    #[tokio::test]
    async fn no_registration_after_drain() {
        let shutdown = Shutdown::new();
        shutdown.drain().await;
        assert!(shutdown.is_triggered());
        assert!(shutdown.register().is_none());
    }
}
