use std::sync::Arc;

use tokio::sync::watch;

/// A signal which is delivered to every handle *once*. Used as the shutdown
/// channel for the gateway, the join loop, and the Ctrl+C handler.
///
/// - Clone to get another handle. Handles can both send and receive.
/// - Every handle observes the signal at most once. A handle cloned after the
///   signal was sent still observes it (once).
/// - Sending more than once is harmless.
///
/// Built on a [`watch`] channel holding `true` once the signal was sent, so
/// late subscribers see the current value instead of missing the event.
#[derive(Debug)]
pub struct NotifyOnce {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    have_recved: bool,
}

impl NotifyOnce {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            have_recved: false,
        }
    }

    /// Send the signal. Every handle waiting in [`recv`](Self::recv) wakes up.
    pub fn send(&self) {
        self.tx.send_replace(true);
    }

    /// Wait for the signal.
    ///
    /// NOTE: once this handle has observed the signal, later calls never
    /// resolve. Clone the handle to observe it again.
    pub async fn recv(&mut self) {
        if self.have_recved {
            return std::future::pending().await;
        }

        // We own an `Arc` of the sender, so the channel can't close under us.
        if self.rx.wait_for(|sent| *sent).await.is_err() {
            return std::future::pending().await;
        }
        self.have_recved = true;
    }

    /// [`recv`](Self::recv) which takes ownership of the handle, for APIs
    /// that want a `Future<Output = ()> + 'static`.
    pub async fn recv_owned(mut self) {
        self.recv().await
    }

    /// Whether the signal has been sent. Does not consume the signal.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        *self.rx.borrow()
    }
}

impl Clone for NotifyOnce {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
            // Every clone gets its own chance to see the signal.
            have_recved: false,
        }
    }
}
