//! A multi-producer, multi-consumer shutdown signal.
//!
//! Built on a zero-permit [`tokio::sync::Semaphore`]: closing the semaphore
//! wakes every outstanding and future `recv()` at once, which is exactly the
//! broadcast-to-all-subscribers semantics an FSM's mailbox-drain loop wants
//! when selecting between "a message arrived" and "we were asked to stop".

use std::sync::Arc;

use tokio::sync::Semaphore;

/// Cloneable shutdown signal. Any clone can call [`send`](Self::send); every
/// clone (including ones made after `send`) observes the shutdown via
/// [`recv`](Self::recv) or [`try_recv`](Self::try_recv).
#[derive(Clone)]
pub struct ShutdownChannel {
    inner: Arc<Semaphore>,
}

impl ShutdownChannel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
        }
    }

    /// Signal shutdown to every clone of this channel, present and future.
    pub fn send(&self) {
        self.inner.close();
    }

    /// Resolves once [`send`](Self::send) has been called on any clone.
    /// Never resolves otherwise -- select against this, don't await it bare.
    pub async fn recv(&self) {
        self.inner
            .acquire()
            .await
            .map_err(|_| ())
            .expect_err("semaphore has 0 permits and is never added to, so acquire() can only fail by being closed");
    }

    /// Non-blocking check: has shutdown already been signaled?
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Default for ShutdownChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn multiple_sends_doesnt_panic() {
        let shutdown = ShutdownChannel::new();
        shutdown.send();
        shutdown.send();
        shutdown.recv().await;
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_after_close_is_ok() {
        let shutdown = ShutdownChannel::new();
        shutdown.send();
        let subscriber = shutdown.clone();
        subscriber.recv().await;
        assert!(subscriber.try_recv());
    }

    #[tokio::test(start_paused = true)]
    async fn recv_blocks_until_send() {
        let shutdown = ShutdownChannel::new();
        assert!(!shutdown.try_recv());
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.recv().await });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        shutdown.send();
        handle.await.unwrap();
    }
}
