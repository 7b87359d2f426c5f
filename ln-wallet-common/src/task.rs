//! A `#[must_use]` wrapper around [`tokio::task::JoinHandle`].
//!
//! Plain `JoinHandle`s are easy to drop accidentally, which silently detaches
//! the spawned task; every long-running FSM mailbox loop in this workspace is
//! spawned as an `LxTask` so an unused handle is a compile warning, not a
//! vanished task.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;

#[must_use]
pub struct LxTask<T>(JoinHandle<T>);

impl<T: Send + 'static> LxTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl<T> Future for LxTask<T> {
    type Output = Result<T, tokio::task::JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().0).poll(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn spawned_task_runs_to_completion() {
        let task = LxTask::spawn(async { 1 + 1 });
        assert_eq!(task.await.unwrap(), 2);
    }
}
