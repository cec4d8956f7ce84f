use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::Invoice;

/// Live view of one owner's invoices.
///
/// Each item is the complete list, newest first. Dropping the subscription
/// stops the background task.
pub struct Subscription {
    receiver: mpsc::Receiver<Vec<Invoice>>,
    token: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(receiver: mpsc::Receiver<Vec<Invoice>>, token: CancellationToken) -> Self {
        Self { receiver, token }
    }

    /// Waits for the next snapshot. Returns `None` once unsubscribed or if
    /// the change feed closed.
    pub async fn recv(&mut self) -> Option<Vec<Invoice>> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            snapshot = self.receiver.recv() => snapshot,
        }
    }

    /// Stops delivery. Safe to call more than once; snapshots still buffered
    /// are discarded.
    pub fn unsubscribe(&mut self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        self.receiver.close();
        debug!("Invoice subscription cancelled");
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Stream for Subscription {
    type Item = Vec<Invoice>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.token.is_cancelled() {
            return Poll::Ready(None);
        }
        self.receiver.poll_recv(cx)
    }
}

/// Cancels a callback subscription created by
/// [`SyncChannel::subscribe_with`](super::SyncChannel::subscribe_with).
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle {
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Idempotent.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
