//! Real-time invoice snapshots.
//!
//! A subscription runs a background task that pushes the owner's complete
//! invoice list (newest first) into a bounded channel: once on start and again
//! after every store change that may concern that owner. Consumers never see
//! deltas, only whole lists.

pub mod handlers;
mod subscription;

#[cfg(test)]
mod tests;

pub use handlers::stream_handler;
pub use subscription::{Subscription, SubscriptionHandle};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::invoices::InvoiceStore;
use crate::models::Invoice;
use crate::store::{collections, ChangeEvent};

/// Snapshots buffered per subscriber before the producer waits.
pub const DEFAULT_CAPACITY: usize = 16;

/// Fans store changes out to per-owner snapshot subscriptions.
#[derive(Clone)]
pub struct SyncChannel {
    invoices: InvoiceStore,
    capacity: usize,
}

impl SyncChannel {
    pub fn new(invoices: InvoiceStore, capacity: usize) -> Self {
        Self {
            invoices,
            capacity: capacity.max(1),
        }
    }

    /// Starts streaming `owner`'s invoices.
    ///
    /// The first snapshot is delivered as soon as the initial load finishes.
    /// Must be called from within a tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `owner` - user whose invoices are streamed
    ///
    /// # Returns
    ///
    /// A [`Subscription`] yielding complete snapshots, newest invoice first.
    /// Dropping it or calling [`Subscription::unsubscribe`] stops delivery.
    pub fn subscribe(&self, owner: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let token = CancellationToken::new();

        // Subscribe to the feed before the first load so no change slips
        // between the two.
        let changes = BroadcastStream::new(self.invoices.store().changes());
        tokio::spawn(run_subscription(
            self.invoices.clone(),
            owner.to_string(),
            changes,
            sender,
            token.clone(),
        ));

        info!(owner, "Invoice subscription started");
        Subscription::new(receiver, token)
    }

    /// Like [`subscribe`](Self::subscribe), but hands every snapshot to
    /// `on_snapshot` on a background task.
    ///
    /// # Returns
    ///
    /// A handle that unsubscribes when dropped or when
    /// [`SubscriptionHandle::unsubscribe`] is called.
    pub fn subscribe_with<F>(&self, owner: &str, mut on_snapshot: F) -> SubscriptionHandle
    where
        F: FnMut(Vec<Invoice>) + Send + 'static,
    {
        let mut subscription = self.subscribe(owner);
        let handle = SubscriptionHandle::new(subscription.token());

        tokio::spawn(async move {
            while let Some(snapshot) = subscription.recv().await {
                if !subscription.is_active() {
                    break;
                }
                on_snapshot(snapshot);
            }
        });

        handle
    }
}

async fn run_subscription(
    invoices: InvoiceStore,
    owner: String,
    mut changes: BroadcastStream<ChangeEvent>,
    sender: mpsc::Sender<Vec<Invoice>>,
    token: CancellationToken,
) {
    let owner_value = Value::String(owner.clone());

    if !deliver(&invoices, &owner, &sender, &token).await {
        return;
    }

    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = changes.next() => received,
        };

        match received {
            None => {
                debug!(owner = %owner, "Change feed closed");
                break;
            }
            Some(Ok(event)) if !event.may_touch(collections::INVOICES, "owner_id", &owner_value) => {
                continue;
            }
            Some(Ok(_)) => {}
            Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                debug!(owner = %owner, skipped, "Change feed lagged, refreshing");
            }
        }

        // Collapse whatever else is already queued into the same refresh.
        while let Some(Some(_)) = changes.next().now_or_never() {}

        if !deliver(&invoices, &owner, &sender, &token).await {
            break;
        }
    }

    debug!(owner = %owner, "Invoice subscription stopped");
}

/// Loads and sends one snapshot. Returns `false` once the subscription is
/// gone. A failed load is logged and skipped; the next change retries it.
async fn deliver(
    invoices: &InvoiceStore,
    owner: &str,
    sender: &mpsc::Sender<Vec<Invoice>>,
    token: &CancellationToken,
) -> bool {
    let snapshot = match invoices.list_by_owner(owner).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(owner, error = %e, "Could not load invoice snapshot");
            return !token.is_cancelled();
        }
    };

    tokio::select! {
        _ = token.cancelled() => false,
        sent = sender.send(snapshot) => sent.is_ok(),
    }
}
