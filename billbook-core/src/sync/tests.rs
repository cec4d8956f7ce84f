use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::SyncChannel;
use crate::clock::ManualClock;
use crate::invoices::InvoiceStore;
use crate::models::NewInvoice;
use crate::store::MemoryStore;

const QUIET: Duration = Duration::from_millis(150);
const WAIT: Duration = Duration::from_secs(5);

fn setup() -> (SyncChannel, InvoiceStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap(),
    ));
    let invoices = InvoiceStore::new(Arc::new(MemoryStore::new()), clock.clone());
    (SyncChannel::new(invoices.clone(), 4), invoices, clock)
}

/// Test that a subscriber receives the current list first and a fresh,
/// complete list after each relevant change.
#[tokio::test]
async fn test_snapshots_follow_changes() {
    let (sync, invoices, clock) = setup();
    invoices.create(NewInvoice::default(), "u1").await.unwrap();

    let mut subscription = sync.subscribe("u1");
    let initial = timeout(WAIT, subscription.recv()).await.unwrap().unwrap();
    assert_eq!(initial.len(), 1);

    clock.advance(ChronoDuration::minutes(1));
    let second = invoices.create(NewInvoice::default(), "u1").await.unwrap();

    let snapshot = timeout(WAIT, subscription.recv()).await.unwrap().unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].id, second.id, "newest invoice comes first");

    invoices
        .delete(second.id.as_deref().unwrap(), "u1")
        .await
        .unwrap();
    let snapshot = timeout(WAIT, subscription.recv()).await.unwrap().unwrap();
    assert_eq!(snapshot.len(), 1);
}

/// Test that changes to another owner's invoices do not wake the subscriber.
#[tokio::test]
async fn test_other_owners_changes_are_ignored() {
    let (sync, invoices, _) = setup();
    let mut subscription = sync.subscribe("u1");
    timeout(WAIT, subscription.recv()).await.unwrap().unwrap();

    invoices.create(NewInvoice::default(), "u2").await.unwrap();
    assert!(timeout(QUIET, subscription.recv()).await.is_err());
}

/// Test that unsubscribing twice is harmless and ends delivery.
#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let (sync, invoices, _) = setup();
    let mut subscription = sync.subscribe("u1");
    timeout(WAIT, subscription.recv()).await.unwrap().unwrap();

    subscription.unsubscribe();
    subscription.unsubscribe();
    assert!(!subscription.is_active());

    invoices.create(NewInvoice::default(), "u1").await.unwrap();
    assert_eq!(timeout(WAIT, subscription.recv()).await.unwrap(), None);
}

/// Test that the subscription works as a `Stream`.
#[tokio::test]
async fn test_subscription_is_a_stream() {
    let (sync, invoices, _) = setup();
    let mut stream = sync.subscribe("u1");

    assert_eq!(timeout(WAIT, stream.next()).await.unwrap().unwrap().len(), 0);
    invoices.create(NewInvoice::default(), "u1").await.unwrap();
    assert_eq!(timeout(WAIT, stream.next()).await.unwrap().unwrap().len(), 1);
}

/// Test the callback flavour: snapshots arrive until the handle unsubscribes.
#[tokio::test]
async fn test_subscribe_with_callback() {
    let (sync, invoices, _) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = sync.subscribe_with("u1", move |snapshot| {
        let _ = tx.send(snapshot.len());
    });
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(0));

    invoices.create(NewInvoice::default(), "u1").await.unwrap();
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(1));

    handle.unsubscribe();
    handle.unsubscribe();
    assert!(!handle.is_active());

    invoices.create(NewInvoice::default(), "u1").await.unwrap();
    let after = timeout(QUIET, rx.recv()).await;
    assert!(!matches!(after, Ok(Some(_))), "no snapshot after unsubscribe");
}
