#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use billbook_core::clock::ManualClock;
use billbook_core::invoices::InvoiceStore;
use billbook_core::models::{LineItem, NewInvoice};
use billbook_core::store::{
    ChangeEvent, Document, DocumentStore, Fields, MemoryStore, Precondition, Query, StoreError,
};
use chrono::{NaiveDate, TimeZone, Utc};
use rust_decimal_macros::dec;
use tokio::sync::broadcast;

/// In-memory store that can be told to fail, for exercising degraded and
/// best-effort paths.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    down_collections: Mutex<HashSet<String>>,
    rejected_updates: Mutex<HashSet<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation on `collection` fails with `Unavailable` until healed.
    pub fn take_down(&self, collection: &str) {
        self.down_collections
            .lock()
            .unwrap()
            .insert(collection.to_string());
    }

    /// Updates of document `id` (any collection) fail with `Unavailable`.
    pub fn reject_updates_of(&self, id: &str) {
        self.rejected_updates.lock().unwrap().insert(id.to_string());
    }

    pub fn heal(&self) {
        self.down_collections.lock().unwrap().clear();
        self.rejected_updates.lock().unwrap().clear();
    }

    fn check(&self, collection: &str) -> Result<(), StoreError> {
        if self.down_collections.lock().unwrap().contains(collection) {
            return Err(StoreError::Unavailable(format!("{} is down", collection)));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn create(&self, collection: &str, fields: Fields) -> Result<Document, StoreError> {
        self.check(collection)?;
        self.inner.create(collection, fields).await
    }

    async fn create_with_id(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> Result<Document, StoreError> {
        self.check(collection)?;
        self.inner.create_with_id(collection, id, fields).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.check(collection)?;
        self.inner.get(collection, id).await
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.check(collection)?;
        self.inner.query(collection, query).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        precondition: Precondition,
    ) -> Result<Document, StoreError> {
        self.check(collection)?;
        if self.rejected_updates.lock().unwrap().contains(id) {
            return Err(StoreError::Unavailable(format!("update of {} rejected", id)));
        }
        self.inner.update(collection, id, fields, precondition).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.check(collection)?;
        self.inner.delete(collection, id).await
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes()
    }
}

pub struct Harness {
    pub store: Arc<FlakyStore>,
    pub clock: Arc<ManualClock>,
    pub invoices: InvoiceStore,
}

/// Engine over a [`FlakyStore`] with the clock at 2024-03-01 09:00:00.250 UTC.
pub fn harness() -> Harness {
    let store = Arc::new(FlakyStore::new());
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
        + chrono::Duration::milliseconds(250);
    let clock = Arc::new(ManualClock::new(start));
    let invoices = InvoiceStore::new(store.clone(), clock.clone());
    Harness {
        store,
        clock,
        invoices,
    }
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

/// Two units at 100, 15 % tax, a fixed discount of 20: totals 200 / 30 / 20 / 210.
pub fn consulting_invoice() -> NewInvoice {
    NewInvoice {
        issue_date: Some(date(2024, 3, 1)),
        due_date: Some(date(2024, 3, 31)),
        items: vec![LineItem::new("line-1", "Consulting", dec!(2), dec!(100))],
        tax_rate: dec!(15),
        discount: billbook_core::models::Discount::fixed(dec!(20)),
        ..NewInvoice::default()
    }
}
